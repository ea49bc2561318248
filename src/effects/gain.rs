//! Gain Effect Module
//!
//! Plain dB gain stage, from the `gain=` opcode of its `<effect>`
//! block.

use crate::config::db_to_mag;
use crate::dsp;
use crate::effects::Effect;
use crate::opcode::Opcode;
use crate::range::Range;

/// Fixed gain insert.
#[derive(Debug)]
pub struct GainEffect {
    gain: f32,
}

impl GainEffect {
    pub fn new(gain_db: f32) -> Self {
        Self {
            gain: db_to_mag(gain_db),
        }
    }

    /// Reads `gain=` in dB from the effect block.
    pub fn from_opcodes(opcodes: &[Opcode]) -> Self {
        let gain_db = opcodes
            .iter()
            .find(|opcode| opcode.name == "gain")
            .and_then(|opcode| opcode.read(Range::new(-96.0f32, 24.0)))
            .unwrap_or(0.0);
        Self::new(gain_db)
    }
}

impl Effect for GainEffect {
    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        dsp::apply_gain1_in_place(self.gain, left);
        dsp::apply_gain1_in_place(self.gain, right);
    }
}
