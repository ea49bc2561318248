//! Effects Module
//!
//! Plug-in effect processors and the effect bus routing of the render
//! loop. Voices accumulate into bus inputs according to their regions'
//! `effectN` sends; each bus runs its effect chain and mixes into the
//! main output and the parallel mix output.
//!
//! Built-in effects stay deliberately small; anything fancier plugs in
//! through the same [`Effect`] trait via the [`EffectFactory`].

pub mod gain;
pub mod lofi;
pub mod nothing;
pub mod width;

pub use gain::GainEffect;
pub use lofi::LofiEffect;
pub use nothing::NothingEffect;
pub use width::WidthEffect;

use crate::buffer::StereoBuffer;
use crate::opcode::Opcode;
use crate::range::Range;

/// A stereo insert effect.
pub trait Effect: Send {
    /// Processes one block in place.
    fn process(&mut self, left: &mut [f32], right: &mut [f32]);

    /// Resets internal state.
    fn reset(&mut self) {}
}

/// Creates effects from `<effect>` block opcodes.
#[derive(Debug, Default)]
pub struct EffectFactory;

impl EffectFactory {
    pub fn new() -> Self {
        Self
    }

    /// Builds an effect from its `type=` value, or None for unknown
    /// kinds.
    pub fn create(
        &self,
        kind: &str,
        opcodes: &[Opcode],
        sample_rate: f32,
    ) -> Option<Box<dyn Effect>> {
        match kind {
            "nothing" => Some(Box::new(NothingEffect)),
            "gain" => Some(Box::new(GainEffect::from_opcodes(opcodes))),
            "width" => Some(Box::new(WidthEffect::from_opcodes(opcodes))),
            "lofi" => Some(Box::new(LofiEffect::from_opcodes(opcodes, sample_rate))),
            _ => None,
        }
    }
}

/// One effect bus with its input buffer and output routing.
pub struct EffectBus {
    effects: Vec<Box<dyn Effect>>,
    buffer: StereoBuffer,

    /// Gain mixed into the main output
    gain_to_main: f32,

    /// Gain mixed into the parallel mix output
    gain_to_mix: f32,
}

impl EffectBus {
    pub fn new(samples_per_block: usize) -> Self {
        Self {
            effects: Vec::new(),
            buffer: StereoBuffer::new(samples_per_block),
            gain_to_main: 0.0,
            gain_to_mix: 0.0,
        }
    }

    /// The main bus: dry through, unity to main.
    pub fn main(samples_per_block: usize) -> Self {
        let mut bus = Self::new(samples_per_block);
        bus.gain_to_main = 1.0;
        bus
    }

    pub fn set_samples_per_block(&mut self, samples_per_block: usize) {
        self.buffer.resize(samples_per_block);
    }

    pub fn add_effect(&mut self, effect: Box<dyn Effect>) {
        self.effects.push(effect);
    }

    pub fn set_gain_to_main(&mut self, gain: f32) {
        self.gain_to_main = gain;
    }

    pub fn set_gain_to_mix(&mut self, gain: f32) {
        self.gain_to_mix = gain;
    }

    pub fn gain_to_main(&self) -> f32 {
        self.gain_to_main
    }

    pub fn gain_to_mix(&self) -> f32 {
        self.gain_to_mix
    }

    /// Applies `directtomain` / `fxNtomain` / `fxNtomix` opcodes.
    pub fn apply_routing_opcode(&mut self, opcode: &Opcode) -> bool {
        let percent = Range::new(0.0f32, 100.0);
        if opcode.name == "directtomain" || opcode.name.ends_with("tomain") {
            if let Some(value) = opcode.read(percent) {
                self.gain_to_main = value / 100.0;
            }
            true
        } else if opcode.name.ends_with("tomix") {
            if let Some(value) = opcode.read(percent) {
                self.gain_to_mix = value / 100.0;
            }
            true
        } else {
            false
        }
    }

    /// The input buffer voices accumulate into.
    pub fn input_mut(&mut self) -> &mut StereoBuffer {
        &mut self.buffer
    }

    /// Clears the input for a new block.
    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
    }

    /// Runs the effect chain over the accumulated input.
    pub fn process(&mut self, num_frames: usize) {
        let (left, right) = self.buffer.both_mut();
        for effect in &mut self.effects {
            effect.process(&mut left[..num_frames], &mut right[..num_frames]);
        }
    }

    /// Mixes the processed bus into the main and mix outputs.
    pub fn mix_outputs_to(&self, main_out: &mut StereoBuffer, mix_out: &mut StereoBuffer) {
        if self.gain_to_main != 0.0 {
            main_out.multiply_add1(self.gain_to_main, &self.buffer);
        }
        if self.gain_to_mix != 0.0 {
            mix_out.multiply_add1(self.gain_to_mix, &self.buffer);
        }
    }

    /// Resets every effect in the chain.
    pub fn reset(&mut self) {
        for effect in &mut self.effects {
            effect.reset();
        }
        self.buffer.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_creates_known_kinds() {
        let factory = EffectFactory::new();
        assert!(factory.create("nothing", &[], 48000.0).is_some());
        assert!(factory.create("gain", &[], 48000.0).is_some());
        assert!(factory.create("width", &[], 48000.0).is_some());
        assert!(factory.create("lofi", &[], 48000.0).is_some());
        assert!(factory.create("fverb", &[], 48000.0).is_none());
    }

    #[test]
    fn test_main_bus_routes_dry_signal() {
        let mut bus = EffectBus::main(4);
        bus.input_mut().fill(0.5);

        let mut main_out = StereoBuffer::new(4);
        let mut mix_out = StereoBuffer::new(4);
        bus.process(4);
        bus.mix_outputs_to(&mut main_out, &mut mix_out);

        assert!(main_out.left().iter().all(|&x| x == 0.5));
        assert!(mix_out.left().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_routing_opcodes() {
        let mut bus = EffectBus::new(4);
        assert!(bus.apply_routing_opcode(&Opcode::new("fx1tomain", "50")));
        assert!(bus.apply_routing_opcode(&Opcode::new("fx1tomix", "25")));
        assert!(!bus.apply_routing_opcode(&Opcode::new("type", "lofi")));
        assert_eq!(bus.gain_to_main(), 0.5);
        assert_eq!(bus.gain_to_mix(), 0.25);
    }

    #[test]
    fn test_bus_clear_zeroes_input() {
        let mut bus = EffectBus::new(4);
        bus.input_mut().fill(1.0);
        bus.clear();
        assert!(bus.input_mut().left().iter().all(|&x| x == 0.0));
    }
}
