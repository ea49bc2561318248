//! Width Effect Module
//!
//! Mid/side stereo width control, from the `width=` opcode of its
//! `<effect>` block.

use crate::dsp;
use crate::effects::Effect;
use crate::opcode::Opcode;
use crate::range::Range;

/// Stereo width insert.
#[derive(Debug)]
pub struct WidthEffect {
    width: f32,
    span: Vec<f32>,
}

impl WidthEffect {
    pub fn new(width_percent: f32) -> Self {
        Self {
            width: (width_percent / 100.0).clamp(-1.0, 1.0),
            span: Vec::new(),
        }
    }

    /// Reads `width=` in percent from the effect block.
    pub fn from_opcodes(opcodes: &[Opcode]) -> Self {
        let width = opcodes
            .iter()
            .find(|opcode| opcode.name == "width")
            .and_then(|opcode| opcode.read(Range::new(-100.0f32, 100.0)))
            .unwrap_or(100.0);
        Self::new(width)
    }
}

impl Effect for WidthEffect {
    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let num_frames = left.len().min(right.len());
        self.span.resize(num_frames, 0.0);
        dsp::fill(&mut self.span, self.width);
        dsp::width(&self.span, left, right);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_width_collapses_to_mono() {
        let mut effect = WidthEffect::new(0.0);
        let mut left = vec![1.0];
        let mut right = vec![0.0];
        effect.process(&mut left, &mut right);
        assert!((left[0] - 0.5).abs() < 1e-6);
        assert!((right[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_full_width_passes_through() {
        let mut effect = WidthEffect::from_opcodes(&[]);
        let mut left = vec![0.8];
        let mut right = vec![-0.2];
        effect.process(&mut left, &mut right);
        assert!((left[0] - 0.8).abs() < 1e-6);
        assert!((right[0] + 0.2).abs() < 1e-6);
    }
}
