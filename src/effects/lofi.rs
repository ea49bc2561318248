//! Lofi Effect Module
//!
//! Bit depth reduction and sample-and-hold decimation for a digital
//! vintage character. Configured with `bitred=` (bits removed towards
//! 1-bit) and `decim=` (0-100, scaling the hold interval) opcodes.

use crate::effects::Effect;
use crate::opcode::Opcode;
use crate::range::Range;

/// Bit crusher and decimator insert.
#[derive(Debug)]
pub struct LofiEffect {
    /// Quantization step; zero disables bit reduction
    quantize_step: f32,

    /// Samples to hold per input sample; one disables decimation
    hold_interval: usize,

    counter: usize,
    held_left: f32,
    held_right: f32,
}

impl LofiEffect {
    pub fn new(bitred: f32, decim: f32, _sample_rate: f32) -> Self {
        // bitred 0..100 maps to 16 bits down to 1 bit
        let quantize_step = if bitred > 0.0 {
            let bits = 16.0 - (bitred / 100.0) * 15.0;
            2.0 / 2.0f32.powf(bits)
        } else {
            0.0
        };

        // decim 0..100 maps to holding 1 through 64 samples
        let hold_interval = 1 + ((decim.clamp(0.0, 100.0) / 100.0) * 63.0) as usize;

        Self {
            quantize_step,
            hold_interval,
            counter: 0,
            held_left: 0.0,
            held_right: 0.0,
        }
    }

    pub fn from_opcodes(opcodes: &[Opcode], sample_rate: f32) -> Self {
        let percent = Range::new(0.0f32, 100.0);
        let read = |name: &str| {
            opcodes
                .iter()
                .find(|opcode| opcode.name == name)
                .and_then(|opcode| opcode.read(percent))
                .unwrap_or(0.0)
        };
        Self::new(read("bitred"), read("decim"), sample_rate)
    }

    #[inline]
    fn crush(&self, sample: f32) -> f32 {
        if self.quantize_step > 0.0 {
            (sample / self.quantize_step).round() * self.quantize_step
        } else {
            sample
        }
    }
}

impl Effect for LofiEffect {
    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let num_frames = left.len().min(right.len());
        for frame in 0..num_frames {
            if self.counter == 0 {
                self.held_left = self.crush(left[frame]);
                self.held_right = self.crush(right[frame]);
            }
            self.counter = (self.counter + 1) % self.hold_interval;
            left[frame] = self.held_left;
            right[frame] = self.held_right;
        }
    }

    fn reset(&mut self) {
        self.counter = 0;
        self.held_left = 0.0;
        self.held_right = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_reduction_passes_through() {
        let mut effect = LofiEffect::new(0.0, 0.0, 48000.0);
        let mut left = vec![0.123, -0.456];
        let mut right = left.clone();
        effect.process(&mut left, &mut right);
        assert_eq!(left, vec![0.123, -0.456]);
    }

    #[test]
    fn test_bit_reduction_quantizes() {
        // Full reduction leaves 1-bit steps of size 1.0
        let mut effect = LofiEffect::new(100.0, 0.0, 48000.0);
        let mut left = vec![0.3, 0.6];
        let mut right = left.clone();
        effect.process(&mut left, &mut right);
        assert_eq!(left, vec![0.0, 1.0]);
    }

    #[test]
    fn test_decimation_holds_samples() {
        let mut effect = LofiEffect::new(0.0, 100.0, 48000.0);
        let mut left: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut right = left.clone();
        effect.process(&mut left, &mut right);
        // 64-sample hold keeps the first value for the whole span
        assert!(left.iter().all(|&x| x == 0.0));
    }
}
