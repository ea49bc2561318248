//! Modulation Sources Module
//!
//! Generator state behind each matrix source: the per-cycle controller
//! ramp builder and the per-voice LFO and envelope generators.

use crate::curve::CurveSet;
use crate::envelope::{AdsrEnvelope, FlexEnvelope};
use crate::filter::Smoother;
use crate::lfo::Lfo;
use crate::midi_state::MidiEvent;

/// Per-cycle state of a controller source.
#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    smoother: Smoother,
    initialized: bool,
}

impl ControllerState {
    /// Configures the smoother; called at registration and on sample
    /// rate changes.
    pub fn setup(&mut self, smooth: f32, sample_rate: f32) {
        self.smoother.set_smoothing(smooth, sample_rate);
    }

    /// Renders a controller block from its event list.
    ///
    /// Each event is mapped through the chosen curve, the block ramps
    /// linearly between events, values snap to `step` when set, and the
    /// result runs through the one-pole smoother.
    pub fn generate(
        &mut self,
        events: &[MidiEvent],
        curves: &CurveSet,
        curve_index: usize,
        step: f32,
        output: &mut [f32],
    ) {
        let curve = curves.get(curve_index);
        let num_frames = output.len();

        let transform = |value: f32| -> f32 { curve.eval_normalized(value) };

        match events {
            [] => crate::dsp::fill(output, transform(0.0)),
            [only] => crate::dsp::fill(output, transform(only.value)),
            _ => {
                let mut current = transform(events[0].value);
                let mut frame = events[0].delay.min(num_frames);
                crate::dsp::fill(&mut output[..frame], current);
                for pair in events.windows(2) {
                    let from = &pair[0];
                    let to = &pair[1];
                    let start = from.delay.min(num_frames);
                    let end = to.delay.min(num_frames);
                    let target = transform(to.value);
                    if end > start {
                        let span = (end - start) as f32;
                        for (offset, sample) in output[start..end].iter_mut().enumerate() {
                            let t = offset as f32 / span;
                            *sample = current + (target - current) * t;
                        }
                    }
                    frame = end;
                    current = target;
                }
                for sample in output[frame..].iter_mut() {
                    *sample = current;
                }
            }
        }

        // Quantization applies to the ramped output, not the endpoints
        if step > 0.0 {
            for sample in output.iter_mut() {
                *sample = (*sample / step).round() * step;
            }
        }

        if !self.initialized {
            // Avoid a smoothing sweep from zero on the very first block
            self.smoother.reset(output.first().copied().unwrap_or(0.0));
            self.initialized = true;
        }
        self.smoother.process(output);
    }
}

/// Per-voice generator slot.
#[derive(Debug, Clone)]
pub enum VoiceGenerator {
    Lfo(Lfo),
    FlexEg(FlexEnvelope),
    AdsrEg(AdsrEnvelope),
}

impl VoiceGenerator {
    /// Renders one block from the generator.
    pub fn generate(&mut self, output: &mut [f32]) {
        match self {
            VoiceGenerator::Lfo(lfo) => lfo.get_block(output),
            VoiceGenerator::FlexEg(envelope) => envelope.get_block(output),
            VoiceGenerator::AdsrEg(envelope) => envelope.get_block(output),
        }
    }

    /// Requests a release on envelope generators; LFOs ignore it.
    pub fn release(&mut self, delay: usize) {
        match self {
            VoiceGenerator::Lfo(_) => {}
            VoiceGenerator::FlexEg(envelope) => envelope.release(),
            VoiceGenerator::AdsrEg(envelope) => envelope.start_release(delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurveSet;

    fn generate(events: &[MidiEvent], step: f32, frames: usize) -> Vec<f32> {
        let mut state = ControllerState::default();
        let curves = CurveSet::with_defaults();
        let mut output = vec![0.0; frames];
        state.generate(events, &curves, 0, step, &mut output);
        output
    }

    #[test]
    fn test_single_event_fills_block() {
        let events = [MidiEvent { delay: 0, value: 0.5 }];
        let output = generate(&events, 0.0, 8);
        assert!(output.iter().all(|&x| (x - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_two_events_ramp_between() {
        let events = [
            MidiEvent { delay: 0, value: 0.0 },
            MidiEvent { delay: 8, value: 1.0 },
        ];
        let output = generate(&events, 0.0, 16);
        assert_eq!(output[0], 0.0);
        assert!((output[4] - 0.5).abs() < 1e-6);
        // Holds the final value after the last event
        assert!(output[8..].iter().all(|&x| (x - 1.0).abs() < 1e-6));
        // Monotonic ramp
        assert!(output.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_step_quantization() {
        let events = [
            MidiEvent { delay: 0, value: 0.0 },
            MidiEvent { delay: 4, value: 1.0 },
        ];
        let output = generate(&events, 0.5, 8);
        for value in &output {
            let remainder = (value / 0.5).fract();
            assert!(
                remainder.abs() < 1e-4 || (remainder.abs() - 1.0).abs() < 1e-4,
                "value {} not on step grid",
                value
            );
        }
    }

    #[test]
    fn test_curve_is_applied() {
        let events = [MidiEvent { delay: 0, value: 1.0 }];
        let mut state = ControllerState::default();
        let curves = CurveSet::with_defaults();
        let mut output = vec![0.0; 4];
        // Curve 2 is the inverted default
        state.generate(&events, &curves, 2, 0.0, &mut output);
        assert!(output.iter().all(|&x| x.abs() < 1e-6));
    }

    #[test]
    fn test_smoothing_softens_jump() {
        let mut state = ControllerState::default();
        state.setup(0.005, 1000.0);
        let curves = CurveSet::with_defaults();

        // First block settles at zero
        let mut output = vec![0.0; 4];
        state.generate(&[MidiEvent { delay: 0, value: 0.0 }], &curves, 0, 0.0, &mut output);

        // A full-scale jump is smoothed, not instantaneous
        state.generate(&[MidiEvent { delay: 0, value: 1.0 }], &curves, 0, 0.0, &mut output);
        assert!(output[0] < 0.5);
        assert!(output.windows(2).all(|w| w[1] >= w[0]));
    }
}
