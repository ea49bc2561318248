//! LFO (Low-Frequency Oscillator) Module
//!
//! Per-voice low-frequency oscillators feeding the modulation matrix.
//! Rate is in Hz; an optional start delay and fade-in shape the onset the
//! way `lfoN_delay` and `lfoN_fade` describe it.

use crate::dsp::poly_sine;

use std::f32::consts::TAU;

/// LFO waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoWaveform {
    /// Sine wave
    Sine,

    /// Triangle wave, rising first
    Triangle,

    /// Rising sawtooth
    Saw,

    /// Square wave, high first
    Square,
}

/// Configuration for LFO parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LfoConfig {
    /// Oscillation rate in Hz
    pub rate: f32,

    /// Waveform shape
    pub waveform: LfoWaveform,

    /// Seconds before the LFO starts moving
    pub delay: f32,

    /// Seconds over which the amplitude fades in after the delay
    pub fade: f32,

    /// Initial phase in `[0, 1)` cycles
    pub phase_offset: f32,
}

impl Default for LfoConfig {
    fn default() -> Self {
        Self {
            rate: 2.0,
            waveform: LfoWaveform::Sine,
            delay: 0.0,
            fade: 0.0,
            phase_offset: 0.0,
        }
    }
}

/// Low-frequency oscillator with bipolar output in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct Lfo {
    config: LfoConfig,
    sample_rate: f32,

    /// Phase in cycles, wrapped into `[0, 1)`
    phase: f32,

    delay_samples: u32,
    fade_samples: u32,
    fade_position: u32,
}

impl Lfo {
    pub fn new(config: LfoConfig, sample_rate: f32) -> Self {
        let mut lfo = Self {
            config,
            sample_rate,
            phase: 0.0,
            delay_samples: 0,
            fade_samples: 0,
            fade_position: 0,
        };
        lfo.trigger();
        lfo
    }

    /// Restarts the LFO at its phase offset.
    pub fn trigger(&mut self) {
        self.phase = self.config.phase_offset.rem_euclid(1.0);
        self.delay_samples = (self.config.delay.max(0.0) * self.sample_rate) as u32;
        self.fade_samples = (self.config.fade.max(0.0) * self.sample_rate) as u32;
        self.fade_position = 0;
    }

    fn waveform_value(&self) -> f32 {
        let phase = self.phase;
        match self.config.waveform {
            LfoWaveform::Sine => poly_sine(phase * TAU),
            LfoWaveform::Triangle => {
                if phase < 0.25 {
                    4.0 * phase
                } else if phase < 0.75 {
                    2.0 - 4.0 * phase
                } else {
                    4.0 * phase - 4.0
                }
            }
            LfoWaveform::Saw => 2.0 * phase - 1.0,
            LfoWaveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
        }
    }

    /// Produces the next LFO value.
    pub fn next_value(&mut self) -> f32 {
        if self.delay_samples > 0 {
            self.delay_samples -= 1;
            return 0.0;
        }

        let fade_gain = if self.fade_samples > 0 && self.fade_position < self.fade_samples {
            self.fade_position += 1;
            self.fade_position as f32 / self.fade_samples as f32
        } else {
            1.0
        };

        let value = self.waveform_value() * fade_gain;

        self.phase += self.config.rate / self.sample_rate;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }

        value
    }

    /// Renders a whole block of LFO values.
    pub fn get_block(&mut self, output: &mut [f32]) {
        for sample in output.iter_mut() {
            *sample = self.next_value();
        }
    }
}
