//! Envelope Module
//!
//! Envelope generators driving amplitude, pitch and filter modulation.
//! The classic `AdsrEnvelope` runs the full Delay, Attack, Hold, Decay,
//! Sustain, Release cycle with linear segments; `FlexEnvelope` chains an
//! arbitrary list of shaped stages. Both operate in the sample domain and
//! render whole blocks at once so voices can apply them with a single
//! gain pass.

use crate::config::VIRTUALLY_ZERO;

/// Enumeration of possible envelope stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    /// Initial delay before the attack phase
    Delay,

    /// Rising to peak level
    Attack,

    /// Holding at peak level
    Hold,

    /// Falling to sustain level
    Decay,

    /// Holding at sustain level until release
    Sustain,

    /// Releasing back to zero
    Release,

    /// Envelope has finished
    Done,
}

/// Envelope timing in samples and levels in `[0, 1]`.
///
/// Voices build this from a region's envelope description, scaling the
/// second-based opcode values by the sample rate and applying velocity
/// and controller modifiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeParameters {
    /// Samples before the attack starts
    pub delay: u32,

    /// Attack duration in samples
    pub attack: u32,

    /// Hold duration at peak, in samples
    pub hold: u32,

    /// Decay duration in samples
    pub decay: u32,

    /// Sustain level
    pub sustain: f32,

    /// Release duration in samples
    pub release: u32,

    /// Level at the start of the attack
    pub start: f32,
}

impl Default for EnvelopeParameters {
    fn default() -> Self {
        Self {
            delay: 0,
            attack: 0,
            hold: 0,
            decay: 0,
            sustain: 1.0,
            release: 0,
            start: 0.0,
        }
    }
}

/// Block-based ADSR envelope generator.
#[derive(Debug, Clone)]
pub struct AdsrEnvelope {
    stage: EnvelopeStage,
    current_value: f32,
    step: f32,
    samples_left_in_stage: u32,
    parameters: EnvelopeParameters,

    /// Countdown to a requested release, in samples
    release_countdown: Option<u32>,
}

impl AdsrEnvelope {
    /// Creates an idle envelope.
    pub fn new() -> Self {
        Self {
            stage: EnvelopeStage::Done,
            current_value: 0.0,
            step: 0.0,
            samples_left_in_stage: 0,
            parameters: EnvelopeParameters::default(),
            release_countdown: None,
        }
    }

    /// Starts the envelope cycle with the given parameters.
    ///
    /// `extra_delay` is the trigger's sample offset into the block, added
    /// to the envelope's own delay segment.
    pub fn trigger(&mut self, parameters: EnvelopeParameters, extra_delay: u32) {
        self.parameters = parameters;
        self.parameters.sustain = parameters.sustain.clamp(0.0, 1.0);
        self.parameters.start = parameters.start.clamp(0.0, 1.0);
        self.current_value = 0.0;
        self.release_countdown = None;
        self.enter_stage(
            EnvelopeStage::Delay,
            parameters.delay.saturating_add(extra_delay),
        );
    }

    fn enter_stage(&mut self, stage: EnvelopeStage, length: u32) {
        self.stage = stage;
        self.samples_left_in_stage = length;
        self.step = match stage {
            EnvelopeStage::Delay => {
                if length == 0 {
                    return self.enter_stage(EnvelopeStage::Attack, self.parameters.attack);
                }
                0.0
            }
            EnvelopeStage::Attack => {
                self.current_value = self.parameters.start;
                if length == 0 {
                    self.current_value = 1.0;
                    return self.enter_stage(EnvelopeStage::Hold, self.parameters.hold);
                }
                (1.0 - self.parameters.start) / length as f32
            }
            EnvelopeStage::Hold => {
                self.current_value = 1.0;
                if length == 0 {
                    return self.enter_stage(EnvelopeStage::Decay, self.parameters.decay);
                }
                0.0
            }
            EnvelopeStage::Decay => {
                if length == 0 {
                    self.current_value = self.parameters.sustain;
                    return self.enter_stage(EnvelopeStage::Sustain, 0);
                }
                (self.parameters.sustain - 1.0) / length as f32
            }
            EnvelopeStage::Sustain => {
                self.current_value = self.parameters.sustain;
                0.0
            }
            EnvelopeStage::Release => {
                if length == 0 {
                    self.current_value = 0.0;
                    return self.enter_stage(EnvelopeStage::Done, 0);
                }
                -self.current_value / length as f32
            }
            EnvelopeStage::Done => {
                self.current_value = 0.0;
                0.0
            }
        };
    }

    /// Requests a release `delay` samples into the next processed span.
    pub fn start_release(&mut self, delay: usize) {
        if self.stage == EnvelopeStage::Done {
            return;
        }
        let delay = delay as u32;
        match self.release_countdown {
            Some(current) if current <= delay => {}
            _ => self.release_countdown = Some(delay),
        }
    }

    /// Overrides the release segment length before requesting it, for
    /// the fixed off-group fade and voice stealing.
    pub fn set_release_length(&mut self, release_samples: u32) {
        self.parameters.release = release_samples;
    }

    /// Produces the next envelope value.
    pub fn next_value(&mut self) -> f32 {
        if let Some(countdown) = self.release_countdown {
            if countdown == 0 {
                self.release_countdown = None;
                if self.stage != EnvelopeStage::Release && self.stage != EnvelopeStage::Done {
                    self.enter_stage(EnvelopeStage::Release, self.parameters.release);
                }
            } else {
                self.release_countdown = Some(countdown - 1);
            }
        }

        let value = self.current_value;

        match self.stage {
            EnvelopeStage::Sustain | EnvelopeStage::Done => {}
            _ => {
                if self.samples_left_in_stage > 0 {
                    self.samples_left_in_stage -= 1;
                    self.current_value += self.step;
                }
                if self.samples_left_in_stage == 0 {
                    self.advance_stage();
                }
            }
        }

        value
    }

    fn advance_stage(&mut self) {
        match self.stage {
            EnvelopeStage::Delay => self.enter_stage(EnvelopeStage::Attack, self.parameters.attack),
            EnvelopeStage::Attack => self.enter_stage(EnvelopeStage::Hold, self.parameters.hold),
            EnvelopeStage::Hold => self.enter_stage(EnvelopeStage::Decay, self.parameters.decay),
            EnvelopeStage::Decay => self.enter_stage(EnvelopeStage::Sustain, 0),
            EnvelopeStage::Release => self.enter_stage(EnvelopeStage::Done, 0),
            EnvelopeStage::Sustain | EnvelopeStage::Done => {}
        }
    }

    /// Renders a whole block of envelope values.
    pub fn get_block(&mut self, output: &mut [f32]) {
        for sample in output.iter_mut() {
            *sample = self.next_value();
        }
    }

    /// Current envelope level, used by the stealing policy.
    pub fn value(&self) -> f32 {
        self.current_value
    }

    /// Current stage.
    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    /// True while the envelope still produces audible output.
    pub fn is_smoothing(&self) -> bool {
        match self.stage {
            EnvelopeStage::Done => false,
            EnvelopeStage::Release => self.current_value > VIRTUALLY_ZERO,
            _ => true,
        }
    }

    /// True once a release was requested or entered.
    pub fn is_released(&self) -> bool {
        self.release_countdown.is_some()
            || self.stage == EnvelopeStage::Release
            || self.stage == EnvelopeStage::Done
    }

    /// Returns the envelope to the idle state.
    pub fn reset(&mut self) {
        self.stage = EnvelopeStage::Done;
        self.current_value = 0.0;
        self.step = 0.0;
        self.samples_left_in_stage = 0;
        self.release_countdown = None;
    }
}

impl Default for AdsrEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-controller modifier on an envelope time or level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CcModifier {
    pub cc: usize,

    /// Added contribution at full controller value
    pub depth: f32,
}

/// Region-side envelope description, in seconds and normalized levels.
///
/// Holds the raw opcode values plus their velocity and controller
/// modifiers; voices convert it to sample-domain [`EnvelopeParameters`]
/// when they start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EgDescription {
    pub delay: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    /// Sustain level in `[0, 1]`
    pub sustain: f32,
    pub release: f32,
    /// Attack start level in `[0, 1]`
    pub start: f32,

    pub vel2delay: f32,
    pub vel2attack: f32,
    pub vel2hold: f32,
    pub vel2decay: f32,
    pub vel2sustain: f32,
    pub vel2release: f32,

    pub cc_delay: Vec<CcModifier>,
    pub cc_attack: Vec<CcModifier>,
    pub cc_hold: Vec<CcModifier>,
    pub cc_decay: Vec<CcModifier>,
    pub cc_sustain: Vec<CcModifier>,
    pub cc_release: Vec<CcModifier>,
}

impl EgDescription {
    /// The conventional amplitude envelope default: instant attack, full
    /// sustain.
    pub fn default_amp_eg() -> Self {
        Self {
            sustain: 1.0,
            ..Self::default()
        }
    }

    fn modified(base: f32, vel2: f32, velocity: f32, ccs: &[CcModifier], cc_value: &dyn Fn(usize) -> f32) -> f32 {
        let mut value = base + vel2 * velocity;
        for modifier in ccs {
            value += modifier.depth * cc_value(modifier.cc);
        }
        value
    }

    /// Converts to sample-domain parameters for one trigger.
    pub fn to_parameters(
        &self,
        sample_rate: f32,
        velocity: f32,
        cc_value: &dyn Fn(usize) -> f32,
    ) -> EnvelopeParameters {
        let seconds = |value: f32| (value.max(0.0) * sample_rate) as u32;

        EnvelopeParameters {
            delay: seconds(Self::modified(self.delay, self.vel2delay, velocity, &self.cc_delay, cc_value)),
            attack: seconds(Self::modified(self.attack, self.vel2attack, velocity, &self.cc_attack, cc_value)),
            hold: seconds(Self::modified(self.hold, self.vel2hold, velocity, &self.cc_hold, cc_value)),
            decay: seconds(Self::modified(self.decay, self.vel2decay, velocity, &self.cc_decay, cc_value)),
            sustain: Self::modified(self.sustain, self.vel2sustain, velocity, &self.cc_sustain, cc_value)
                .clamp(0.0, 1.0),
            release: seconds(Self::modified(self.release, self.vel2release, velocity, &self.cc_release, cc_value)),
            start: self.start.clamp(0.0, 1.0),
        }
    }
}

/// One stage of a flex envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlexStage {
    /// Stage duration in seconds
    pub time: f32,

    /// Level reached at the end of the stage
    pub level: f32,

    /// Shape exponent; 1 is linear, above 1 starts slow, below 1 starts
    /// fast
    pub shape: f32,
}

impl Default for FlexStage {
    fn default() -> Self {
        Self {
            time: 0.0,
            level: 0.0,
            shape: 1.0,
        }
    }
}

/// Description of a multi-stage envelope, in seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlexEnvelopeDescription {
    /// Stages in order
    pub stages: Vec<FlexStage>,

    /// Stage index the envelope sustains after, if any
    pub sustain_stage: Option<usize>,
}

/// Multi-stage envelope generator.
#[derive(Debug, Clone)]
pub struct FlexEnvelope {
    description: FlexEnvelopeDescription,
    sample_rate: f32,
    stage_index: usize,
    samples_into_stage: u32,
    stage_length: u32,
    from_level: f32,
    current_value: f32,
    sustaining: bool,
    released: bool,
    active: bool,
}

impl FlexEnvelope {
    pub fn new(description: FlexEnvelopeDescription, sample_rate: f32) -> Self {
        Self {
            description,
            sample_rate,
            stage_index: 0,
            samples_into_stage: 0,
            stage_length: 0,
            from_level: 0.0,
            current_value: 0.0,
            sustaining: false,
            released: false,
            active: false,
        }
    }

    /// Starts the envelope from level zero.
    pub fn trigger(&mut self) {
        self.stage_index = 0;
        self.samples_into_stage = 0;
        self.from_level = 0.0;
        self.current_value = 0.0;
        self.sustaining = false;
        self.released = false;
        self.active = !self.description.stages.is_empty();
        if self.active {
            self.stage_length = self.length_of(0);
        }
    }

    /// Releases the envelope; it continues through any post-sustain
    /// stages.
    pub fn release(&mut self) {
        self.released = true;
        if self.sustaining {
            self.sustaining = false;
            self.enter_next_stage();
        }
    }

    fn length_of(&self, index: usize) -> u32 {
        let stage = &self.description.stages[index];
        (stage.time.max(0.0) * self.sample_rate) as u32
    }

    fn enter_next_stage(&mut self) {
        self.from_level = self.current_value;
        self.stage_index += 1;
        self.samples_into_stage = 0;
        if self.stage_index >= self.description.stages.len() {
            self.active = false;
        } else {
            self.stage_length = self.length_of(self.stage_index);
        }
    }

    /// Produces the next envelope value.
    pub fn next_value(&mut self) -> f32 {
        if !self.active || self.sustaining {
            return self.current_value;
        }

        let stage = self.description.stages[self.stage_index];
        if self.stage_length == 0 {
            self.current_value = stage.level;
        } else {
            let t = self.samples_into_stage as f32 / self.stage_length as f32;
            let shaped = t.powf(stage.shape.max(0.01));
            self.current_value = self.from_level + (stage.level - self.from_level) * shaped;
            self.samples_into_stage += 1;
        }

        if self.stage_length == 0 || self.samples_into_stage >= self.stage_length {
            self.current_value = stage.level;
            if !self.released && self.description.sustain_stage == Some(self.stage_index) {
                self.sustaining = true;
            } else {
                self.enter_next_stage();
            }
        }

        self.current_value
    }

    /// Renders a whole block of envelope values.
    pub fn get_block(&mut self, output: &mut [f32]) {
        for sample in output.iter_mut() {
            *sample = self.next_value();
        }
    }

    /// True until the last stage has completed.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn value(&self) -> f32 {
        self.current_value
    }
}
