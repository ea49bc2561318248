//! Region Module
//!
//! One `<region>` rule: the sample source, the trigger predicates, the
//! playback and amplitude parameters, and the per-event latched state the
//! dispatcher updates. Regions are immutable after SFZ load apart from
//! the latched booleans, counters and the delayed-release queue, which
//! only the MIDI dispatch path touches.

use crate::config::{self, cents_to_ratio, db_to_mag};
use crate::curve::Curve;
use crate::envelope::{CcModifier, EgDescription, FlexEnvelopeDescription, FlexStage};
use crate::file_pool::FileHandle;
use crate::filter::{EqDescription, FilterDescription, FilterType};
use crate::lfo::{LfoConfig, LfoWaveform};
use crate::midi_state::MidiState;
use crate::opcode::Opcode;
use crate::range::Range;

use std::path::PathBuf;
use std::sync::Arc;

/// What a region plays.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SampleSource {
    /// No sample named; the region is dropped at load
    #[default]
    None,

    /// A sample file, relative to the instrument's root directory
    File(PathBuf),

    /// The `*sine` test generator
    Sine,

    /// The `*silence` generator
    Silence,
}

impl SampleSource {
    pub fn is_generator(&self) -> bool {
        matches!(self, SampleSource::Sine | SampleSource::Silence)
    }

    pub fn file_path(&self) -> Option<&PathBuf> {
        match self {
            SampleSource::File(path) => Some(path),
            _ => None,
        }
    }
}

/// Trigger kinds for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    #[default]
    Attack,
    First,
    Legato,
    Release,
    ReleaseKey,
}

impl Trigger {
    pub fn is_release(&self) -> bool {
        matches!(self, Trigger::Release | Trigger::ReleaseKey)
    }
}

/// Loop behavior of a sampled region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    NoLoop,
    OneShot,
    LoopContinuous,
    LoopSustain,
}

/// Behavior when another region's group silences this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffMode {
    Fast,
    #[default]
    Normal,
}

/// Crossfade gain laws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossfadeCurve {
    /// Equal power: square-root gains
    #[default]
    Power,

    /// Linear gains
    Gain,
}

/// Velocity source for `release_key` regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VelocityOverride {
    #[default]
    Current,
    Previous,
}

/// Modulation source named by a region connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ModSourceSpec {
    Cc {
        cc: usize,
        curve: usize,
        smooth: f32,
        step: f32,
    },
    Lfo(usize),
    FlexEg(usize),
    PitchEg,
    FilterEg,
}

/// Modulation target named by a region connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModTargetSpec {
    Amplitude,
    Pan,
    Width,
    Position,
    Pitch,
    Volume,
    FilterCutoff(usize),
    EqGain(usize),
}

/// One modulation routing parsed from region opcodes.
#[derive(Debug, Clone, PartialEq)]
pub struct ModConnection {
    pub source: ModSourceSpec,
    pub target: ModTargetSpec,
    pub depth: f32,
    pub vel_to_depth: f32,
}

/// Which part of a controller routing an opcode updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CcField {
    Depth,
    Curve,
    Smooth,
    Step,
}

/// A CC crossfade range with direction.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CcCrossfade {
    cc: usize,
    range: Range<f32>,
    fade_in: bool,
}

/// A sparse per-CC condition with its latched satisfaction.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CcCondition {
    cc: usize,
    range: Range<f32>,
    satisfied: bool,
}

/// One `<region>` header and its latched activation state.
#[derive(Debug, Clone)]
pub struct Region {
    /// Stable id assigned at parse time
    pub id: u32,

    // Sound source
    pub sample: SampleSource,
    pub delay: f32,
    pub delay_random: f32,
    pub offset: u32,
    pub offset_random: u32,
    pub sample_end: Option<u32>,
    pub sample_count: Option<u32>,
    pub loop_mode: Option<LoopMode>,
    pub loop_start: Option<u32>,
    pub loop_end: Option<u32>,

    // Grouping
    pub group: u32,
    pub off_by: Option<u32>,
    pub off_mode: OffMode,
    pub polyphony: Option<usize>,

    // Trigger predicates
    pub key_range: Range<i32>,
    pub velocity_range: Range<f32>,
    pub channel_range: Range<i32>,
    cc_conditions: Vec<CcCondition>,
    pub bend_range: Range<f32>,
    pub aftertouch_range: Range<f32>,
    pub bpm_range: Range<f32>,
    pub rand_range: Range<f32>,
    pub sequence_length: u32,
    pub sequence_position: u32,
    pub keyswitch_range: Range<i32>,
    pub keyswitch_last: Option<i32>,
    pub keyswitch_down: Option<i32>,
    pub keyswitch_up: Option<i32>,
    pub previous_note: Option<i32>,
    pub velocity_override: VelocityOverride,
    pub trigger: Trigger,
    cc_triggers: Vec<(usize, Range<f32>)>,

    // Amplitude
    pub volume: f32,
    pub amplitude: f32,
    pub pan: f32,
    pub position: f32,
    pub width: f32,
    pub amp_keycenter: i32,
    pub amp_keytrack: f32,
    pub amp_veltrack: f32,
    pub amp_random: f32,
    pub rt_decay: f32,
    velocity_points: Vec<(u8, f32)>,
    velocity_curve: Option<Curve>,

    // Crossfades
    pub crossfade_key_in: Range<i32>,
    pub crossfade_key_out: Range<i32>,
    pub crossfade_vel_in: Range<f32>,
    pub crossfade_vel_out: Range<f32>,
    pub crossfade_key_curve: CrossfadeCurve,
    pub crossfade_vel_curve: CrossfadeCurve,
    pub crossfade_cc_curve: CrossfadeCurve,
    cc_crossfades: Vec<CcCrossfade>,

    // Pitch
    pub pitch_keycenter: i32,
    pub pitch_keytrack: f32,
    pub pitch_veltrack: f32,
    pub pitch_random: f32,
    pub transpose: i32,
    pub tune: f32,
    pub bend_up: f32,
    pub bend_down: f32,

    // Envelopes and modulators
    pub amplitude_eg: EgDescription,
    pub pitch_eg: Option<EgDescription>,
    pub filter_eg: Option<EgDescription>,
    pub pitch_eg_depth: f32,
    pub filter_eg_depth: f32,
    pub flex_egs: Vec<FlexEnvelopeDescription>,
    pub lfos: Vec<LfoConfig>,
    pub filters: Vec<FilterDescription>,
    pub eq_bands: Vec<EqDescription>,
    pub connections: Vec<ModConnection>,

    // Effect routing: index 0 is the main bus
    pub effect_sends: Vec<f32>,

    // Resolved sample data
    pub handle: Option<Arc<FileHandle>>,

    // Latched per-event state
    key_switched: bool,
    previous_key_switched: bool,
    sequence_switched: bool,
    pitch_switched: bool,
    bpm_switched: bool,
    aftertouch_switched: bool,
    all_cc_switched: bool,
    active_notes_in_range: i32,
    sequence_counter: u32,
    pub delayed_releases: Vec<(u8, f32)>,
    pub rt_dead: bool,
    last_note_velocities: [f32; 128],
}

impl Region {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            sample: SampleSource::None,
            delay: 0.0,
            delay_random: 0.0,
            offset: 0,
            offset_random: 0,
            sample_end: None,
            sample_count: None,
            loop_mode: None,
            loop_start: None,
            loop_end: None,
            group: 0,
            off_by: None,
            off_mode: OffMode::default(),
            polyphony: None,
            key_range: Range::new(0, 127),
            velocity_range: Range::new(0.0, 1.0),
            channel_range: Range::new(1, 16),
            cc_conditions: Vec::new(),
            bend_range: Range::new(-1.0, 1.0),
            aftertouch_range: Range::new(0.0, 1.0),
            bpm_range: Range::new(0.0, 500.0),
            rand_range: Range::new(0.0, 1.0),
            sequence_length: 1,
            sequence_position: 1,
            keyswitch_range: Range::new(0, 127),
            keyswitch_last: None,
            keyswitch_down: None,
            keyswitch_up: None,
            previous_note: None,
            velocity_override: VelocityOverride::default(),
            trigger: Trigger::default(),
            cc_triggers: Vec::new(),
            volume: 0.0,
            amplitude: 100.0,
            pan: 0.0,
            position: 0.0,
            width: 100.0,
            amp_keycenter: 60,
            amp_keytrack: 0.0,
            amp_veltrack: 1.0,
            amp_random: 0.0,
            rt_decay: 0.0,
            velocity_points: Vec::new(),
            velocity_curve: None,
            crossfade_key_in: Range::new(0, 0),
            crossfade_key_out: Range::new(127, 127),
            crossfade_vel_in: Range::new(0.0, 0.0),
            crossfade_vel_out: Range::new(1.0, 1.0),
            crossfade_key_curve: CrossfadeCurve::default(),
            crossfade_vel_curve: CrossfadeCurve::default(),
            crossfade_cc_curve: CrossfadeCurve::default(),
            cc_crossfades: Vec::new(),
            pitch_keycenter: 60,
            pitch_keytrack: 100.0,
            pitch_veltrack: 0.0,
            pitch_random: 0.0,
            transpose: 0,
            tune: 0.0,
            bend_up: 200.0,
            bend_down: -200.0,
            amplitude_eg: EgDescription::default_amp_eg(),
            pitch_eg: None,
            filter_eg: None,
            pitch_eg_depth: 0.0,
            filter_eg_depth: 0.0,
            flex_egs: Vec::new(),
            lfos: Vec::new(),
            filters: Vec::new(),
            eq_bands: Vec::new(),
            connections: Vec::new(),
            effect_sends: vec![1.0],
            handle: None,
            key_switched: true,
            previous_key_switched: true,
            sequence_switched: true,
            pitch_switched: true,
            bpm_switched: true,
            aftertouch_switched: true,
            all_cc_switched: true,
            active_notes_in_range: 0,
            sequence_counter: 0,
            delayed_releases: Vec::new(),
            rt_dead: false,
            last_note_velocities: [0.0; 128],
        }
    }

    // ------------------------------------------------------------------
    // Opcode parsing

    /// Applies one opcode to this region.
    ///
    /// Best effort: malformed values are clamped or dropped and never
    /// fail the load. Returns false for opcodes the region does not
    /// understand so the caller can report them.
    pub fn parse_opcode(&mut self, opcode: &Opcode) -> bool {
        let key_bounds = Range::new(0, 127);
        let vel7 = Range::new(0.0f32, 127.0);

        match opcode.name.as_str() {
            // Sound source
            "sample" => {
                let value = opcode.value.replace('\\', "/");
                self.sample = match value.as_str() {
                    "*sine" => SampleSource::Sine,
                    "*silence" => SampleSource::Silence,
                    "" => SampleSource::None,
                    path => SampleSource::File(PathBuf::from(path)),
                };
            }
            "delay" => set_value(opcode, &mut self.delay, Range::new(0.0, 100.0)),
            "delay_random" => set_value(opcode, &mut self.delay_random, Range::new(0.0, 100.0)),
            "offset" => set_value(opcode, &mut self.offset, Range::new(0, u32::MAX)),
            "offset_random" => set_value(opcode, &mut self.offset_random, Range::new(0, u32::MAX)),
            "end" => {
                if let Some(value) = opcode.read(Range::new(0u32, u32::MAX)) {
                    self.sample_end = Some(value);
                }
            }
            "count" => {
                if let Some(value) = opcode.read(Range::new(0u32, u32::MAX)) {
                    self.sample_count = Some(value);
                    self.loop_mode = Some(LoopMode::OneShot);
                }
            }
            "loopmode" | "loop_mode" => match opcode.value.as_str() {
                "no_loop" => self.loop_mode = Some(LoopMode::NoLoop),
                "one_shot" => self.loop_mode = Some(LoopMode::OneShot),
                "loop_continuous" => self.loop_mode = Some(LoopMode::LoopContinuous),
                "loop_sustain" => self.loop_mode = Some(LoopMode::LoopSustain),
                other => log::warn!("unknown loop mode: {}", other),
            },
            "loopstart" | "loop_start" => {
                self.loop_start = opcode.read(Range::new(0u32, u32::MAX));
            }
            "loopend" | "loop_end" => {
                self.loop_end = opcode.read(Range::new(0u32, u32::MAX));
            }

            // Voice lifecycle
            "group" => set_value(opcode, &mut self.group, Range::new(0, u32::MAX)),
            "offby" | "off_by" => self.off_by = opcode.read(Range::new(0u32, u32::MAX)),
            "off_mode" => match opcode.value.as_str() {
                "fast" => self.off_mode = OffMode::Fast,
                "normal" => self.off_mode = OffMode::Normal,
                other => log::warn!("unknown off mode: {}", other),
            },
            "polyphony" => {
                self.polyphony = opcode.read(Range::new(1u32, 1024)).map(|value| value as usize)
            }

            // Key mapping
            "lokey" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.key_range.set_start(value);
                }
            }
            "hikey" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.key_range.set_end(value);
                }
            }
            "key" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.key_range = Range::new(value, value);
                    self.pitch_keycenter = value;
                }
            }
            "lovel" => {
                if let Some(value) = opcode.read(vel7) {
                    self.velocity_range.set_start(value / 127.0);
                }
            }
            "hivel" => {
                if let Some(value) = opcode.read(vel7) {
                    self.velocity_range.set_end(value / 127.0);
                }
            }

            // MIDI conditions
            "lochan" => {
                if let Some(value) = opcode.read(Range::new(1, 16)) {
                    self.channel_range.set_start(value);
                }
            }
            "hichan" => {
                if let Some(value) = opcode.read(Range::new(1, 16)) {
                    self.channel_range.set_end(value);
                }
            }
            "lobend" => {
                if let Some(value) = opcode.read(Range::new(-8192.0f32, 8192.0)) {
                    self.bend_range.set_start(value / 8192.0);
                }
            }
            "hibend" => {
                if let Some(value) = opcode.read(Range::new(-8192.0f32, 8192.0)) {
                    self.bend_range.set_end(value / 8192.0);
                }
            }
            "locc" => {
                if let (Some(cc), Some(value)) = (opcode.parameter, opcode.read(vel7)) {
                    self.cc_condition(cc as usize).range.set_start(value / 127.0);
                }
            }
            "hicc" => {
                if let (Some(cc), Some(value)) = (opcode.parameter, opcode.read(vel7)) {
                    self.cc_condition(cc as usize).range.set_end(value / 127.0);
                }
            }
            "sw_lokey" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.keyswitch_range.set_start(value);
                }
            }
            "sw_hikey" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.keyswitch_range.set_end(value);
                }
            }
            "sw_last" => {
                self.keyswitch_last = opcode.read_note(key_bounds);
                self.key_switched = false;
            }
            "sw_down" => {
                self.keyswitch_down = opcode.read_note(key_bounds);
                self.key_switched = false;
            }
            "sw_up" => {
                self.keyswitch_up = opcode.read_note(key_bounds);
            }
            "sw_previous" => {
                self.previous_note = opcode.read_note(key_bounds);
                self.previous_key_switched = false;
            }
            "sw_vel" => match opcode.value.as_str() {
                "current" => self.velocity_override = VelocityOverride::Current,
                "previous" => self.velocity_override = VelocityOverride::Previous,
                other => log::warn!("unknown sw_vel mode: {}", other),
            },
            "lochanaft" => {
                if let Some(value) = opcode.read(vel7) {
                    self.aftertouch_range.set_start(value / 127.0);
                }
            }
            "hichanaft" => {
                if let Some(value) = opcode.read(vel7) {
                    self.aftertouch_range.set_end(value / 127.0);
                }
            }
            "lobpm" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 500.0)) {
                    self.bpm_range.set_start(value);
                }
            }
            "hibpm" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 500.0)) {
                    self.bpm_range.set_end(value);
                }
            }
            "lorand" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 1.0)) {
                    self.rand_range.set_start(value);
                }
            }
            "hirand" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 1.0)) {
                    self.rand_range.set_end(value);
                }
            }
            "seq_length" => set_value(opcode, &mut self.sequence_length, Range::new(1, 100)),
            "seq_position" => {
                set_value(opcode, &mut self.sequence_position, Range::new(1, 100));
                self.sequence_switched = self.sequence_position == 1;
            }

            // Triggers
            "trigger" => match opcode.value.as_str() {
                "attack" => self.trigger = Trigger::Attack,
                "first" => self.trigger = Trigger::First,
                "legato" => self.trigger = Trigger::Legato,
                "release" => self.trigger = Trigger::Release,
                "release_key" => self.trigger = Trigger::ReleaseKey,
                other => log::warn!("unknown trigger mode: {}", other),
            },
            "on_locc" => {
                if let (Some(cc), Some(value)) = (opcode.parameter, opcode.read(vel7)) {
                    self.cc_trigger(cc as usize).set_start(value / 127.0);
                }
            }
            "on_hicc" => {
                if let (Some(cc), Some(value)) = (opcode.parameter, opcode.read(vel7)) {
                    self.cc_trigger(cc as usize).set_end(value / 127.0);
                }
            }

            // Amplitude
            "volume" => set_value(opcode, &mut self.volume, Range::new(-144.0, 6.0)),
            "amplitude" => set_value(opcode, &mut self.amplitude, Range::new(0.0, 100.0)),
            "pan" => set_value(opcode, &mut self.pan, Range::new(-100.0, 100.0)),
            "position" => set_value(opcode, &mut self.position, Range::new(-100.0, 100.0)),
            "width" => set_value(opcode, &mut self.width, Range::new(-100.0, 100.0)),
            "amp_keycenter" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.amp_keycenter = value;
                }
            }
            "amp_keytrack" => set_value(opcode, &mut self.amp_keytrack, Range::new(-96.0, 12.0)),
            "amp_veltrack" => {
                if let Some(value) = opcode.read(Range::new(-100.0f32, 100.0)) {
                    self.amp_veltrack = value / 100.0;
                }
            }
            "amp_random" => set_value(opcode, &mut self.amp_random, Range::new(0.0, 24.0)),
            "rt_decay" => set_value(opcode, &mut self.rt_decay, Range::new(0.0, 200.0)),
            "rt_dead" => match opcode.value.as_str() {
                "on" => self.rt_dead = true,
                "off" => self.rt_dead = false,
                other => log::warn!("unknown rt_dead value: {}", other),
            },
            "amp_velcurve_" => {
                if let (Some(point), Some(value)) =
                    (opcode.parameter, opcode.read(Range::new(0.0f32, 1.0)))
                {
                    if point <= 127 {
                        self.velocity_points.push((point as u8, value));
                        self.rebuild_velocity_curve();
                    }
                }
            }
            "xfin_lokey" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.crossfade_key_in.set_start(value);
                }
            }
            "xfin_hikey" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.crossfade_key_in.set_end(value);
                }
            }
            "xfout_lokey" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.crossfade_key_out.set_start(value);
                }
            }
            "xfout_hikey" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.crossfade_key_out.set_end(value);
                }
            }
            "xfin_lovel" => {
                if let Some(value) = opcode.read(vel7) {
                    self.crossfade_vel_in.set_start(value / 127.0);
                }
            }
            "xfin_hivel" => {
                if let Some(value) = opcode.read(vel7) {
                    self.crossfade_vel_in.set_end(value / 127.0);
                }
            }
            "xfout_lovel" => {
                if let Some(value) = opcode.read(vel7) {
                    self.crossfade_vel_out.set_start(value / 127.0);
                }
            }
            "xfout_hivel" => {
                if let Some(value) = opcode.read(vel7) {
                    self.crossfade_vel_out.set_end(value / 127.0);
                }
            }
            "xfin_locc" | "xfin_hicc" | "xfout_locc" | "xfout_hicc" => {
                if let (Some(cc), Some(value)) = (opcode.parameter, opcode.read(vel7)) {
                    let fade_in = opcode.name.starts_with("xfin");
                    let start = opcode.name.ends_with("locc");
                    let crossfade = self.cc_crossfade(cc as usize, fade_in);
                    if start {
                        crossfade.range.set_start(value / 127.0);
                    } else {
                        crossfade.range.set_end(value / 127.0);
                    }
                }
            }
            "xf_keycurve" => set_curve(opcode, &mut self.crossfade_key_curve),
            "xf_velcurve" => set_curve(opcode, &mut self.crossfade_vel_curve),
            "xf_cccurve" => set_curve(opcode, &mut self.crossfade_cc_curve),

            // Pitch
            "pitch_keycenter" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.pitch_keycenter = value;
                }
            }
            "pitch_keytrack" => set_value(opcode, &mut self.pitch_keytrack, Range::new(-1200.0, 1200.0)),
            "pitch_veltrack" => set_value(opcode, &mut self.pitch_veltrack, Range::new(-9600.0, 9600.0)),
            "pitch_random" => set_value(opcode, &mut self.pitch_random, Range::new(0.0, 9600.0)),
            "transpose" => set_value(opcode, &mut self.transpose, Range::new(-127, 127)),
            "tune" | "pitch" => set_value(opcode, &mut self.tune, Range::new(-9600.0, 9600.0)),
            "bend_up" => set_value(opcode, &mut self.bend_up, Range::new(-9600.0, 9600.0)),
            "bend_down" => set_value(opcode, &mut self.bend_down, Range::new(-9600.0, 9600.0)),

            // Filters and EQ
            "cutoff" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 96000.0)) {
                    self.filter_description(0).cutoff = value;
                }
            }
            "resonance" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 96.0)) {
                    self.filter_description(0).resonance = value;
                }
            }
            "fil_type" => {
                if let Some(kind) = FilterType::from_opcode(&opcode.value) {
                    self.filter_description(0).kind = kind;
                } else {
                    log::warn!("unknown filter type: {}", opcode.value);
                }
            }
            "fil_keytrack" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 1200.0)) {
                    self.filter_description(0).keytrack = value;
                }
            }
            "fil_keycenter" => {
                if let Some(value) = opcode.read_note(key_bounds) {
                    self.filter_description(0).keycenter = value as u8;
                }
            }
            "fil_veltrack" => {
                if let Some(value) = opcode.read(Range::new(-9600.0f32, 9600.0)) {
                    self.filter_description(0).veltrack = value;
                }
            }

            // Envelope families
            name if name.starts_with("ampeg_") => {
                return parse_eg_field(&mut self.amplitude_eg, &name[6..], opcode, false);
            }
            name if name.starts_with("pitcheg_") => {
                if name == "pitcheg_depth" {
                    set_value(opcode, &mut self.pitch_eg_depth, Range::new(-12000.0, 12000.0));
                    return true;
                }
                let eg = self.pitch_eg.get_or_insert_with(EgDescription::default);
                return parse_eg_field(eg, &name[8..], opcode, true);
            }
            name if name.starts_with("fileg_") => {
                if name == "fileg_depth" {
                    set_value(opcode, &mut self.filter_eg_depth, Range::new(-12000.0, 12000.0));
                    return true;
                }
                let eg = self.filter_eg.get_or_insert_with(EgDescription::default);
                return parse_eg_field(eg, &name[6..], opcode, true);
            }

            // Effect sends
            "effect" => {
                if let (Some(bus), Some(value)) =
                    (opcode.parameter, opcode.read(Range::new(0.0f32, 100.0)))
                {
                    let bus = bus as usize;
                    if bus >= 1 && bus <= 8 {
                        if self.effect_sends.len() <= bus {
                            self.effect_sends.resize(bus + 1, 0.0);
                        }
                        self.effect_sends[bus] = value / 100.0;
                    }
                }
            }

            _ => return self.parse_indexed_opcode(opcode),
        }

        true
    }

    /// Handles the `lfoN_`, `egN_`, `eqN_` and `*_onccN` families.
    fn parse_indexed_opcode(&mut self, opcode: &Opcode) -> bool {
        if let Some((index, field)) = split_indexed(&opcode.name, "lfo") {
            return self.parse_lfo_field(index, field, opcode);
        }
        if let Some((index, field)) = split_indexed(&opcode.name, "eg") {
            return self.parse_flex_eg_field(index, field, opcode);
        }
        if let Some((index, field)) = split_indexed(&opcode.name, "eq") {
            return self.parse_eq_field(index, field, opcode);
        }
        self.parse_oncc_opcode(opcode)
    }

    fn parse_lfo_field(&mut self, index: usize, field: &str, opcode: &Opcode) -> bool {
        if index == 0 || index > 8 {
            return false;
        }
        let slot = index - 1;
        if self.lfos.len() <= slot {
            self.lfos.resize(slot + 1, LfoConfig::default());
        }

        match field {
            "freq" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 100.0)) {
                    self.lfos[slot].rate = value;
                }
            }
            "delay" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 100.0)) {
                    self.lfos[slot].delay = value;
                }
            }
            "fade" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 100.0)) {
                    self.lfos[slot].fade = value;
                }
            }
            "phase" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 1.0)) {
                    self.lfos[slot].phase_offset = value;
                }
            }
            "wave" => {
                self.lfos[slot].waveform = match opcode.read_any::<u32>() {
                    Some(0) => LfoWaveform::Triangle,
                    Some(1) | None => LfoWaveform::Sine,
                    Some(2) => LfoWaveform::Saw,
                    Some(3) => LfoWaveform::Square,
                    Some(_) => LfoWaveform::Sine,
                };
            }
            "pitch" => return self.push_lfo_connection(slot, ModTargetSpec::Pitch, opcode),
            "volume" => return self.push_lfo_connection(slot, ModTargetSpec::Volume, opcode),
            "amplitude" => return self.push_lfo_connection(slot, ModTargetSpec::Amplitude, opcode),
            "pan" => return self.push_lfo_connection(slot, ModTargetSpec::Pan, opcode),
            "width" => return self.push_lfo_connection(slot, ModTargetSpec::Width, opcode),
            "cutoff" => {
                return self.push_lfo_connection(slot, ModTargetSpec::FilterCutoff(0), opcode)
            }
            _ => return false,
        }
        true
    }

    fn push_lfo_connection(&mut self, slot: usize, target: ModTargetSpec, opcode: &Opcode) -> bool {
        let Some(depth) = opcode.read_any::<f32>() else {
            return true;
        };
        self.connections.push(ModConnection {
            source: ModSourceSpec::Lfo(slot),
            target,
            depth,
            vel_to_depth: 0.0,
        });
        true
    }

    fn parse_flex_eg_field(&mut self, index: usize, field: &str, opcode: &Opcode) -> bool {
        if index == 0 || index > 8 {
            return false;
        }
        let slot = index - 1;
        if self.flex_egs.len() <= slot {
            self.flex_egs
                .resize(slot + 1, FlexEnvelopeDescription::default());
        }

        let stage_slot = |eg: &mut FlexEnvelopeDescription, stage: usize| {
            if eg.stages.len() <= stage {
                eg.stages.resize(stage + 1, FlexStage::default());
            }
        };

        match field {
            "time" => {
                if let (Some(stage), Some(value)) =
                    (opcode.parameter, opcode.read(Range::new(0.0f32, 100.0)))
                {
                    let stage = stage as usize;
                    stage_slot(&mut self.flex_egs[slot], stage);
                    self.flex_egs[slot].stages[stage].time = value;
                }
            }
            "level" => {
                if let (Some(stage), Some(value)) =
                    (opcode.parameter, opcode.read(Range::new(-1.0f32, 1.0)))
                {
                    let stage = stage as usize;
                    stage_slot(&mut self.flex_egs[slot], stage);
                    self.flex_egs[slot].stages[stage].level = value;
                }
            }
            "shape" => {
                if let (Some(stage), Some(value)) =
                    (opcode.parameter, opcode.read(Range::new(0.01f32, 10.0)))
                {
                    let stage = stage as usize;
                    stage_slot(&mut self.flex_egs[slot], stage);
                    self.flex_egs[slot].stages[stage].shape = value;
                }
            }
            "sustain" => {
                if let Some(stage) = opcode.read_any::<usize>() {
                    self.flex_egs[slot].sustain_stage = Some(stage);
                }
            }
            "points" => {}
            "pitch" => return self.push_flex_connection(slot, ModTargetSpec::Pitch, opcode),
            "volume" => return self.push_flex_connection(slot, ModTargetSpec::Volume, opcode),
            "amplitude" => {
                return self.push_flex_connection(slot, ModTargetSpec::Amplitude, opcode)
            }
            "cutoff" => {
                return self.push_flex_connection(slot, ModTargetSpec::FilterCutoff(0), opcode)
            }
            _ => return false,
        }
        true
    }

    fn push_flex_connection(&mut self, slot: usize, target: ModTargetSpec, opcode: &Opcode) -> bool {
        let Some(depth) = opcode.read_any::<f32>() else {
            return true;
        };
        self.connections.push(ModConnection {
            source: ModSourceSpec::FlexEg(slot),
            target,
            depth,
            vel_to_depth: 0.0,
        });
        true
    }

    fn parse_eq_field(&mut self, index: usize, field: &str, opcode: &Opcode) -> bool {
        if index == 0 || index > 3 {
            return false;
        }
        let slot = index - 1;
        if self.eq_bands.len() <= slot {
            self.eq_bands.resize(slot + 1, EqDescription::default());
        }

        match field {
            "freq" => {
                if let Some(value) = opcode.read(Range::new(0.0f32, 30000.0)) {
                    self.eq_bands[slot].frequency = value;
                }
            }
            "bw" => {
                if let Some(value) = opcode.read(Range::new(0.001f32, 4.0)) {
                    self.eq_bands[slot].bandwidth = value;
                }
            }
            "gain" => {
                if let Some(value) = opcode.read(Range::new(-96.0f32, 24.0)) {
                    self.eq_bands[slot].gain = value;
                }
            }
            _ => return false,
        }
        true
    }

    /// Handles `<target>_onccN` modulation routings.
    /// Handles the `<target>_onccN` routing family, including the
    /// `_curveccN`, `_smoothccN` and `_stepccN` shape modifiers.
    fn parse_oncc_opcode(&mut self, opcode: &Opcode) -> bool {
        let Some(cc) = opcode.parameter.map(|cc| cc as usize) else {
            return false;
        };
        if cc >= config::NUM_CCS {
            return false;
        }

        let suffixes: [(&str, CcField); 5] = [
            ("_oncc", CcField::Depth),
            ("_curvecc", CcField::Curve),
            ("_smoothcc", CcField::Smooth),
            ("_stepcc", CcField::Step),
            ("_cc", CcField::Depth),
        ];

        for (suffix, field) in suffixes {
            let Some(prefix) = opcode.name.strip_suffix(suffix) else {
                continue;
            };
            let target = match prefix {
                "amplitude" | "gain" => ModTargetSpec::Amplitude,
                "pan" => ModTargetSpec::Pan,
                "width" => ModTargetSpec::Width,
                "position" => ModTargetSpec::Position,
                "volume" => ModTargetSpec::Volume,
                "tune" | "pitch" => ModTargetSpec::Pitch,
                "cutoff" => ModTargetSpec::FilterCutoff(0),
                _ => continue,
            };
            self.apply_cc_field(cc, target, field, opcode);
            return true;
        }

        false
    }

    /// Updates (or creates) the controller connection for one target.
    fn apply_cc_field(&mut self, cc: usize, target: ModTargetSpec, field: CcField, opcode: &Opcode) {
        let position = self.connections.iter().position(|connection| {
            connection.target == target
                && matches!(&connection.source, ModSourceSpec::Cc { cc: source_cc, .. } if *source_cc == cc)
        });
        let index = match position {
            Some(index) => index,
            None => {
                self.connections.push(ModConnection {
                    source: ModSourceSpec::Cc {
                        cc,
                        curve: 0,
                        smooth: 0.0,
                        step: 0.0,
                    },
                    target,
                    depth: 0.0,
                    vel_to_depth: 0.0,
                });
                self.connections.len() - 1
            }
        };

        let connection = &mut self.connections[index];
        match field {
            CcField::Depth => {
                if let Some(value) = opcode.read_any::<f32>() {
                    connection.depth = value;
                }
            }
            CcField::Curve => {
                if let (ModSourceSpec::Cc { curve, .. }, Some(value)) =
                    (&mut connection.source, opcode.read_any::<usize>())
                {
                    *curve = value;
                }
            }
            CcField::Smooth => {
                // The opcode value is in milliseconds
                if let (ModSourceSpec::Cc { smooth, .. }, Some(value)) =
                    (&mut connection.source, opcode.read(Range::new(0.0f32, 10000.0)))
                {
                    *smooth = value / 1000.0;
                }
            }
            CcField::Step => {
                if let (ModSourceSpec::Cc { step, .. }, Some(value)) =
                    (&mut connection.source, opcode.read(Range::new(0.0f32, 127.0)))
                {
                    // Steps are given in controller units
                    *step = value / 127.0;
                }
            }
        }
    }

    fn cc_condition(&mut self, cc: usize) -> &mut CcCondition {
        if let Some(position) = self.cc_conditions.iter().position(|c| c.cc == cc) {
            &mut self.cc_conditions[position]
        } else {
            self.cc_conditions.push(CcCondition {
                cc,
                range: Range::new(0.0, 1.0),
                satisfied: true,
            });
            let last = self.cc_conditions.len() - 1;
            &mut self.cc_conditions[last]
        }
    }

    fn cc_trigger(&mut self, cc: usize) -> &mut Range<f32> {
        if let Some(position) = self.cc_triggers.iter().position(|(c, _)| *c == cc) {
            &mut self.cc_triggers[position].1
        } else {
            self.cc_triggers.push((cc, Range::new(0.0, 1.0)));
            let last = self.cc_triggers.len() - 1;
            &mut self.cc_triggers[last].1
        }
    }

    fn cc_crossfade(&mut self, cc: usize, fade_in: bool) -> &mut CcCrossfade {
        if let Some(position) = self
            .cc_crossfades
            .iter()
            .position(|c| c.cc == cc && c.fade_in == fade_in)
        {
            &mut self.cc_crossfades[position]
        } else {
            let default = if fade_in {
                Range::new(0.0, 0.0)
            } else {
                Range::new(1.0, 1.0)
            };
            self.cc_crossfades.push(CcCrossfade {
                cc,
                range: default,
                fade_in,
            });
            let last = self.cc_crossfades.len() - 1;
            &mut self.cc_crossfades[last]
        }
    }

    fn filter_description(&mut self, index: usize) -> &mut FilterDescription {
        if self.filters.len() <= index {
            self.filters.resize(index + 1, FilterDescription::default());
        }
        &mut self.filters[index]
    }

    fn rebuild_velocity_curve(&mut self) {
        let mut anchors = self.velocity_points.clone();
        if !anchors.iter().any(|(point, _)| *point == 0) {
            anchors.push((0, 0.0));
        }
        if !anchors.iter().any(|(point, _)| *point == 127) {
            anchors.push((127, 1.0));
        }
        self.velocity_curve = Some(Curve::from_anchors(&anchors));
    }

    // ------------------------------------------------------------------
    // Event registration

    /// True when every latched predicate currently holds.
    pub fn is_switched_on(&self) -> bool {
        self.key_switched
            && self.previous_key_switched
            && self.sequence_switched
            && self.pitch_switched
            && self.bpm_switched
            && self.aftertouch_switched
            && self.all_cc_switched
    }

    /// Registers a note-on and reports whether this region fires.
    ///
    /// Velocity and the random draw are normalized to `[0, 1]`.
    pub fn register_note_on(&mut self, note: i32, velocity: f32, rand_value: f32) -> bool {
        if self.keyswitch_range.contains_with_end(note) {
            if let Some(last) = self.keyswitch_last {
                self.key_switched = last == note;
            }
            if self.keyswitch_down == Some(note) {
                self.key_switched = true;
            }
            if self.keyswitch_up == Some(note) {
                self.key_switched = false;
            }
        }

        let key_ok = self.key_range.contains_with_end(note);
        let notes_before = self.active_notes_in_range;
        if key_ok {
            self.active_notes_in_range += 1;

            // Round robin compares before counting this note
            self.sequence_switched =
                (self.sequence_counter % self.sequence_length) == self.sequence_position - 1;
            self.sequence_counter += 1;

            if self.trigger == Trigger::ReleaseKey
                || self.velocity_override == VelocityOverride::Previous
            {
                self.last_note_velocities[note as usize & 127] = velocity;
            }
        }

        if !self.is_switched_on() {
            return false;
        }

        if let Some(previous) = self.previous_note {
            if !(self.previous_key_switched && note != previous) {
                return false;
            }
        }

        let vel_ok = self.velocity_range.contains_with_end(velocity);
        let rand_ok = self.rand_range.contains(rand_value)
            || (rand_value == 1.0 && self.rand_range.end() == 1.0);
        let trigger_ok = match self.trigger {
            Trigger::Attack => true,
            Trigger::First => notes_before == 0,
            Trigger::Legato => notes_before > 0,
            Trigger::Release | Trigger::ReleaseKey => false,
        };

        key_ok && vel_ok && rand_ok && trigger_ok
    }

    /// Registers a note-off and reports whether a release region fires.
    pub fn register_note_off(&mut self, note: i32, _velocity: f32, rand_value: f32) -> bool {
        if self.keyswitch_range.contains_with_end(note) {
            if self.keyswitch_down == Some(note) {
                self.key_switched = false;
            }
            if self.keyswitch_up == Some(note) {
                self.key_switched = true;
            }
        }

        let key_ok = self.key_range.contains_with_end(note);
        if key_ok && self.active_notes_in_range > 0 {
            self.active_notes_in_range -= 1;
        }

        if !self.is_switched_on() {
            return false;
        }

        let rand_ok = self.rand_range.contains(rand_value)
            || (rand_value == 1.0 && self.rand_range.end() == 1.0);
        key_ok && rand_ok && self.trigger.is_release()
    }

    /// Registers a controller change; true when an `on_ccN` trigger
    /// range now contains the value.
    pub fn register_cc(&mut self, cc: usize, value: f32) -> bool {
        for condition in &mut self.cc_conditions {
            if condition.cc == cc {
                condition.satisfied = condition.range.contains_with_end(value);
            }
        }
        self.all_cc_switched = self.cc_conditions.iter().all(|condition| condition.satisfied);

        self.cc_triggers
            .iter()
            .any(|(trigger_cc, range)| *trigger_cc == cc && range.contains_with_end(value))
    }

    /// Latches the `sw_previous` predicate against the note that just
    /// played. The dispatcher calls this after evaluating every region
    /// for a note-on, so the predicate always refers to the previous
    /// note.
    pub fn latch_previous_keyswitch(&mut self, note: i32) {
        if let Some(previous) = self.previous_note {
            self.previous_key_switched = previous == note;
        }
    }

    /// Latches the pitch-bend predicate.
    pub fn register_pitch_wheel(&mut self, bend: f32) {
        self.pitch_switched = self.bend_range.contains_with_end(bend);
    }

    /// Latches the aftertouch predicate.
    pub fn register_aftertouch(&mut self, aftertouch: f32) {
        self.aftertouch_switched = self.aftertouch_range.contains_with_end(aftertouch);
    }

    /// Latches the tempo predicate.
    pub fn register_tempo(&mut self, seconds_per_quarter: f32) {
        let bpm = 60.0 / seconds_per_quarter.max(1e-6);
        self.bpm_switched = self.bpm_range.contains_with_end(bpm);
    }

    /// Notes currently held within the key range.
    pub fn active_notes_in_range(&self) -> i32 {
        self.active_notes_in_range
    }

    /// Velocity remembered for `release_key` and `sw_vel=previous`.
    pub fn last_note_velocity(&self, note: i32) -> f32 {
        self.last_note_velocities[note as usize & 127]
    }

    // ------------------------------------------------------------------
    // Gains and pitch

    /// Linear gain from the `amplitude` opcode.
    pub fn base_gain(&self) -> f32 {
        self.amplitude / 100.0
    }

    /// Base volume in dB for one trigger, including the random volume
    /// excursion and `rt_decay` for release triggers.
    pub fn base_volume_db(&self, note: i32, random_unit: f32, midi: &MidiState, delay: usize) -> f32 {
        let mut volume = self.volume + random_unit * self.amp_random;
        if self.trigger.is_release() {
            volume -= self.rt_decay * midi.note_duration(note as u8 & 127, delay);
        }
        volume
    }

    /// Gain from key position and velocity, with key/velocity crossfades.
    pub fn note_gain(&self, note: i32, velocity: f32) -> f32 {
        let mut gain = db_to_mag(self.amp_keytrack * (note - self.amp_keycenter) as f32);

        gain *= crossfade_in(
            self.crossfade_key_in.start() as f32,
            self.crossfade_key_in.end() as f32,
            note as f32,
            self.crossfade_key_curve,
        );
        gain *= crossfade_out(
            self.crossfade_key_out.start() as f32,
            self.crossfade_key_out.end() as f32,
            note as f32,
            self.crossfade_key_curve,
        );

        gain *= self.velocity_gain(velocity);

        gain *= crossfade_in(
            self.crossfade_vel_in.start(),
            self.crossfade_vel_in.end(),
            velocity,
            self.crossfade_vel_curve,
        );
        gain *= crossfade_out(
            self.crossfade_vel_out.start(),
            self.crossfade_vel_out.end(),
            velocity,
            self.crossfade_vel_curve,
        );

        gain
    }

    /// Gain from the controller crossfade ranges.
    pub fn cc_gain(&self, midi: &MidiState) -> f32 {
        let mut gain = 1.0;
        for crossfade in &self.cc_crossfades {
            let value = midi.cc_value(crossfade.cc);
            gain *= if crossfade.fade_in {
                crossfade_in(
                    crossfade.range.start(),
                    crossfade.range.end(),
                    value,
                    self.crossfade_cc_curve,
                )
            } else {
                crossfade_out(
                    crossfade.range.start(),
                    crossfade.range.end(),
                    value,
                    self.crossfade_cc_curve,
                )
            };
        }
        gain
    }

    /// The velocity response, from `amp_velcurve_N` points or the
    /// default squared curve, scaled by `amp_veltrack`.
    pub fn velocity_gain(&self, velocity: f32) -> f32 {
        let curve_value = match &self.velocity_curve {
            Some(curve) => curve.eval_normalized(velocity),
            None => velocity * velocity,
        };
        let tracking = self.amp_veltrack.abs() * (1.0 - curve_value);
        if self.amp_veltrack < 0.0 {
            tracking
        } else {
            1.0 - tracking
        }
    }

    /// Pitch ratio for one trigger.
    ///
    /// `random_unit` is a uniform draw in `[-1, 1]`, applied to
    /// `pitch_random`.
    pub fn base_pitch_variation(&self, note: i32, velocity: f32, random_unit: f32) -> f32 {
        let mut cents = self.pitch_keytrack * (note - self.pitch_keycenter) as f32;
        cents += self.pitch_veltrack * (velocity - 1.0);
        cents += self.pitch_random * random_unit;
        cents += (self.transpose as f32) * config::CENTS_PER_SEMITONE;
        cents += self.tune;
        cents_to_ratio(cents)
    }

    // ------------------------------------------------------------------
    // Resolved sample properties

    /// Attaches the loaded sample handle and reconciles loop metadata.
    pub fn set_handle(&mut self, handle: Arc<FileHandle>) {
        let metadata = handle.metadata;
        if self.loop_start.is_none() {
            self.loop_start = metadata.loop_begin;
        }
        if self.loop_end.is_none() {
            self.loop_end = metadata.loop_end;
        }
        match self.sample_end {
            Some(end) => self.sample_end = Some(end.min(metadata.total_frames)),
            None => self.sample_end = Some(metadata.total_frames),
        }
        self.handle = Some(handle);
    }

    /// Last playable frame index, exclusive.
    pub fn effective_sample_end(&self) -> u32 {
        match (&self.handle, self.sample_end) {
            (Some(handle), Some(end)) => end.min(handle.metadata.total_frames),
            (Some(handle), None) => handle.metadata.total_frames,
            (None, Some(end)) => end,
            (None, None) => 0,
        }
    }

    /// Whether playback should loop, from the opcode or file metadata.
    pub fn should_loop(&self) -> bool {
        match self.loop_mode {
            Some(LoopMode::LoopContinuous) | Some(LoopMode::LoopSustain) => true,
            Some(_) => false,
            None => self.loop_start.is_some() && self.loop_end.is_some(),
        }
    }

    /// Effective loop mode with the file-metadata default applied.
    pub fn effective_loop_mode(&self) -> LoopMode {
        match self.loop_mode {
            Some(mode) => mode,
            None if self.should_loop() => LoopMode::LoopContinuous,
            None => LoopMode::NoLoop,
        }
    }

    /// Loop boundaries clamped to the playable range.
    pub fn loop_bounds(&self) -> (u32, u32) {
        let end = self.effective_sample_end();
        let loop_start = self.loop_start.unwrap_or(0).min(end.saturating_sub(1));
        let loop_end = self.loop_end.unwrap_or(end.saturating_sub(1)).min(end.saturating_sub(1));
        (loop_start, loop_end.max(loop_start))
    }

    /// True when the region mentions this controller anywhere.
    pub fn uses_cc(&self, cc: usize) -> bool {
        self.cc_conditions.iter().any(|condition| condition.cc == cc)
            || self.cc_triggers.iter().any(|(trigger_cc, _)| *trigger_cc == cc)
            || self.cc_crossfades.iter().any(|crossfade| crossfade.cc == cc)
    }

    /// Gain sent to one effect bus; bus 0 is the main output.
    pub fn gain_to_effect_bus(&self, bus: usize) -> f32 {
        self.effect_sends.get(bus).copied().unwrap_or(0.0)
    }
}

fn set_value<T>(opcode: &Opcode, field: &mut T, bounds: Range<T>)
where
    T: std::str::FromStr + PartialOrd + Copy,
{
    if let Some(value) = opcode.read(bounds) {
        *field = value;
    }
}

fn set_curve(opcode: &Opcode, field: &mut CrossfadeCurve) {
    match opcode.value.as_str() {
        "power" => *field = CrossfadeCurve::Power,
        "gain" => *field = CrossfadeCurve::Gain,
        other => log::warn!("unknown crossfade curve: {}", other),
    }
}

/// Parses one `ampeg_`/`pitcheg_`/`fileg_` field into an EG description.
///
/// `bipolar_sustain` marks the pitch and filter EGs whose sustain is a
/// percentage of depth rather than an amplitude.
fn parse_eg_field(
    eg: &mut EgDescription,
    field: &str,
    opcode: &Opcode,
    bipolar_sustain: bool,
) -> bool {
    let time_bounds = Range::new(0.0f32, 100.0);
    let vel2_bounds = Range::new(-100.0f32, 100.0);
    let percent = Range::new(0.0f32, 100.0);
    let sustain_bounds = if bipolar_sustain {
        Range::new(-100.0f32, 100.0)
    } else {
        percent
    };

    let push_cc = |list: &mut Vec<CcModifier>, opcode: &Opcode| {
        if let (Some(cc), Some(depth)) = (opcode.parameter, opcode.read(vel2_bounds)) {
            list.push(CcModifier {
                cc: cc as usize,
                depth,
            });
        }
    };

    match field {
        "delay" => set_value(opcode, &mut eg.delay, time_bounds),
        "attack" => set_value(opcode, &mut eg.attack, time_bounds),
        "hold" => set_value(opcode, &mut eg.hold, time_bounds),
        "decay" => set_value(opcode, &mut eg.decay, time_bounds),
        "release" => set_value(opcode, &mut eg.release, time_bounds),
        "sustain" => {
            if let Some(value) = opcode.read(sustain_bounds) {
                eg.sustain = value / 100.0;
            }
        }
        "start" => {
            if let Some(value) = opcode.read(percent) {
                eg.start = value / 100.0;
            }
        }
        "vel2delay" => set_value(opcode, &mut eg.vel2delay, vel2_bounds),
        "vel2attack" => set_value(opcode, &mut eg.vel2attack, vel2_bounds),
        "vel2hold" => set_value(opcode, &mut eg.vel2hold, vel2_bounds),
        "vel2decay" => set_value(opcode, &mut eg.vel2decay, vel2_bounds),
        "vel2release" => set_value(opcode, &mut eg.vel2release, vel2_bounds),
        "vel2sustain" => {
            if let Some(value) = opcode.read(vel2_bounds) {
                eg.vel2sustain = value / 100.0;
            }
        }
        "delay_oncc" => push_cc(&mut eg.cc_delay, opcode),
        "attack_oncc" => push_cc(&mut eg.cc_attack, opcode),
        "hold_oncc" => push_cc(&mut eg.cc_hold, opcode),
        "decay_oncc" => push_cc(&mut eg.cc_decay, opcode),
        "release_oncc" => push_cc(&mut eg.cc_release, opcode),
        "sustain_oncc" => push_cc(&mut eg.cc_sustain, opcode),
        // Depth lives on the region, not the description
        "depth" | "vel2depth" => {}
        _ => return false,
    }
    true
}

/// Splits `lfo3_freq` style names into `(3, "freq")`.
fn split_indexed<'a>(name: &'a str, prefix: &str) -> Option<(usize, &'a str)> {
    let rest = name.strip_prefix(prefix)?;
    let digits = rest.bytes().take_while(|byte| byte.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let index: usize = rest[..digits].parse().ok()?;
    let field = rest[digits..].strip_prefix('_')?;
    Some((index, field))
}

/// Fade-in gain over `[lo, hi]`; 0 below, 1 above.
pub fn crossfade_in(lo: f32, hi: f32, value: f32, curve: CrossfadeCurve) -> f32 {
    if value < lo {
        0.0
    } else if value < hi {
        let position = (value - lo) / (hi - lo);
        match curve {
            CrossfadeCurve::Power => position.sqrt(),
            CrossfadeCurve::Gain => position,
        }
    } else {
        1.0
    }
}

/// Fade-out gain over `[lo, hi]`; 1 below, 0 above.
pub fn crossfade_out(lo: f32, hi: f32, value: f32, curve: CrossfadeCurve) -> f32 {
    if value < lo {
        1.0
    } else if value < hi {
        let position = (value - lo) / (hi - lo);
        match curve {
            CrossfadeCurve::Power => (1.0 - position).sqrt(),
            CrossfadeCurve::Gain => 1.0 - position,
        }
    } else if (value - hi).abs() < f32::EPSILON && lo >= hi {
        // Degenerate range: the region plays up to and including hi
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_with(opcodes: &[(&str, &str)]) -> Region {
        let mut region = Region::new(0);
        for (name, value) in opcodes {
            region.parse_opcode(&Opcode::new(name, value));
        }
        region
    }

    #[test]
    fn test_defaults_accept_everything() {
        let mut region = region_with(&[("sample", "kick.wav")]);
        assert!(region.is_switched_on());
        assert!(region.register_note_on(60, 0.5, 0.5));
        assert!(region.register_note_on(0, 1.0, 0.0));
    }

    #[test]
    fn test_key_range_gates_notes() {
        let mut region = region_with(&[("sample", "a.wav"), ("lokey", "60"), ("hikey", "62")]);
        assert!(region.register_note_on(60, 0.5, 0.5));
        assert!(region.register_note_on(62, 0.5, 0.5));
        assert!(!region.register_note_on(59, 0.5, 0.5));
        assert!(!region.register_note_on(63, 0.5, 0.5));
    }

    #[test]
    fn test_key_sets_range_and_pitch_center() {
        let region = region_with(&[("key", "48")]);
        assert_eq!(region.key_range.start(), 48);
        assert_eq!(region.key_range.end(), 48);
        assert_eq!(region.pitch_keycenter, 48);
    }

    #[test]
    fn test_velocity_range_is_normalized() {
        let mut region = region_with(&[("lovel", "64"), ("hivel", "127")]);
        assert!(region.register_note_on(60, 64.0 / 127.0, 0.5));
        assert!(!region.register_note_on(60, 0.3, 0.5));
    }

    #[test]
    fn test_active_notes_never_negative() {
        let mut region = region_with(&[("sample", "a.wav")]);
        region.register_note_off(60, 0.0, 0.5);
        region.register_note_off(60, 0.0, 0.5);
        assert_eq!(region.active_notes_in_range(), 0);
        region.register_note_on(60, 0.5, 0.5);
        assert_eq!(region.active_notes_in_range(), 1);
    }

    #[test]
    fn test_trigger_first_and_legato() {
        let mut first = region_with(&[("trigger", "first")]);
        let mut legato = region_with(&[("trigger", "legato")]);

        assert!(first.register_note_on(60, 0.5, 0.5));
        assert!(!legato.register_note_on(60, 0.5, 0.5));

        assert!(!first.register_note_on(64, 0.5, 0.5));
        assert!(legato.register_note_on(64, 0.5, 0.5));
    }

    #[test]
    fn test_release_trigger_fires_on_note_off() {
        let mut region = region_with(&[("trigger", "release")]);
        assert!(!region.register_note_on(60, 0.5, 0.5));
        assert!(region.register_note_off(60, 0.5, 0.5));
    }

    #[test]
    fn test_sequence_round_robin() {
        let mut one = region_with(&[("seq_length", "2"), ("seq_position", "1")]);
        let mut two = region_with(&[("seq_length", "2"), ("seq_position", "2")]);

        assert!(one.register_note_on(60, 0.5, 0.5));
        assert!(!two.register_note_on(60, 0.5, 0.5));

        assert!(!one.register_note_on(60, 0.5, 0.5));
        assert!(two.register_note_on(60, 0.5, 0.5));

        assert!(one.register_note_on(60, 0.5, 0.5));
    }

    #[test]
    fn test_random_range_is_half_open_with_top_edge() {
        let mut low = region_with(&[("lorand", "0"), ("hirand", "0.5")]);
        let mut high = region_with(&[("lorand", "0.5"), ("hirand", "1")]);

        assert!(low.register_note_on(60, 0.5, 0.25));
        assert!(!high.register_note_on(60, 0.5, 0.25));

        assert!(!low.register_note_on(60, 0.5, 0.5));
        assert!(high.register_note_on(60, 0.5, 0.5));

        // The top edge belongs to the upper region
        assert!(high.register_note_on(60, 0.5, 1.0));
    }

    #[test]
    fn test_last_keyswitch_latches() {
        let mut region = region_with(&[
            ("sw_lokey", "36"),
            ("sw_hikey", "48"),
            ("sw_last", "36"),
            ("lokey", "60"),
            ("hikey", "72"),
        ]);
        assert!(!region.register_note_on(60, 0.5, 0.5));

        // Pressing the keyswitch arms the region without firing it
        assert!(!region.register_note_on(36, 0.5, 0.5));
        assert!(region.is_switched_on());
        assert!(region.register_note_on(60, 0.5, 0.5));

        // Another key in the switch range disarms it
        region.register_note_on(37, 0.5, 0.5);
        assert!(!region.register_note_on(60, 0.5, 0.5));
    }

    #[test]
    fn test_down_and_up_keyswitches() {
        let mut region = region_with(&[("sw_down", "36"), ("lokey", "60"), ("hikey", "72")]);
        assert!(!region.register_note_on(60, 0.5, 0.5));

        region.register_note_on(36, 0.5, 0.5);
        assert!(region.register_note_on(60, 0.5, 0.5));

        region.register_note_off(36, 0.0, 0.5);
        assert!(!region.register_note_on(60, 0.5, 0.5));
    }

    #[test]
    fn test_previous_keyswitch() {
        let mut region = region_with(&[("sw_previous", "48"), ("lokey", "60"), ("hikey", "72")]);
        assert!(!region.register_note_on(60, 0.5, 0.5));
        region.latch_previous_keyswitch(60);

        // The dispatcher latches the previous note after each note-on
        region.register_note_on(48, 0.5, 0.5);
        region.latch_previous_keyswitch(48);
        assert!(region.register_note_on(60, 0.5, 0.5));
        region.latch_previous_keyswitch(60);

        // A different previous note disarms
        region.register_note_on(50, 0.5, 0.5);
        region.latch_previous_keyswitch(50);
        assert!(!region.register_note_on(60, 0.5, 0.5));
    }

    #[test]
    fn test_cc_conditions_must_all_hold() {
        let mut region = region_with(&[("locc74", "64"), ("hicc74", "127")]);
        assert!(region.is_switched_on());

        region.register_cc(74, 0.3);
        assert!(!region.is_switched_on());
        assert!(!region.register_note_on(60, 0.5, 0.5));

        region.register_cc(74, 0.8);
        assert!(region.is_switched_on());
        assert!(region.register_note_on(60, 0.5, 0.5));
    }

    #[test]
    fn test_cc_trigger_fires_in_range() {
        let mut region = region_with(&[("on_locc64", "126"), ("on_hicc64", "127")]);
        assert!(!region.register_cc(64, 0.5));
        assert!(region.register_cc(64, 1.0));
        assert!(!region.register_cc(63, 1.0));
    }

    #[test]
    fn test_bend_and_bpm_predicates() {
        let mut region = region_with(&[("lobend", "0"), ("hibend", "8192"), ("lobpm", "100"), ("hibpm", "140")]);

        region.register_pitch_wheel(-0.5);
        assert!(!region.is_switched_on());
        region.register_pitch_wheel(0.5);
        assert!(region.is_switched_on());

        // 60 / 0.5 s per quarter = 120 bpm
        region.register_tempo(0.5);
        assert!(region.is_switched_on());
        region.register_tempo(1.0);
        assert!(!region.is_switched_on());
    }

    #[test]
    fn test_pitch_variation_keytrack() {
        let region = region_with(&[("pitch_keycenter", "60")]);
        assert!((region.base_pitch_variation(60, 1.0, 0.0) - 1.0).abs() < 1e-6);
        assert!((region.base_pitch_variation(72, 1.0, 0.0) - 2.0).abs() < 1e-5);
        assert!((region.base_pitch_variation(48, 1.0, 0.0) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_pitch_variation_transpose_and_tune() {
        let region = region_with(&[("transpose", "12"), ("tune", "-1200")]);
        // The two cancel out
        assert!((region.base_pitch_variation(60, 1.0, 0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_note_gain_keytrack_and_crossfade() {
        let region = region_with(&[("amp_keytrack", "6"), ("amp_veltrack", "0")]);
        let center = region.note_gain(60, 1.0);
        let above = region.note_gain(61, 1.0);
        assert!((above / center - 2.0).abs() < 0.01, "6 dB per key doubles");
    }

    #[test]
    fn test_key_crossfade_is_monotonic() {
        let region = region_with(&[
            ("xfin_lokey", "40"),
            ("xfin_hikey", "60"),
            ("amp_veltrack", "0"),
        ]);
        let mut last = -1.0;
        for note in 35..70 {
            let gain = region.note_gain(note, 1.0);
            assert!(gain >= last, "crossfade not monotonic at note {}", note);
            last = gain;
        }
        assert_eq!(region.note_gain(39, 1.0), 0.0);
        assert!((region.note_gain(60, 1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_power_crossfade_is_equal_power() {
        for i in 0..=10 {
            let value = i as f32 / 10.0;
            let fade_in = crossfade_in(0.0, 1.0, value, CrossfadeCurve::Power);
            let fade_out = crossfade_out(0.0, 1.0, value, CrossfadeCurve::Power);
            assert!((fade_in * fade_in + fade_out * fade_out - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gain_crossfade_is_linear() {
        assert_eq!(crossfade_in(0.0, 1.0, 0.25, CrossfadeCurve::Gain), 0.25);
        assert_eq!(crossfade_out(0.0, 1.0, 0.25, CrossfadeCurve::Gain), 0.75);
    }

    #[test]
    fn test_default_velocity_curve_is_squared() {
        let region = region_with(&[]);
        assert!((region.velocity_gain(1.0) - 1.0).abs() < 1e-6);
        assert!((region.velocity_gain(0.5) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_veltrack_zero_flattens_response() {
        let region = region_with(&[("amp_veltrack", "0")]);
        assert_eq!(region.velocity_gain(0.1), 1.0);
        assert_eq!(region.velocity_gain(1.0), 1.0);
    }

    #[test]
    fn test_negative_veltrack_inverts() {
        let region = region_with(&[("amp_veltrack", "-100")]);
        assert!(region.velocity_gain(0.1) > region.velocity_gain(1.0));
    }

    #[test]
    fn test_velcurve_points_override_default() {
        let region = region_with(&[("amp_velcurve_64", "1.0")]);
        // Full gain reached at half velocity
        assert!((region.velocity_gain(64.0 / 127.0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_ampeg_opcodes() {
        let region = region_with(&[
            ("ampeg_attack", "0.5"),
            ("ampeg_decay", "0.3"),
            ("ampeg_sustain", "50"),
            ("ampeg_release", "1.0"),
            ("ampeg_vel2attack", "-0.2"),
        ]);
        assert_eq!(region.amplitude_eg.attack, 0.5);
        assert_eq!(region.amplitude_eg.decay, 0.3);
        assert_eq!(region.amplitude_eg.sustain, 0.5);
        assert_eq!(region.amplitude_eg.release, 1.0);
        assert_eq!(region.amplitude_eg.vel2attack, -0.2);
    }

    #[test]
    fn test_pitcheg_creates_envelope() {
        let region = region_with(&[("pitcheg_attack", "0.1"), ("pitcheg_depth", "1200")]);
        assert!(region.pitch_eg.is_some());
        assert_eq!(region.pitch_eg_depth, 1200.0);
    }

    #[test]
    fn test_lfo_opcodes_and_connection() {
        let region = region_with(&[
            ("lfo1_freq", "5"),
            ("lfo1_wave", "0"),
            ("lfo1_pitch", "25"),
        ]);
        assert_eq!(region.lfos.len(), 1);
        assert_eq!(region.lfos[0].rate, 5.0);
        assert_eq!(region.lfos[0].waveform, LfoWaveform::Triangle);
        assert_eq!(region.connections.len(), 1);
        assert_eq!(region.connections[0].target, ModTargetSpec::Pitch);
        assert_eq!(region.connections[0].depth, 25.0);
    }

    #[test]
    fn test_flex_eg_opcodes() {
        let region = region_with(&[
            ("eg1_time1", "0.1"),
            ("eg1_level1", "1.0"),
            ("eg1_time2", "0.5"),
            ("eg1_level2", "0.2"),
            ("eg1_sustain", "2"),
            ("eg1_pitch", "100"),
        ]);
        assert_eq!(region.flex_egs.len(), 1);
        assert_eq!(region.flex_egs[0].stages.len(), 3);
        assert_eq!(region.flex_egs[0].stages[1].time, 0.1);
        assert_eq!(region.flex_egs[0].sustain_stage, Some(2));
        assert_eq!(region.connections.len(), 1);
    }

    #[test]
    fn test_oncc_routings() {
        let region = region_with(&[("pan_oncc20", "40"), ("volume_oncc7", "-6")]);
        assert_eq!(region.connections.len(), 2);
        assert_eq!(region.connections[0].target, ModTargetSpec::Pan);
        assert_eq!(region.connections[1].target, ModTargetSpec::Volume);
        assert!(region.uses_cc(20));
    }

    #[test]
    fn test_oncc_shape_modifiers() {
        let region = region_with(&[
            ("pan_oncc20", "40"),
            ("pan_curvecc20", "2"),
            ("pan_smoothcc20", "100"),
            ("pan_stepcc20", "63.5"),
        ]);
        assert_eq!(region.connections.len(), 1);
        assert_eq!(region.connections[0].depth, 40.0);
        match &region.connections[0].source {
            ModSourceSpec::Cc { cc, curve, smooth, step } => {
                assert_eq!(*cc, 20);
                assert_eq!(*curve, 2);
                assert!((*smooth - 0.1).abs() < 1e-6);
                assert!((*step - 0.5).abs() < 1e-3);
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_unknown_opcode_is_reported() {
        let mut region = Region::new(0);
        assert!(!region.parse_opcode(&Opcode::new("sasquatch", "1")));
        assert!(region.parse_opcode(&Opcode::new("volume", "-3")));
    }

    #[test]
    fn test_malformed_value_keeps_default() {
        let region = region_with(&[("volume", "loud")]);
        assert_eq!(region.volume, 0.0);
    }

    #[test]
    fn test_effect_sends() {
        let region = region_with(&[("effect1", "50")]);
        assert_eq!(region.gain_to_effect_bus(0), 1.0);
        assert_eq!(region.gain_to_effect_bus(1), 0.5);
        assert_eq!(region.gain_to_effect_bus(2), 0.0);
    }

    #[test]
    fn test_rt_decay_uses_note_duration() {
        let mut midi = MidiState::new();
        midi.set_sample_rate(48000.0);
        midi.note_on_event(0, 60, 1.0);
        midi.advance_time(48000);

        let region = region_with(&[("trigger", "release"), ("rt_decay", "6")]);
        let volume = region.base_volume_db(60, 0.0, &midi, 0);
        assert!((volume + 6.0).abs() < 1e-3, "6 dB decay after 1 s, got {}", volume);
    }
}
