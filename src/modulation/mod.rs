//! Modulation Module
//!
//! The modulation matrix connecting controllers, LFOs and envelope
//! generators to the per-voice render parameters.
//!
//! # Architecture
//!
//! - `SourceKey` / `TargetKey`: stable identities for graph nodes
//! - `Connection`: an edge carrying depth and velocity-to-depth
//! - `ModulationMatrix`: lazy, memoized per-cycle/per-voice evaluation

pub mod matrix;
pub mod sources;

pub use matrix::{Connection, ModulationMatrix, SourceId, TargetId};

use crate::envelope::{EgDescription, FlexEnvelopeDescription};
use crate::lfo::LfoConfig;

/// Identity of a modulation source.
///
/// Controllers are engine-wide and evaluated once per cycle; every other
/// source belongs to a region and runs per voice.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKey {
    /// A MIDI controller ramp
    Controller {
        cc: usize,
        /// Curve index into the engine curve set
        curve: usize,
        /// Smoothing time constant in seconds
        smooth: f32,
        /// Quantization step in normalized units, 0 for none
        step: f32,
    },

    /// A region LFO
    Lfo { region: u32, index: u32, config: LfoConfig },

    /// A region flex envelope
    FlexEg {
        region: u32,
        index: u32,
        description: FlexEnvelopeDescription,
    },

    /// The region's amplitude envelope
    AmpEg { region: u32, description: EgDescription },

    /// The region's pitch envelope
    PitchEg { region: u32, description: EgDescription },

    /// The region's filter envelope
    FilterEg { region: u32, description: EgDescription },
}

impl SourceKey {
    /// True when the source has per-voice state.
    pub fn is_per_voice(&self) -> bool {
        !matches!(self, SourceKey::Controller { .. })
    }

    /// The owning region for per-voice sources.
    pub fn region(&self) -> Option<u32> {
        match self {
            SourceKey::Controller { .. } => None,
            SourceKey::Lfo { region, .. }
            | SourceKey::FlexEg { region, .. }
            | SourceKey::AmpEg { region, .. }
            | SourceKey::PitchEg { region, .. }
            | SourceKey::FilterEg { region, .. } => Some(*region),
        }
    }

    /// Identity for deduplicated registration, ignoring configuration
    /// payloads.
    pub fn dedup_key(&self) -> (u8, u32, u32) {
        match self {
            SourceKey::Controller { cc, .. } => (0, *cc as u32, 0),
            SourceKey::Lfo { region, index, .. } => (1, *region, *index),
            SourceKey::FlexEg { region, index, .. } => (2, *region, *index),
            SourceKey::AmpEg { region, .. } => (3, *region, 0),
            SourceKey::PitchEg { region, .. } => (4, *region, 0),
            SourceKey::FilterEg { region, .. } => (5, *region, 0),
        }
    }
}

/// How contributions from several sources combine at a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    /// Sum, neutral element 0
    Additive,

    /// Product, neutral element 1
    Multiplicative,

    /// Product of percentages, neutral element 100
    PercentMultiplicative,
}

impl Combinator {
    /// The value a target holds when nothing modulates it.
    pub fn neutral(self) -> f32 {
        match self {
            Combinator::Additive => 0.0,
            Combinator::Multiplicative => 1.0,
            Combinator::PercentMultiplicative => 100.0,
        }
    }
}

/// Identity of a modulation target. All targets are per-voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKey {
    /// Linear amplitude in percent
    Amplitude { region: u32 },

    /// Pan offset in percent
    Pan { region: u32 },

    /// Width offset in percent
    Width { region: u32 },

    /// Position offset in percent
    Position { region: u32 },

    /// Pitch offset in cents
    Pitch { region: u32 },

    /// Volume offset in dB
    Volume { region: u32 },

    /// Filter cutoff offset in cents
    FilterCutoff { region: u32, index: u32 },

    /// EQ band gain offset in dB
    EqGain { region: u32, index: u32 },
}

impl TargetKey {
    /// The region owning this target.
    pub fn region(&self) -> u32 {
        match *self {
            TargetKey::Amplitude { region }
            | TargetKey::Pan { region }
            | TargetKey::Width { region }
            | TargetKey::Position { region }
            | TargetKey::Pitch { region }
            | TargetKey::Volume { region }
            | TargetKey::FilterCutoff { region, .. }
            | TargetKey::EqGain { region, .. } => region,
        }
    }

    /// The combinator this target uses.
    pub fn combinator(&self) -> Combinator {
        match self {
            TargetKey::Amplitude { .. } => Combinator::PercentMultiplicative,
            _ => Combinator::Additive,
        }
    }
}
