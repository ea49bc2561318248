//! FORZANDO - SFZ Sampler Engine Library
//!
//! This crate provides the core of an embeddable SFZ sampler: a
//! real-time polyphonic renderer that interprets SFZ instrument
//! definitions and produces stereo audio.
//!
//! # Architecture
//!
//! The engine consists of several interconnected modules:
//! - **Region**: The rule engine deciding which regions fire per event
//! - **VoiceList**: The bounded voice pool with polyphony and stealing
//! - **Voice**: Interpolated sample playback, envelopes and filters
//! - **FilePool**: Preloaded sample prefixes with background streaming
//! - **ModulationMatrix**: Controllers, LFOs and envelopes routed to
//!   render parameters
//! - **Synth**: The orchestrator tying parsing, dispatch and rendering
//!   together
//!
//! # Example
//!
//! ```no_run
//! use forzando::Synth;
//! use std::path::Path;
//!
//! let synth = Synth::new();
//! synth.set_sample_rate(48000.0);
//! synth.set_samples_per_block(512);
//! synth.load_sfz_file(Path::new("instrument.sfz"));
//!
//! synth.note_on(0, 60, 127); // C4, full velocity
//! let mut left = vec![0.0f32; 512];
//! let mut right = vec![0.0f32; 512];
//! synth.render_block(&mut left, &mut right);
//! ```

pub mod buffer;
pub mod config;
pub mod curve;
pub mod dsp;
pub mod effects;
pub mod envelope;
pub mod file_pool;
pub mod filter;
pub mod lfo;
pub mod midi_state;
pub mod modulation;
pub mod opcode;
pub mod parser;
pub mod range;
pub mod region;
pub mod state;
pub mod synth;
pub mod tuning;
pub mod voice;
pub mod voice_list;

pub use buffer::{AudioBuffer, StereoBuffer};
pub use config::EngineConfig;
pub use envelope::{AdsrEnvelope, EnvelopeStage, FlexEnvelope};
pub use file_pool::{AudioReader, FilePool, InMemoryFile, InMemoryReader};
pub use midi_state::MidiState;
pub use modulation::ModulationMatrix;
pub use opcode::Opcode;
pub use region::Region;
pub use state::PersistedState;
pub use synth::{ProcessMode, Synth};
pub use tuning::Tuning;
pub use voice::Voice;
pub use voice_list::{StealingPolicy, VoiceList};
