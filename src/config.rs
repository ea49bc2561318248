//! Engine Configuration Module
//!
//! Compile-time constants and the runtime-tunable engine configuration
//! shared by the synth, the voice pool, and the file pool.

/// Default host sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: f32 = 48000.0;

/// Default (and maximum) number of frames per render block.
pub const DEFAULT_SAMPLES_PER_BLOCK: usize = 1024;

/// Maximum block size accepted by `set_samples_per_block`.
pub const MAX_BLOCK_SIZE: usize = 8192;

/// Default number of frames preloaded per sample file.
pub const DEFAULT_PRELOAD_SIZE: u32 = 32768;

/// Number of MIDI controllers tracked by the engine.
pub const NUM_CCS: usize = 128;

/// Default number of playable voices.
pub const DEFAULT_NUM_VOICES: usize = 64;

/// The actual voice pool is oversized by this factor so that voices
/// released by the stealing policy can fade out while their replacement
/// starts.
pub const OVERFLOW_VOICE_MULTIPLIER: usize = 2;

/// Number of background sample-loading threads.
pub const NUM_LOADING_THREADS: usize = 4;

/// Capacity of the streaming request queue.
pub const LOADING_QUEUE_CAPACITY: usize = 256;

/// Period in seconds between file pool garbage collection sweeps.
pub const FILE_CLEARING_PERIOD_SECONDS: u64 = 30;

/// Cents per semitone.
pub const CENTS_PER_SEMITONE: f32 = 100.0;

/// Amplitude below which an envelope output counts as silence.
pub const VIRTUALLY_ZERO: f32 = 0.00005;

/// Release duration used for `off_mode=fast`, in seconds.
pub const FAST_RELEASE_SECONDS: f32 = 0.01;

/// Sustain pedal controller number.
pub const SUSTAIN_CC: usize = 64;

/// Controller value threshold above which the sustain pedal counts as held.
pub const HALF_CC_THRESHOLD: f32 = 0.5;

/// Number of points in a `<curve>` lookup table.
pub const CURVE_POINTS: usize = 129;

/// Maximum master volume excursion in dB.
pub const VOLUME_MAX_DB: f32 = 60.0;

/// SIMD alignment in bytes for audio channel storage.
pub const BUFFER_ALIGNMENT: usize = 16;

/// Default random seed for the engine's event generator.
pub const DEFAULT_RANDOM_SEED: u64 = 0x4653_5a21;

/// Runtime-tunable engine configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Number of voices the host asked for
    pub num_voices: usize,

    /// Internal oversampling factor (1, 2, 4 or 8)
    pub oversampling_factor: u32,

    /// Frames preloaded per sample file
    pub preload_size: u32,

    /// Master volume in dB
    pub volume_db: f32,

    /// Freewheeling (offline bounce) mode
    pub freewheeling: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_voices: DEFAULT_NUM_VOICES,
            oversampling_factor: 1,
            preload_size: DEFAULT_PRELOAD_SIZE,
            volume_db: 0.0,
            freewheeling: false,
        }
    }
}

impl EngineConfig {
    /// Total size of the voice pool including the overflow headroom.
    pub fn actual_num_voices(&self) -> usize {
        self.num_voices * OVERFLOW_VOICE_MULTIPLIER
    }
}

/// Converts decibels to a linear magnitude.
#[inline]
pub fn db_to_mag(db: f32) -> f32 {
    10.0f32.powf(db * 0.05)
}

/// Converts a linear magnitude to decibels.
#[inline]
pub fn mag_to_db(mag: f32) -> f32 {
    20.0 * mag.max(1e-20).log10()
}

/// Converts a tuning offset in cents to a frequency ratio.
#[inline]
pub fn cents_to_ratio(cents: f32) -> f32 {
    2.0f32.powf(cents / 1200.0)
}

/// Converts a MIDI note number to its equal-tempered frequency in Hz.
#[inline]
pub fn midi_note_frequency(note: u8) -> f32 {
    440.0 * 2.0f32.powf((note as f32 - 69.0) / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_to_mag_round_trip() {
        for db in [-60.0f32, -6.0, 0.0, 6.0, 12.0] {
            let mag = db_to_mag(db);
            assert!((mag_to_db(mag) - db).abs() < 1e-4);
        }
    }

    #[test]
    fn test_cents_to_ratio_octave() {
        assert!((cents_to_ratio(1200.0) - 2.0).abs() < 1e-6);
        assert!((cents_to_ratio(-1200.0) - 0.5).abs() < 1e-6);
        assert!((cents_to_ratio(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_midi_note_frequency_references() {
        assert!((midi_note_frequency(69) - 440.0).abs() < 1e-3);
        assert!((midi_note_frequency(60) - 261.626).abs() < 1e-2);
    }

    #[test]
    fn test_actual_voice_pool_size() {
        let config = EngineConfig::default();
        assert_eq!(
            config.actual_num_voices(),
            DEFAULT_NUM_VOICES * OVERFLOW_VOICE_MULTIPLIER
        );
    }
}
