// Test utilities and helper functions for FORZANDO engine tests

#![allow(dead_code)] // Not every helper is used by every test binary

use forzando::file_pool::{AudioReader, InMemoryFile, InMemoryReader};
use forzando::Synth;

use std::sync::Arc;

/// Root-mean-square level of a signal.
pub fn calculate_rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = signal.iter().map(|s| s * s).sum();
    (sum_sq / signal.len() as f32).sqrt()
}

/// Peak absolute level of a signal.
pub fn calculate_peak(signal: &[f32]) -> f32 {
    signal.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()))
}

/// Asserts every sample is a finite number.
pub fn assert_samples_are_finite(signal: &[f32]) {
    for (index, sample) in signal.iter().enumerate() {
        assert!(sample.is_finite(), "non-finite sample at {}: {}", index, sample);
    }
}

/// Asserts every sample lies within [-limit, limit].
pub fn assert_samples_in_range(signal: &[f32], limit: f32) {
    for (index, sample) in signal.iter().enumerate() {
        assert!(
            sample.abs() <= limit,
            "sample at {} out of range: {}",
            index,
            sample
        );
    }
}

/// A synth over an in-memory sample set, plus the reader to add more
/// virtual files.
pub struct TestRig {
    pub synth: Synth,
    pub reader: Arc<InMemoryReader>,
}

impl TestRig {
    /// Builds a synth with the given virtual files and SFZ text.
    pub fn new(files: &[(&str, InMemoryFile)], sfz: &str) -> Self {
        let reader = Arc::new(InMemoryReader::new());
        for (name, file) in files {
            reader.insert(*name, file.clone());
        }

        let synth = Synth::with_reader(reader.clone() as Arc<dyn AudioReader>);
        synth.set_sample_rate(48000.0);
        synth.set_samples_per_block(512);
        synth.set_random_seed(0x5eed);
        assert!(
            synth.load_sfz_string(std::path::Path::new(""), sfz),
            "sfz fixture failed to load"
        );
        Self { synth, reader }
    }

    /// Renders one block and returns the two channels.
    pub fn render(&self, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        self.synth.render_block(&mut left, &mut right);
        (left, right)
    }

    /// Renders and discards whole seconds of audio.
    pub fn run_for_samples(&self, mut samples: usize) {
        while samples > 0 {
            let frames = samples.min(512);
            self.render(frames);
            samples -= frames;
        }
    }
}

/// A constant-value mono file, the standard fixture.
pub fn constant_file(frames: usize, value: f32) -> InMemoryFile {
    InMemoryFile::mono(vec![value; frames], 48000.0)
}

/// A rising ramp file, for position and pitch checks.
pub fn ramp_file(frames: usize) -> InMemoryFile {
    InMemoryFile::mono((0..frames).map(|i| i as f32).collect(), 48000.0)
}
