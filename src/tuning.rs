//! Tuning Module
//!
//! Frequency-per-MIDI-note lookup for the voices: equal temperament by
//! default, reshaped by Scala `.scl` scales, a movable root key, a
//! reference frequency, and an optional piano-style stretch.

use std::path::Path;

use log::warn;

/// Number of cents in one conventional octave.
const OCTAVE_CENTS: f32 = 1200.0;

/// The engine tuning table.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Cumulative cents per scale degree; the last entry is the period
    scale_cents: Vec<f32>,

    /// MIDI key the scale starts from
    root_key: i32,

    /// Frequency of A4 (MIDI 69) in Hz
    reference_frequency: f32,

    /// Stretch amount in `[0, 1]`
    stretch: f32,

    /// Precomputed frequency per MIDI note
    frequencies: [f32; 128],
}

impl Tuning {
    /// Twelve-tone equal temperament at A4 = 440 Hz.
    pub fn new() -> Self {
        let mut tuning = Self {
            scale_cents: (1..=12).map(|step| step as f32 * 100.0).collect(),
            root_key: 60,
            reference_frequency: 440.0,
            stretch: 0.0,
            frequencies: [0.0; 128],
        };
        tuning.rebuild();
        tuning
    }

    /// Frequency of a MIDI note in Hz.
    pub fn frequency_of(&self, note: u8) -> f32 {
        self.frequencies[note as usize & 127]
    }

    /// Ratio between this tuning and plain equal temperament for a
    /// note. Voices multiply their pitch ratio by this.
    pub fn deviation_ratio(&self, note: u8) -> f32 {
        let equal = 440.0 * 2.0f32.powf((note as f32 - 69.0) / 12.0);
        self.frequency_of(note) / equal
    }

    /// Moves the scale root; keeps the current scale.
    pub fn set_scala_root_key(&mut self, root_key: i32) {
        self.root_key = root_key.clamp(0, 127);
        self.rebuild();
    }

    /// Sets the A4 reference frequency.
    pub fn set_tuning_frequency(&mut self, frequency: f32) {
        if frequency > 0.0 {
            self.reference_frequency = frequency;
            self.rebuild();
        }
    }

    /// Applies a piano-style octave stretch; 0 disables, 1 is the full
    /// curve.
    pub fn load_stretch_by_ratio(&mut self, ratio: f32) {
        self.stretch = ratio.clamp(0.0, 1.0);
        self.rebuild();
    }

    /// Loads a Scala `.scl` file. Returns false and leaves the tuning
    /// unchanged when the file cannot be parsed.
    pub fn load_scala_file(&mut self, path: &Path) -> bool {
        match std::fs::read_to_string(path) {
            Ok(content) => self.load_scala_string(&content),
            Err(error) => {
                warn!("cannot read scala file {}: {}", path.display(), error);
                false
            }
        }
    }

    /// Loads a Scala scale from text. Returns false and leaves the
    /// tuning unchanged on malformed input.
    pub fn load_scala_string(&mut self, content: &str) -> bool {
        match parse_scala(content) {
            Some(scale_cents) => {
                self.scale_cents = scale_cents;
                self.rebuild();
                true
            }
            None => {
                warn!("malformed scala scale ignored");
                false
            }
        }
    }

    fn rebuild(&mut self) {
        let scale_size = self.scale_cents.len() as i32;
        let period = *self.scale_cents.last().unwrap_or(&OCTAVE_CENTS);

        // The root key keeps its equal-tempered frequency
        let root_frequency =
            self.reference_frequency * 2.0f32.powf((self.root_key as f32 - 69.0) / 12.0);

        for note in 0..128i32 {
            let distance = note - self.root_key;
            let octave = distance.div_euclid(scale_size);
            let degree = distance.rem_euclid(scale_size);

            let mut cents = octave as f32 * period;
            if degree > 0 {
                cents += self.scale_cents[degree as usize - 1];
            }
            cents += self.stretch_cents(note);

            self.frequencies[note as usize] = root_frequency * 2.0f32.powf(cents / OCTAVE_CENTS);
        }
    }

    /// Cubic stretch curve: flat at the center of the keyboard, up to
    /// roughly 35 cents sharp in the top octave and flat at the bottom.
    fn stretch_cents(&self, note: i32) -> f32 {
        if self.stretch == 0.0 {
            return 0.0;
        }
        let position = (note - 69) as f32 / 48.0;
        self.stretch * 35.0 * position * position * position
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a Scala `.scl` body into cumulative cents.
fn parse_scala(content: &str) -> Option<Vec<f32>> {
    let mut lines = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('!') && !line.is_empty());

    let _description = lines.next()?;
    let count: usize = lines.next()?.split_whitespace().next()?.parse().ok()?;
    if count == 0 || count > 128 {
        return None;
    }

    let mut cents = Vec::with_capacity(count);
    for _ in 0..count {
        let line = lines.next()?;
        let token = line.split_whitespace().next()?;
        let value = if token.contains('.') {
            // Cents notation
            token.parse::<f32>().ok()?
        } else if let Some((numerator, denominator)) = token.split_once('/') {
            let numerator: f32 = numerator.parse().ok()?;
            let denominator: f32 = denominator.parse().ok()?;
            if denominator <= 0.0 || numerator <= 0.0 {
                return None;
            }
            OCTAVE_CENTS * (numerator / denominator).log2()
        } else {
            // A bare integer is a ratio
            let ratio: f32 = token.parse().ok()?;
            if ratio <= 0.0 {
                return None;
            }
            OCTAVE_CENTS * ratio.log2()
        };
        cents.push(value);
    }

    if cents.is_empty() {
        return None;
    }
    Some(cents).filter(|cents| cents.windows(2).all(|pair| pair[0] <= pair[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_equal_temperament() {
        let tuning = Tuning::new();
        assert!((tuning.frequency_of(69) - 440.0).abs() < 1e-3);
        assert!((tuning.frequency_of(81) - 880.0).abs() < 1e-2);
        assert!((tuning.frequency_of(60) - 261.626).abs() < 1e-2);
        assert!((tuning.deviation_ratio(50) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_reference_frequency_moves_everything() {
        let mut tuning = Tuning::new();
        tuning.set_tuning_frequency(432.0);
        assert!((tuning.frequency_of(69) - 432.0).abs() < 1e-2);
        let ratio = tuning.frequency_of(81) / tuning.frequency_of(69);
        assert!((ratio - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_scala_just_intonation() {
        let scl = "! just.scl\nA just fifth and octave\n2\n3/2\n2/1\n";
        let mut tuning = Tuning::new();
        assert!(tuning.load_scala_string(scl));

        // Root key 60 keeps its frequency, one degree up is a pure fifth
        let root = tuning.frequency_of(60);
        let fifth = tuning.frequency_of(61);
        assert!((fifth / root - 1.5).abs() < 1e-4);
        let octave = tuning.frequency_of(62);
        assert!((octave / root - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_scala_cents_notation() {
        let scl = "quarter-comma-ish\n2\n696.6\n1200.0\n";
        let mut tuning = Tuning::new();
        assert!(tuning.load_scala_string(scl));
        let root = tuning.frequency_of(60);
        let degree = tuning.frequency_of(61);
        let cents = OCTAVE_CENTS * (degree / root).log2();
        assert!((cents - 696.6).abs() < 0.1);
    }

    #[test]
    fn test_malformed_scala_is_rejected() {
        let mut tuning = Tuning::new();
        let before = tuning.frequency_of(64);
        assert!(!tuning.load_scala_string("broken\nnot-a-number\n"));
        assert!(!tuning.load_scala_string(""));
        assert_eq!(tuning.frequency_of(64), before);
    }

    #[test]
    fn test_stretch_sharpens_treble() {
        let mut tuning = Tuning::new();
        tuning.load_stretch_by_ratio(1.0);
        assert!(tuning.frequency_of(108) > 440.0 * 2.0f32.powf((108.0 - 69.0) / 12.0));
        assert!(tuning.frequency_of(21) < 440.0 * 2.0f32.powf((21.0 - 69.0) / 12.0));
        // The reference stays put
        assert!((tuning.frequency_of(69) - 440.0).abs() < 1e-3);
    }

    #[test]
    fn test_root_key_anchor() {
        let scl = "fifth\n2\n3/2\n2/1\n";
        let mut tuning = Tuning::new();
        tuning.load_scala_string(scl);
        tuning.set_scala_root_key(57);
        // The root keeps its equal-tempered frequency
        let expected = 440.0 * 2.0f32.powf((57.0 - 69.0) / 12.0);
        assert!((tuning.frequency_of(57) - expected).abs() < 1e-2);
    }
}
