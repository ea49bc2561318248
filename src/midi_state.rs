//! MIDI State Module
//!
//! Running snapshot of the MIDI stream: last note velocities, note-on
//! timestamps, controller values, pitch bend, aftertouch and tempo. Also
//! keeps the per-block controller event lists that the modulation matrix
//! turns into sample-accurate ramps.

use crate::config::{self, NUM_CCS};

/// One timestamped controller change within the current block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiEvent {
    /// Sample offset into the current block
    pub delay: usize,

    /// Normalized value in `[0, 1]`
    pub value: f32,
}

/// Normalizes a 7-bit MIDI value into `[0, 1]`.
#[inline]
pub fn normalize_7bit(value: u8) -> f32 {
    value as f32 / 127.0
}

/// Normalizes a 14-bit pitch bend value into `[-1, 1]`.
#[inline]
pub fn normalize_bend(value: i32) -> f32 {
    (value.clamp(-8192, 8192) as f32) / 8192.0
}

/// The engine's MIDI state.
#[derive(Debug, Clone)]
pub struct MidiState {
    /// Last note-on velocity per note, normalized
    note_velocities: [f32; 128],

    /// Engine clock at the last note-on, in samples
    note_on_times: [u64; 128],

    /// Samples elapsed since the engine started
    internal_clock: u64,

    sample_rate: f32,

    /// Controller event lists for the current block; each list always
    /// holds at least the value at block start
    cc_events: Vec<Vec<MidiEvent>>,

    pitch_bend: f32,
    aftertouch: f32,
    seconds_per_quarter: f32,
}

impl MidiState {
    pub fn new() -> Self {
        Self {
            note_velocities: [0.0; 128],
            note_on_times: [0; 128],
            internal_clock: 0,
            sample_rate: config::DEFAULT_SAMPLE_RATE,
            cc_events: vec![vec![MidiEvent { delay: 0, value: 0.0 }]; NUM_CCS],
            pitch_bend: 0.0,
            aftertouch: 0.0,
            seconds_per_quarter: 0.5,
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
    }

    /// Records a note-on: velocity memory and timestamp.
    pub fn note_on_event(&mut self, delay: usize, note: u8, velocity: f32) {
        let note = note as usize & 127;
        self.note_velocities[note] = velocity;
        self.note_on_times[note] = self.internal_clock + delay as u64;
    }

    /// Last note-on velocity for a note, normalized.
    pub fn note_velocity(&self, note: u8) -> f32 {
        self.note_velocities[note as usize & 127]
    }

    /// Seconds elapsed since the last note-on for a note.
    ///
    /// Used by `rt_decay` to attenuate release samples.
    pub fn note_duration(&self, note: u8, delay: usize) -> f32 {
        let elapsed = self.internal_clock + delay as u64 - self.note_on_times[note as usize & 127];
        elapsed as f32 / self.sample_rate
    }

    /// Records a controller change.
    pub fn cc_event(&mut self, delay: usize, cc: usize, value: f32) {
        if cc >= NUM_CCS {
            return;
        }
        let events = &mut self.cc_events[cc];
        let value = value.clamp(0.0, 1.0);
        match events.iter().rposition(|event| event.delay <= delay) {
            Some(position) if events[position].delay == delay => {
                events[position].value = value;
                events.truncate(position + 1);
            }
            Some(position) => {
                events.truncate(position + 1);
                events.push(MidiEvent { delay, value });
            }
            None => {
                events.clear();
                events.push(MidiEvent { delay, value });
            }
        }
    }

    /// Current (latest) value of a controller, normalized.
    pub fn cc_value(&self, cc: usize) -> f32 {
        if cc >= NUM_CCS {
            return 0.0;
        }
        self.cc_events[cc].last().map(|event| event.value).unwrap_or(0.0)
    }

    /// The event list for a controller within the current block.
    pub fn cc_events(&self, cc: usize) -> &[MidiEvent] {
        &self.cc_events[cc.min(NUM_CCS - 1)]
    }

    pub fn pitch_bend_event(&mut self, _delay: usize, bend: f32) {
        self.pitch_bend = bend.clamp(-1.0, 1.0);
    }

    pub fn pitch_bend(&self) -> f32 {
        self.pitch_bend
    }

    pub fn aftertouch_event(&mut self, _delay: usize, value: f32) {
        self.aftertouch = value.clamp(0.0, 1.0);
    }

    pub fn aftertouch(&self) -> f32 {
        self.aftertouch
    }

    pub fn tempo_event(&mut self, _delay: usize, seconds_per_quarter: f32) {
        if seconds_per_quarter > 0.0 {
            self.seconds_per_quarter = seconds_per_quarter;
        }
    }

    /// Current tempo in beats per minute.
    pub fn bpm(&self) -> f32 {
        60.0 / self.seconds_per_quarter
    }

    /// Advances the engine clock by one block and collapses each
    /// controller event list down to its final value.
    pub fn advance_time(&mut self, num_samples: usize) {
        self.internal_clock += num_samples as u64;
        for events in &mut self.cc_events {
            let last_value = events.last().map(|event| event.value).unwrap_or(0.0);
            events.clear();
            events.push(MidiEvent {
                delay: 0,
                value: last_value,
            });
        }
    }

    /// Resets every controller to zero, keeping note memory.
    pub fn reset_all_controllers(&mut self, delay: usize) {
        for cc in 0..NUM_CCS {
            self.cc_event(delay, cc, 0.0);
        }
        self.pitch_bend = 0.0;
    }

    /// Full reset to power-on state.
    pub fn reset(&mut self) {
        self.note_velocities = [0.0; 128];
        self.note_on_times = [0; 128];
        self.internal_clock = 0;
        for events in &mut self.cc_events {
            events.clear();
            events.push(MidiEvent { delay: 0, value: 0.0 });
        }
        self.pitch_bend = 0.0;
        self.aftertouch = 0.0;
        self.seconds_per_quarter = 0.5;
    }
}

impl Default for MidiState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_velocity_memory() {
        let mut state = MidiState::new();
        state.note_on_event(0, 60, 0.75);
        assert_eq!(state.note_velocity(60), 0.75);
        assert_eq!(state.note_velocity(61), 0.0);
    }

    #[test]
    fn test_note_duration_tracks_clock() {
        let mut state = MidiState::new();
        state.set_sample_rate(48000.0);
        state.note_on_event(0, 60, 1.0);
        state.advance_time(48000);
        assert!((state.note_duration(60, 0) - 1.0).abs() < 1e-6);
        assert!((state.note_duration(60, 24000) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_cc_events_accumulate_in_order() {
        let mut state = MidiState::new();
        state.cc_event(10, 7, 0.5);
        state.cc_event(20, 7, 0.8);
        let events = state.cc_events(7);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].delay, 0);
        assert_eq!(events[1], MidiEvent { delay: 10, value: 0.5 });
        assert_eq!(events[2], MidiEvent { delay: 20, value: 0.8 });
        assert_eq!(state.cc_value(7), 0.8);
    }

    #[test]
    fn test_cc_event_same_delay_overwrites() {
        let mut state = MidiState::new();
        state.cc_event(10, 7, 0.5);
        state.cc_event(10, 7, 0.9);
        let events = state.cc_events(7);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], MidiEvent { delay: 10, value: 0.9 });
    }

    #[test]
    fn test_advance_time_collapses_events() {
        let mut state = MidiState::new();
        state.cc_event(10, 7, 0.5);
        state.cc_event(20, 7, 0.8);
        state.advance_time(512);
        let events = state.cc_events(7);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], MidiEvent { delay: 0, value: 0.8 });
    }

    #[test]
    fn test_normalization_helpers() {
        assert_eq!(normalize_7bit(127), 1.0);
        assert_eq!(normalize_7bit(0), 0.0);
        assert_eq!(normalize_bend(8192), 1.0);
        assert_eq!(normalize_bend(-8192), -1.0);
        assert_eq!(normalize_bend(0), 0.0);
    }

    #[test]
    fn test_reset_all_controllers() {
        let mut state = MidiState::new();
        state.cc_event(0, 7, 0.8);
        state.pitch_bend_event(0, 0.5);
        state.reset_all_controllers(0);
        assert_eq!(state.cc_value(7), 0.0);
        assert_eq!(state.pitch_bend(), 0.0);
    }
}
