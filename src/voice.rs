//! Voice Module
//!
//! One active playing note. A voice resolves its region's sample data
//! through the file pool, resamples it at the combined pitch ratio,
//! applies the amplitude envelope, filters, EQ and the spatial stages,
//! and accumulates into a caller-provided stereo span. Voices are
//! pre-allocated and recycled; `reset` returns one to the free pool.

use crate::buffer::StereoBuffer;
use crate::config::{self, cents_to_ratio, db_to_mag, midi_note_frequency};
use crate::dsp::{self, interpolate, InterpolatorModel};
use crate::envelope::AdsrEnvelope;
use crate::file_pool::FilePool;
use crate::filter::{EqBand, Filter};
use crate::midi_state::MidiState;
use crate::modulation::{ModulationMatrix, TargetKey};
use crate::region::{LoopMode, Region, SampleSource};
use crate::tuning::Tuning;

use std::f32::consts::TAU;

use rand::rngs::SmallRng;
use rand::Rng;

/// Voice lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// Free for allocation
    Idle,

    /// Producing sound, note held
    Playing,

    /// Amplitude envelope release running
    Releasing,
}

/// What started a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    NoteOn,
    NoteOff,
    Cc,
}

/// The event a voice was started with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerEvent {
    pub kind: TriggerKind,

    /// Note number, or controller number for CC triggers
    pub number: u8,

    /// Normalized velocity or controller value
    pub value: f32,

    /// MIDI channel
    pub channel: u8,
}

/// One voice of the pool.
pub struct Voice {
    id: usize,
    state: VoiceState,
    region_index: Option<usize>,
    trigger: TriggerEvent,

    sample_rate: f32,
    samples_per_block: usize,
    quality: InterpolatorModel,

    /// Monotonic counter value at start, for age-based stealing
    start_order: u64,

    /// Blocks rendered since start
    age_blocks: u64,

    speed_ratio: f32,
    pitch_ratio: f32,
    base_gain: f32,
    base_volume_db: f32,
    base_frequency: f32,

    float_position: f64,
    initial_delay: usize,
    phase: f32,
    remaining_count: u32,
    note_is_off: bool,
    streaming_requested: bool,
    envelope: AdsrEnvelope,
    filters: Vec<Filter>,
    eq_bands: Vec<EqBand>,

    // Scratch spans sized to the block
    mod_span: Vec<f32>,
    gain_span: Vec<f32>,
    pitch_span: Vec<f32>,
    spatial_span: Vec<f32>,
}

impl Voice {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: VoiceState::Idle,
            region_index: None,
            trigger: TriggerEvent {
                kind: TriggerKind::NoteOn,
                number: 0,
                value: 0.0,
                channel: 1,
            },
            sample_rate: config::DEFAULT_SAMPLE_RATE,
            samples_per_block: config::DEFAULT_SAMPLES_PER_BLOCK,
            quality: InterpolatorModel::Linear,
            start_order: 0,
            age_blocks: 0,
            speed_ratio: 1.0,
            pitch_ratio: 1.0,
            base_gain: 1.0,
            base_volume_db: 0.0,
            base_frequency: 440.0,
            float_position: 0.0,
            initial_delay: 0,
            phase: 0.0,
            remaining_count: 1,
            note_is_off: false,
            streaming_requested: false,
            envelope: AdsrEnvelope::new(),
            filters: Vec::new(),
            eq_bands: Vec::new(),
            mod_span: vec![0.0; config::DEFAULT_SAMPLES_PER_BLOCK],
            gain_span: vec![0.0; config::DEFAULT_SAMPLES_PER_BLOCK],
            pitch_span: vec![0.0; config::DEFAULT_SAMPLES_PER_BLOCK],
            spatial_span: vec![0.0; config::DEFAULT_SAMPLES_PER_BLOCK],
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
    }

    pub fn set_samples_per_block(&mut self, samples_per_block: usize) {
        self.samples_per_block = samples_per_block;
        self.mod_span.resize(samples_per_block, 0.0);
        self.gain_span.resize(samples_per_block, 0.0);
        self.pitch_span.resize(samples_per_block, 0.0);
        self.spatial_span.resize(samples_per_block, 0.0);
    }

    pub fn set_quality(&mut self, quality: InterpolatorModel) {
        self.quality = quality;
    }

    /// A voice is free when it has no region and sits idle.
    pub fn is_free(&self) -> bool {
        self.state == VoiceState::Idle && self.region_index.is_none()
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn region_index(&self) -> Option<usize> {
        self.region_index
    }

    pub fn trigger_kind(&self) -> TriggerKind {
        self.trigger.kind
    }

    pub fn trigger_number(&self) -> u8 {
        self.trigger.number
    }

    pub fn trigger_value(&self) -> f32 {
        self.trigger.value
    }

    pub fn trigger_channel(&self) -> u8 {
        self.trigger.channel
    }

    /// Monotonic start counter; smaller is older.
    pub fn start_order(&self) -> u64 {
        self.start_order
    }

    /// Blocks rendered since the voice started.
    pub fn age(&self) -> u64 {
        self.age_blocks
    }

    /// Current amplitude envelope level, for the stealing policy.
    pub fn envelope_value(&self) -> f32 {
        self.envelope.value()
    }

    /// True once the envelope has fully decayed; the scheduler resets
    /// the voice and releases its modulation slots.
    pub fn needs_cleanup(&self) -> bool {
        self.state != VoiceState::Idle && !self.envelope.is_smoothing()
    }

    /// Starts the voice on a region.
    ///
    /// `delay` is the trigger's sample offset into the current block.
    pub fn start(
        &mut self,
        region_index: usize,
        region: &Region,
        delay: usize,
        trigger: TriggerEvent,
        start_order: u64,
        midi: &MidiState,
        tuning: &Tuning,
        rng: &mut SmallRng,
    ) {
        self.state = VoiceState::Playing;
        self.region_index = Some(region_index);
        self.trigger = trigger;
        self.start_order = start_order;
        self.age_blocks = 0;
        self.note_is_off = false;
        self.streaming_requested = false;
        self.phase = 0.0;
        self.remaining_count = region.sample_count.unwrap_or(1).max(1);

        let note = trigger.number as i32;
        let velocity = trigger.value;

        let source_rate = region
            .handle
            .as_ref()
            .map(|handle| handle.metadata.sample_rate as f32)
            .unwrap_or(self.sample_rate);
        self.speed_ratio = source_rate / self.sample_rate;
        self.pitch_ratio = region.base_pitch_variation(note, velocity, rng.gen_range(-1.0f32..=1.0))
            * tuning.deviation_ratio(trigger.number);
        self.base_frequency = midi_note_frequency(trigger.number) * self.pitch_ratio;

        self.base_gain = region.base_gain()
            * region.note_gain(note, velocity)
            * region.cc_gain(midi);
        self.base_volume_db =
            region.base_volume_db(note, rng.gen_range(0.0f32..=1.0), midi, delay);

        let offset_random = if region.offset_random > 0 {
            rng.gen_range(0..=region.offset_random)
        } else {
            0
        };
        self.float_position = (region.offset + offset_random) as f64;

        let delay_random = if region.delay_random > 0.0 {
            rng.gen_range(0.0..=region.delay_random)
        } else {
            0.0
        };
        self.initial_delay =
            delay + ((region.delay + delay_random) * self.sample_rate) as usize;

        let cc_lookup = |cc: usize| midi.cc_value(cc);
        self.envelope.trigger(
            region
                .amplitude_eg
                .to_parameters(self.sample_rate, velocity, &cc_lookup),
            self.initial_delay as u32,
        );

        self.filters = region
            .filters
            .iter()
            .map(|description| {
                let mut cutoff_cents = description.keytrack * (note - description.keycenter as i32) as f32;
                cutoff_cents += description.veltrack * velocity;
                let cutoff = description.cutoff * cents_to_ratio(cutoff_cents);
                Filter::new(description.kind, cutoff, description.resonance, self.sample_rate)
            })
            .collect();
        self.eq_bands = region
            .eq_bands
            .iter()
            .map(|description| EqBand::new(*description, self.sample_rate))
            .collect();
    }

    /// Handles a note-off for this voice's note.
    ///
    /// Returns true when the voice enters its release, so the caller can
    /// release the matching modulation generators.
    pub fn register_note_off(
        &mut self,
        delay: usize,
        note: u8,
        _velocity: f32,
        sustain_held: bool,
        region: &Region,
    ) -> bool {
        if self.state != VoiceState::Playing {
            return false;
        }
        if self.trigger.kind != TriggerKind::NoteOn || self.trigger.number != note {
            return false;
        }

        self.note_is_off = true;

        if region.effective_loop_mode() == LoopMode::OneShot {
            return false;
        }
        if sustain_held {
            return false;
        }

        self.release(delay);
        true
    }

    /// Handles a controller change; the sustain pedal going up releases
    /// a voice whose note is already off. Returns true on release.
    pub fn register_cc(&mut self, delay: usize, cc: usize, value: f32) -> bool {
        if cc == config::SUSTAIN_CC
            && value < config::HALF_CC_THRESHOLD
            && self.note_is_off
            && self.state == VoiceState::Playing
        {
            self.release(delay);
            return true;
        }
        false
    }

    /// Releases the voice if its region is silenced by `group`.
    ///
    /// Returns true when the voice entered its release.
    pub fn check_off_group(&mut self, delay: usize, group: u32, region: &Region) -> bool {
        if self.state == VoiceState::Idle || self.trigger.kind != TriggerKind::NoteOn {
            return false;
        }
        if region.off_by != Some(group) {
            return false;
        }

        match region.off_mode {
            crate::region::OffMode::Fast => {
                let fade = (config::FAST_RELEASE_SECONDS * self.sample_rate) as u32;
                self.envelope.set_release_length(fade);
            }
            crate::region::OffMode::Normal => {}
        }
        self.release(delay);
        true
    }

    /// Force-releases the voice with a short fade, for stealing.
    pub fn steal(&mut self, fade_samples: u32) {
        if self.state == VoiceState::Idle {
            return;
        }
        self.envelope.set_release_length(fade_samples);
        self.release(0);
    }

    fn release(&mut self, delay: usize) {
        self.envelope.start_release(delay);
        self.state = VoiceState::Releasing;
    }

    /// Renders `num_frames` frames into `buffer` (zeroed first).
    pub fn render_block(
        &mut self,
        region: &Region,
        matrix: &mut ModulationMatrix,
        pool: &FilePool,
        midi: &MidiState,
        buffer: &mut StereoBuffer,
        num_frames: usize,
    ) {
        let num_frames = num_frames
            .min(buffer.num_frames())
            .min(self.samples_per_block);
        buffer.fill(0.0);

        if self.state == VoiceState::Idle {
            return;
        }
        self.age_blocks += 1;

        let offset = self.initial_delay.min(num_frames);
        self.initial_delay -= offset;

        // Per-frame pitch modulation in cents: matrix targets plus bend
        let pitch_target = matrix.find_target(TargetKey::Pitch { region: region.id });
        self.pitch_span[..num_frames].fill(0.0);
        if let Some(target) = pitch_target {
            if let Some(modulation) = matrix.get_modulation(target) {
                dsp::copy(modulation, &mut self.pitch_span[..num_frames]);
            }
        }
        let bend = midi.pitch_bend();
        let bend_cents = if bend >= 0.0 {
            bend * region.bend_up
        } else {
            -bend * region.bend_down
        };
        if bend_cents != 0.0 {
            for value in &mut self.pitch_span[..num_frames] {
                *value += bend_cents;
            }
        }

        match &region.sample {
            SampleSource::File(path) => {
                self.fill_with_data(region, pool, path, offset, num_frames, buffer)
            }
            SampleSource::Sine => self.fill_with_sine(offset, num_frames, buffer),
            SampleSource::Silence | SampleSource::None => {}
        }

        // Amplitude: envelope x base gain x modulation
        self.envelope.get_block(&mut self.gain_span[..num_frames]);
        let base_gain = self.base_gain * db_to_mag(self.base_volume_db);
        dsp::apply_gain1_in_place(base_gain, &mut self.gain_span[..num_frames]);

        if let Some(target) = matrix.find_target(TargetKey::Amplitude { region: region.id }) {
            if let Some(modulation) = matrix.get_modulation(target) {
                dsp::copy(modulation, &mut self.mod_span[..num_frames]);
                for (gain, amount) in self.gain_span[..num_frames]
                    .iter_mut()
                    .zip(self.mod_span[..num_frames].iter())
                {
                    *gain *= 0.01 * amount;
                }
            }
        }
        if let Some(target) = matrix.find_target(TargetKey::Volume { region: region.id }) {
            if let Some(modulation) = matrix.get_modulation(target) {
                dsp::copy(modulation, &mut self.mod_span[..num_frames]);
                for (gain, decibels) in self.gain_span[..num_frames]
                    .iter_mut()
                    .zip(self.mod_span[..num_frames].iter())
                {
                    *gain *= db_to_mag(*decibels);
                }
            }
        }
        buffer.apply_gain(&self.gain_span[..num_frames]);

        self.process_filters(region, matrix, num_frames, buffer);
        self.process_spatial(region, matrix, num_frames, buffer);

        if !self.envelope.is_smoothing() {
            self.state = VoiceState::Releasing;
        }
    }

    fn process_filters(
        &mut self,
        region: &Region,
        matrix: &mut ModulationMatrix,
        num_frames: usize,
        buffer: &mut StereoBuffer,
    ) {
        for (index, filter) in self.filters.iter_mut().enumerate() {
            if let Some(target) = matrix.find_target(TargetKey::FilterCutoff {
                region: region.id,
                index: index as u32,
            }) {
                if let Some(modulation) = matrix.get_modulation(target) {
                    // Block-rate cutoff update from the first frame
                    let cents = modulation.first().copied().unwrap_or(0.0);
                    if cents != 0.0 {
                        let base = region
                            .filters
                            .get(index)
                            .map(|description| description.cutoff)
                            .unwrap_or(filter.cutoff());
                        filter.set_cutoff(base * cents_to_ratio(cents));
                    }
                }
            }
            let (left, right) = buffer.both_mut();
            filter.process(&mut left[..num_frames], &mut right[..num_frames]);
        }

        for (index, band) in self.eq_bands.iter_mut().enumerate() {
            if let Some(target) = matrix.find_target(TargetKey::EqGain {
                region: region.id,
                index: index as u32,
            }) {
                if let Some(modulation) = matrix.get_modulation(target) {
                    let decibels = modulation.first().copied().unwrap_or(0.0);
                    if decibels != 0.0 {
                        let base = region
                            .eq_bands
                            .get(index)
                            .map(|description| description.gain)
                            .unwrap_or(0.0);
                        band.set_gain(base + decibels);
                    }
                }
            }
            let (left, right) = buffer.both_mut();
            band.process(&mut left[..num_frames], &mut right[..num_frames]);
        }
    }

    fn process_spatial(
        &mut self,
        region: &Region,
        matrix: &mut ModulationMatrix,
        num_frames: usize,
        buffer: &mut StereoBuffer,
    ) {
        let mut spatial_stage = |base: f32, target: TargetKey, span: &mut [f32]| {
            span[..num_frames].fill(base);
            if let Some(target) = matrix.find_target(target) {
                if let Some(modulation) = matrix.get_modulation(target) {
                    for (value, amount) in span[..num_frames].iter_mut().zip(modulation.iter()) {
                        *value += amount;
                    }
                }
            }
            for value in span[..num_frames].iter_mut() {
                *value = (*value / 100.0).clamp(-1.0, 1.0);
            }
        };

        // Width first, then a single equal-power pan stage fed by the
        // combined pan and position offsets
        spatial_stage(
            region.width,
            TargetKey::Width { region: region.id },
            &mut self.spatial_span,
        );
        {
            let (left, right) = buffer.both_mut();
            dsp::width(
                &self.spatial_span[..num_frames],
                &mut left[..num_frames],
                &mut right[..num_frames],
            );
        }

        spatial_stage(
            region.pan,
            TargetKey::Pan { region: region.id },
            &mut self.spatial_span,
        );
        {
            // Fold the position stage into the same pan values
            let position_target = matrix.find_target(TargetKey::Position { region: region.id });
            let base = region.position / 100.0;
            if base != 0.0 {
                for value in self.spatial_span[..num_frames].iter_mut() {
                    *value = (*value + base).clamp(-1.0, 1.0);
                }
            }
            if let Some(target) = position_target {
                if let Some(modulation) = matrix.get_modulation(target) {
                    for (value, amount) in
                        self.spatial_span[..num_frames].iter_mut().zip(modulation.iter())
                    {
                        *value = (*value + amount / 100.0).clamp(-1.0, 1.0);
                    }
                }
            }
            let (left, right) = buffer.both_mut();
            dsp::pan(
                &self.spatial_span[..num_frames],
                &mut left[..num_frames],
                &mut right[..num_frames],
            );
        }
    }

    fn fill_with_data(
        &mut self,
        region: &Region,
        pool: &FilePool,
        path: &std::path::Path,
        offset: usize,
        num_frames: usize,
        buffer: &mut StereoBuffer,
    ) {
        let Some(handle) = region.handle.as_ref() else {
            return;
        };

        let sample_end = region.effective_sample_end() as f64;
        if sample_end <= 0.0 {
            return;
        }

        let use_full = handle.full_data().is_some();
        let (source, available) = match handle.full_data() {
            Some(full) => {
                let frames = full.num_frames();
                (full, frames)
            }
            None => {
                let frames = handle.preloaded().num_frames();
                (handle.preloaded(), frames)
            }
        };
        let source_left = source.left();
        let source_right = source.right();

        let loops = match region.effective_loop_mode() {
            LoopMode::LoopContinuous => true,
            LoopMode::LoopSustain => !self.note_is_off,
            _ => false,
        };
        let (loop_start, loop_end) = region.loop_bounds();

        let mut release_at: Option<usize> = None;
        let mut position = self.float_position;

        {
            let (left_out, right_out) = buffer.both_mut();
            for frame in offset..num_frames {
                let index = position as usize;
                let frac = (position - index as f64) as f32;

                if (index as f64) < sample_end {
                    let fetch = |data: &[f32], at: isize| -> f32 {
                        if at < 0 {
                            return data.first().copied().unwrap_or(0.0);
                        }
                        let at = at as usize;
                        if at < available {
                            data[at]
                        } else {
                            // Tail not streamed in yet, or past file end
                            0.0
                        }
                    };
                    let window_left = [
                        fetch(source_left, index as isize - 1),
                        fetch(source_left, index as isize),
                        fetch(source_left, index as isize + 1),
                        fetch(source_left, index as isize + 2),
                    ];
                    let window_right = [
                        fetch(source_right, index as isize - 1),
                        fetch(source_right, index as isize),
                        fetch(source_right, index as isize + 1),
                        fetch(source_right, index as isize + 2),
                    ];
                    left_out[frame] = interpolate(self.quality, &window_left, frac);
                    right_out[frame] = interpolate(self.quality, &window_right, frac);
                }

                let cents = self.pitch_span[frame];
                let jump = (self.pitch_ratio * self.speed_ratio * cents_to_ratio(cents)) as f64;
                position += jump;

                if loops && loop_end > loop_start {
                    let span = (loop_end - loop_start + 1) as f64;
                    while position > loop_end as f64 {
                        position -= span;
                    }
                } else if position >= sample_end {
                    if self.remaining_count > 1 {
                        self.remaining_count -= 1;
                        position = region.offset as f64;
                    } else if release_at.is_none() {
                        position = sample_end - 1.0;
                        release_at = Some(frame);
                    }
                }
            }
        }

        self.float_position = position;

        if let Some(frame) = release_at {
            if self.state == VoiceState::Playing || self.state == VoiceState::Releasing {
                log::debug!("voice {} reached sample end", self.id);
                self.release(frame);
            }
        }

        // Ask for the tail ahead of crossing the preloaded prefix
        if !use_full && !self.streaming_requested && !handle.fully_preloaded() {
            let lookahead =
                (self.pitch_ratio * self.speed_ratio) as f64 * (2 * self.samples_per_block) as f64;
            if self.float_position + lookahead >= available as f64 {
                self.streaming_requested = true;
                if pool.enqueue_streaming(handle, path).is_err() {
                    // Recoverable: retry on a later block
                    self.streaming_requested = false;
                }
            }
        }
    }

    fn fill_with_sine(&mut self, offset: usize, num_frames: usize, buffer: &mut StereoBuffer) {
        let (left, right) = buffer.both_mut();
        for frame in offset..num_frames {
            let cents = self.pitch_span[frame];
            let frequency = self.base_frequency * cents_to_ratio(cents);
            left[frame] = dsp::poly_sine(self.phase);
            self.phase += TAU * frequency / self.sample_rate;
            if self.phase > TAU {
                self.phase -= TAU;
            }
        }
        dsp::copy(&left[offset..num_frames], &mut right[offset..num_frames]);
        self.float_position += (num_frames - offset) as f64;
    }

    /// Returns the voice to the free pool.
    pub fn reset(&mut self) {
        self.state = VoiceState::Idle;
        self.region_index = None;
        self.float_position = 0.0;
        self.initial_delay = 0;
        self.phase = 0.0;
        self.note_is_off = false;
        self.streaming_requested = false;
        self.envelope.reset();
        self.filters.clear();
        self.eq_bands.clear();
    }
}
