//! Modulation Matrix Module
//!
//! Directed bipartite graph from modulation sources to render targets.
//! Evaluation is lazy and memoized: a target buffer is computed on the
//! first pull within a cycle or voice and handed back unchanged until the
//! next `begin_cycle`/`begin_voice`. A target marks itself ready before
//! computing, so re-entrant pulls terminate with the neutral element
//! instead of recursing.

use crate::curve::CurveSet;
use crate::dsp;
use crate::envelope::{AdsrEnvelope, FlexEnvelope};
use crate::lfo::Lfo;
use crate::midi_state::MidiState;
use crate::modulation::sources::{ControllerState, VoiceGenerator};
use crate::modulation::{Combinator, SourceKey, TargetKey};

use std::collections::HashMap;

/// Stable handle to a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceId(pub(crate) usize);

/// Stable handle to a registered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetId(pub(crate) usize);

/// One edge of the graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connection {
    pub source: SourceId,

    /// Scalar depth in target units
    pub depth: f32,

    /// Extra depth added per unit of trigger velocity
    pub vel_to_depth: f32,
}

struct Source {
    key: SourceKey,
    ready: bool,
    buffer: Vec<f32>,

    /// Per-cycle controller state
    controller: Option<ControllerState>,

    /// Per-voice generator slots, indexed by voice id
    voice_states: Vec<Option<VoiceGenerator>>,
}

struct Target {
    key: TargetKey,
    combinator: Combinator,
    ready: bool,
    buffer: Vec<f32>,
    connections: Vec<Connection>,
}

/// The modulation matrix.
pub struct ModulationMatrix {
    sample_rate: f32,
    samples_per_block: usize,
    num_frames: usize,
    num_voice_slots: usize,

    current_voice: Option<usize>,
    current_region: Option<u32>,
    current_velocity: f32,

    sources: Vec<Source>,
    targets: Vec<Target>,
    source_index: HashMap<(u8, u32, u32), usize>,
    target_index: HashMap<TargetKey, usize>,

    curves: CurveSet,
    temp: Vec<f32>,
}

impl ModulationMatrix {
    pub fn new(sample_rate: f32, samples_per_block: usize, num_voice_slots: usize) -> Self {
        Self {
            sample_rate,
            samples_per_block,
            num_frames: 0,
            num_voice_slots,
            current_voice: None,
            current_region: None,
            current_velocity: 0.0,
            sources: Vec::new(),
            targets: Vec::new(),
            source_index: HashMap::new(),
            target_index: HashMap::new(),
            curves: CurveSet::with_defaults(),
            temp: vec![0.0; samples_per_block],
        }
    }

    /// Installs the engine curve set used by controller sources.
    pub fn set_curves(&mut self, curves: CurveSet) {
        self.curves = curves;
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        for source in &mut self.sources {
            if let (Some(controller), SourceKey::Controller { smooth, .. }) =
                (source.controller.as_mut(), &source.key)
            {
                controller.setup(*smooth, sample_rate);
            }
        }
    }

    pub fn set_samples_per_block(&mut self, samples_per_block: usize) {
        self.samples_per_block = samples_per_block;
        self.temp.resize(samples_per_block, 0.0);
        for source in &mut self.sources {
            source.buffer.resize(samples_per_block, 0.0);
        }
        for target in &mut self.targets {
            target.buffer.resize(samples_per_block, 0.0);
        }
    }

    pub fn set_num_voice_slots(&mut self, num_voice_slots: usize) {
        self.num_voice_slots = num_voice_slots;
        for source in &mut self.sources {
            if source.key.is_per_voice() {
                source.voice_states.resize_with(num_voice_slots, || None);
            }
        }
    }

    /// Drops the whole graph, keeping sizes.
    pub fn clear(&mut self) {
        self.sources.clear();
        self.targets.clear();
        self.source_index.clear();
        self.target_index.clear();
    }

    /// Registers a source, returning the existing id for a duplicate key.
    pub fn register_source(&mut self, key: SourceKey) -> SourceId {
        let dedup = key.dedup_key();
        if let Some(&index) = self.source_index.get(&dedup) {
            return SourceId(index);
        }

        let mut controller = None;
        let mut voice_states = Vec::new();
        if let SourceKey::Controller { smooth, .. } = &key {
            let mut state = ControllerState::default();
            state.setup(*smooth, self.sample_rate);
            controller = Some(state);
        } else {
            voice_states.resize_with(self.num_voice_slots, || None);
        }

        let index = self.sources.len();
        self.sources.push(Source {
            key,
            ready: false,
            buffer: vec![0.0; self.samples_per_block],
            controller,
            voice_states,
        });
        self.source_index.insert(dedup, index);
        SourceId(index)
    }

    /// Registers a target, returning the existing id for a duplicate key.
    pub fn register_target(&mut self, key: TargetKey) -> TargetId {
        if let Some(&index) = self.target_index.get(&key) {
            return TargetId(index);
        }

        let index = self.targets.len();
        self.targets.push(Target {
            key,
            combinator: key.combinator(),
            ready: false,
            buffer: vec![0.0; self.samples_per_block],
            connections: Vec::new(),
        });
        self.target_index.insert(key, index);
        TargetId(index)
    }

    /// Looks up a target registered earlier.
    pub fn find_target(&self, key: TargetKey) -> Option<TargetId> {
        self.target_index.get(&key).map(|&index| TargetId(index))
    }

    /// Connects a source to a target.
    pub fn connect(
        &mut self,
        source: SourceId,
        target: TargetId,
        depth: f32,
        vel_to_depth: f32,
    ) -> bool {
        if source.0 >= self.sources.len() || target.0 >= self.targets.len() {
            return false;
        }
        self.targets[target.0].connections.push(Connection {
            source,
            depth,
            vel_to_depth,
        });
        true
    }

    /// Number of registered sources.
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Number of registered targets.
    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    /// Instantiates and triggers the per-voice generators of a region's
    /// sources for one starting voice.
    pub fn trigger_voice(
        &mut self,
        voice_id: usize,
        region_id: u32,
        delay: usize,
        velocity: f32,
        midi: &MidiState,
    ) {
        if voice_id >= self.num_voice_slots {
            return;
        }
        let cc_lookup = |cc: usize| midi.cc_value(cc);
        for source in &mut self.sources {
            if source.key.region() != Some(region_id) {
                continue;
            }
            let generator = match &source.key {
                SourceKey::Lfo { config, .. } => {
                    VoiceGenerator::Lfo(Lfo::new(*config, self.sample_rate))
                }
                SourceKey::FlexEg { description, .. } => {
                    let mut envelope = FlexEnvelope::new(description.clone(), self.sample_rate);
                    envelope.trigger();
                    VoiceGenerator::FlexEg(envelope)
                }
                SourceKey::AmpEg { description, .. }
                | SourceKey::PitchEg { description, .. }
                | SourceKey::FilterEg { description, .. } => {
                    let mut envelope = AdsrEnvelope::new();
                    envelope.trigger(
                        description.to_parameters(self.sample_rate, velocity, &cc_lookup),
                        delay as u32,
                    );
                    VoiceGenerator::AdsrEg(envelope)
                }
                SourceKey::Controller { .. } => continue,
            };
            source.voice_states[voice_id] = Some(generator);
        }
    }

    /// Releases the envelope generators of one voice.
    pub fn release_voice(&mut self, voice_id: usize, delay: usize) {
        for source in &mut self.sources {
            if let Some(Some(generator)) = source.voice_states.get_mut(voice_id) {
                generator.release(delay);
            }
        }
    }

    /// Drops the generators of one voice once it has reset.
    pub fn clear_voice(&mut self, voice_id: usize) {
        for source in &mut self.sources {
            if let Some(slot) = source.voice_states.get_mut(voice_id) {
                *slot = None;
            }
        }
    }

    /// Starts a render cycle: clears memoization and renders the
    /// per-cycle controller sources from the MIDI state.
    pub fn begin_cycle(&mut self, num_frames: usize, midi: &MidiState) {
        let num_frames = num_frames.min(self.samples_per_block);
        self.num_frames = num_frames;
        self.current_voice = None;
        self.current_region = None;

        for target in &mut self.targets {
            target.ready = false;
        }

        for source in &mut self.sources {
            source.ready = false;
            if let (Some(controller), SourceKey::Controller { cc, curve, step, .. }) =
                (source.controller.as_mut(), &source.key)
            {
                controller.generate(
                    midi.cc_events(*cc),
                    &self.curves,
                    *curve,
                    *step,
                    &mut source.buffer[..num_frames],
                );
                source.ready = true;
            }
        }
    }

    /// Enters one voice's evaluation context.
    pub fn begin_voice(&mut self, voice_id: usize, region_id: u32, velocity: f32) {
        self.current_voice = Some(voice_id);
        self.current_region = Some(region_id);
        self.current_velocity = velocity;

        for source in &mut self.sources {
            if source.key.is_per_voice() {
                source.ready = false;
            }
        }
        for target in &mut self.targets {
            target.ready = false;
        }
    }

    /// Leaves the voice context, advancing any generator the targets did
    /// not pull so per-voice state stays time-aligned.
    pub fn end_voice(&mut self) {
        let num_frames = self.num_frames;
        if let (Some(voice_id), Some(region_id)) = (self.current_voice, self.current_region) {
            for source in &mut self.sources {
                if source.ready || source.key.region() != Some(region_id) {
                    continue;
                }
                if let Some(Some(generator)) = source.voice_states.get_mut(voice_id) {
                    generator.generate(&mut self.temp[..num_frames]);
                }
            }
        }
        self.current_voice = None;
        self.current_region = None;
    }

    /// Ends the render cycle.
    pub fn end_cycle(&mut self) {
        self.num_frames = 0;
    }

    /// Evaluates and returns one target's modulation buffer for the
    /// current voice, of `num_frames` length.
    pub fn get_modulation(&mut self, target_id: TargetId) -> Option<&[f32]> {
        let num_frames = self.num_frames;
        let target_index = target_id.0;
        if target_index >= self.targets.len() {
            return None;
        }

        // Per-voice targets only resolve within their region's context
        if self.targets[target_index].key.region() != self.current_region.unwrap_or(u32::MAX) {
            return None;
        }

        if self.targets[target_index].ready {
            return Some(&self.targets[target_index].buffer[..num_frames]);
        }

        // Mark ready before computing to break evaluation cycles
        self.targets[target_index].ready = true;

        let combinator = self.targets[target_index].combinator;
        let velocity = self.current_velocity;
        let mut first = true;

        for connection_index in 0..self.targets[target_index].connections.len() {
            let connection = self.targets[target_index].connections[connection_index];
            let source_index = connection.source.0;

            if !self.source_accepted(source_index) {
                continue;
            }
            if !self.generate_source(source_index) {
                continue;
            }

            let depth = connection.depth + connection.vel_to_depth * velocity;
            let source_buffer = &self.sources[source_index].buffer[..num_frames];
            let target_buffer = &mut self.targets[target_index].buffer[..num_frames];

            if first {
                dsp::apply_gain1(depth, source_buffer, target_buffer);
                first = false;
            } else {
                let temp = &mut self.temp[..num_frames];
                dsp::copy(source_buffer, temp);
                match combinator {
                    Combinator::Additive => dsp::multiply_add1(depth, temp, target_buffer),
                    Combinator::Multiplicative => {
                        for (out, value) in target_buffer.iter_mut().zip(temp.iter()) {
                            *out *= depth * value;
                        }
                    }
                    Combinator::PercentMultiplicative => {
                        for (out, value) in target_buffer.iter_mut().zip(temp.iter()) {
                            *out *= 0.01 * depth * value;
                        }
                    }
                }
            }
        }

        if first {
            let neutral = combinator.neutral();
            dsp::fill(&mut self.targets[target_index].buffer[..num_frames], neutral);
        }

        Some(&self.targets[target_index].buffer[..num_frames])
    }

    fn source_accepted(&self, source_index: usize) -> bool {
        let source = &self.sources[source_index];
        match source.key.region() {
            None => true,
            Some(region) => self.current_region == Some(region),
        }
    }

    /// Renders a source buffer if it is not memoized yet. Returns false
    /// when the source has no live generator for the current voice.
    fn generate_source(&mut self, source_index: usize) -> bool {
        if self.sources[source_index].ready {
            return true;
        }

        let num_frames = self.num_frames;
        let source = &mut self.sources[source_index];

        if !source.key.is_per_voice() {
            // Controllers render eagerly in begin_cycle; reaching this
            // point means an empty cycle
            return false;
        }

        let Some(voice_id) = self.current_voice else {
            return false;
        };
        let Some(Some(generator)) = source.voice_states.get_mut(voice_id) else {
            return false;
        };

        generator.generate(&mut source.buffer[..num_frames]);
        source.ready = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lfo::{LfoConfig, LfoWaveform};

    fn matrix() -> ModulationMatrix {
        ModulationMatrix::new(1000.0, 64, 4)
    }

    fn controller_key(cc: usize) -> SourceKey {
        SourceKey::Controller {
            cc,
            curve: 0,
            smooth: 0.0,
            step: 0.0,
        }
    }

    #[test]
    fn test_registration_deduplicates() {
        let mut matrix = matrix();
        let first = matrix.register_source(controller_key(7));
        let second = matrix.register_source(controller_key(7));
        assert_eq!(first, second);
        assert_eq!(matrix.num_sources(), 1);

        let target = TargetKey::Pitch { region: 0 };
        let a = matrix.register_target(target);
        let b = matrix.register_target(target);
        assert_eq!(a, b);
        assert_eq!(matrix.num_targets(), 1);
    }

    #[test]
    fn test_unmodulated_target_returns_neutral() {
        let mut matrix = matrix();
        let pitch = matrix.register_target(TargetKey::Pitch { region: 0 });
        let amplitude = matrix.register_target(TargetKey::Amplitude { region: 0 });

        let midi = MidiState::new();
        matrix.begin_cycle(16, &midi);
        matrix.begin_voice(0, 0, 1.0);

        let buffer = matrix.get_modulation(pitch).unwrap();
        assert!(buffer.iter().all(|&x| x == 0.0));

        let buffer = matrix.get_modulation(amplitude).unwrap();
        assert!(buffer.iter().all(|&x| x == 100.0));
    }

    #[test]
    fn test_controller_modulates_target() {
        let mut matrix = matrix();
        let source = matrix.register_source(controller_key(1));
        let target = matrix.register_target(TargetKey::Pitch { region: 0 });
        assert!(matrix.connect(source, target, 200.0, 0.0));

        let mut midi = MidiState::new();
        midi.cc_event(0, 1, 0.5);
        midi.advance_time(64);

        matrix.begin_cycle(16, &midi);
        matrix.begin_voice(0, 0, 1.0);
        let buffer = matrix.get_modulation(target).unwrap();
        assert!(buffer.iter().all(|&x| (x - 100.0).abs() < 1e-4));
    }

    #[test]
    fn test_vel_to_depth_scales_with_velocity() {
        let mut matrix = matrix();
        let source = matrix.register_source(controller_key(1));
        let target = matrix.register_target(TargetKey::Pitch { region: 0 });
        matrix.connect(source, target, 0.0, 100.0);

        let mut midi = MidiState::new();
        midi.cc_event(0, 1, 1.0);
        midi.advance_time(64);

        matrix.begin_cycle(8, &midi);
        matrix.begin_voice(0, 0, 0.5);
        let buffer = matrix.get_modulation(target).unwrap();
        assert!(buffer.iter().all(|&x| (x - 50.0).abs() < 1e-4));
    }

    #[test]
    fn test_memoization_within_voice() {
        let mut matrix = matrix();
        let config = LfoConfig {
            rate: 125.0,
            waveform: LfoWaveform::Saw,
            ..Default::default()
        };
        let source = matrix.register_source(SourceKey::Lfo {
            region: 0,
            index: 0,
            config,
        });
        let target = matrix.register_target(TargetKey::Pitch { region: 0 });
        matrix.connect(source, target, 1.0, 0.0);

        let midi = MidiState::new();
        matrix.trigger_voice(0, 0, 0, 1.0, &midi);
        matrix.begin_cycle(8, &midi);
        matrix.begin_voice(0, 0, 1.0);

        let first: Vec<f32> = matrix.get_modulation(target).unwrap().to_vec();
        let second: Vec<f32> = matrix.get_modulation(target).unwrap().to_vec();
        // The generator must not advance twice within one voice context
        assert_eq!(first, second);
    }

    #[test]
    fn test_per_voice_source_rejected_for_other_region() {
        let mut matrix = matrix();
        let lfo = matrix.register_source(SourceKey::Lfo {
            region: 1,
            index: 0,
            config: LfoConfig::default(),
        });
        let target = matrix.register_target(TargetKey::Pitch { region: 0 });
        matrix.connect(lfo, target, 100.0, 0.0);

        let midi = MidiState::new();
        matrix.trigger_voice(0, 1, 0, 1.0, &midi);
        matrix.begin_cycle(8, &midi);
        matrix.begin_voice(0, 0, 1.0);

        // The cross-region source is filtered out, leaving the neutral
        let buffer = matrix.get_modulation(target).unwrap();
        assert!(buffer.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_target_of_foreign_region_is_unreachable() {
        let mut matrix = matrix();
        let target = matrix.register_target(TargetKey::Pitch { region: 5 });

        let midi = MidiState::new();
        matrix.begin_cycle(8, &midi);
        matrix.begin_voice(0, 0, 1.0);
        assert!(matrix.get_modulation(target).is_none());
    }

    #[test]
    fn test_two_sources_combine_additively() {
        let mut matrix = matrix();
        let a = matrix.register_source(controller_key(1));
        let b = matrix.register_source(controller_key(2));
        let target = matrix.register_target(TargetKey::Volume { region: 0 });
        matrix.connect(a, target, 6.0, 0.0);
        matrix.connect(b, target, -2.0, 0.0);

        let mut midi = MidiState::new();
        midi.cc_event(0, 1, 1.0);
        midi.cc_event(0, 2, 1.0);
        midi.advance_time(64);

        matrix.begin_cycle(8, &midi);
        matrix.begin_voice(0, 0, 1.0);
        let buffer = matrix.get_modulation(target).unwrap();
        assert!(buffer.iter().all(|&x| (x - 4.0).abs() < 1e-4));
    }

    #[test]
    fn test_amp_eg_source_releases() {
        use crate::envelope::EgDescription;

        let mut matrix = matrix();
        let description = EgDescription {
            sustain: 1.0,
            release: 0.004,
            ..EgDescription::default()
        };
        let source = matrix.register_source(SourceKey::AmpEg {
            region: 0,
            description,
        });
        let target = matrix.register_target(TargetKey::Amplitude { region: 0 });
        matrix.connect(source, target, 100.0, 0.0);

        let midi = MidiState::new();
        matrix.trigger_voice(0, 0, 0, 1.0, &midi);

        matrix.begin_cycle(8, &midi);
        matrix.begin_voice(0, 0, 1.0);
        let sustained: Vec<f32> = matrix.get_modulation(target).unwrap().to_vec();
        assert!(sustained.iter().all(|&x| (x - 100.0).abs() < 1e-3));
        matrix.end_voice();
        matrix.end_cycle();

        matrix.release_voice(0, 0);

        matrix.begin_cycle(8, &midi);
        matrix.begin_voice(0, 0, 1.0);
        let released = matrix.get_modulation(target).unwrap();
        // 4 ms release at 1 kHz: silent before the block ends
        assert!(released[6].abs() < 1.0);
    }
}
