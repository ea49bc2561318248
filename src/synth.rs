//! Synth Module
//!
//! The top-level engine: parses SFZ into regions, dispatches MIDI events
//! through the activation lists, schedules voices with polyphony
//! enforcement, and renders stereo blocks through the effect buses.
//!
//! The public [`Synth`] wraps the engine in the control mutex; the audio
//! thread renders with `try_lock` and falls back to silence while a
//! control-thread operation holds the lock.

use crate::buffer::StereoBuffer;
use crate::config::{self, db_to_mag, EngineConfig};
use crate::curve::{Curve, CurveSet};
use crate::dsp::InterpolatorModel;
use crate::effects::{EffectBus, EffectFactory};
use crate::file_pool::{AudioReader, FilePool};
use crate::midi_state::{normalize_7bit, normalize_bend, MidiState};
use crate::modulation::{ModulationMatrix, SourceKey, TargetKey};
use crate::opcode::Opcode;
use crate::parser::{self, Header, ParsedBlock};
use crate::range::Range;
use crate::region::{
    ModSourceSpec, ModTargetSpec, Region, SampleSource, Trigger, VelocityOverride,
};
use crate::state::PersistedState;
use crate::tuning::Tuning;
use crate::voice::{TriggerEvent, TriggerKind, VoiceState};
use crate::voice_list::{RegionSet, VoiceList};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Rendering contexts for `set_sample_quality`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// Real-time rendering
    ProcessLive,

    /// Offline bounce rendering
    ProcessFreewheeling,
}

/// The embeddable SFZ sampler engine.
pub struct Synth {
    engine: Mutex<Engine>,
}

impl Synth {
    /// Creates an engine with the default WAV reader.
    pub fn new() -> Self {
        Self {
            engine: Mutex::new(Engine::new(FilePool::new())),
        }
    }

    /// Creates an engine over a custom sample reader.
    pub fn with_reader(reader: Arc<dyn AudioReader>) -> Self {
        Self {
            engine: Mutex::new(Engine::new(FilePool::with_reader(reader))),
        }
    }

    fn engine(&self) -> std::sync::MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Audio interface

    pub fn set_sample_rate(&self, sample_rate: f32) {
        self.engine().set_sample_rate(sample_rate);
    }

    pub fn set_samples_per_block(&self, samples_per_block: usize) {
        self.engine().set_samples_per_block(samples_per_block);
    }

    /// Renders one block into two planar channels.
    ///
    /// Never blocks: while a control operation holds the engine, the
    /// block comes out silent.
    pub fn render_block(&self, left: &mut [f32], right: &mut [f32]) {
        match self.engine.try_lock() {
            Ok(mut engine) => engine.render_block(left, right),
            Err(_) => {
                crate::dsp::fill(left, 0.0);
                crate::dsp::fill(right, 0.0);
            }
        }
    }

    // ------------------------------------------------------------------
    // MIDI interface

    pub fn note_on(&self, delay: usize, note: u8, velocity: u8) {
        self.engine().note_on(delay, note, velocity);
    }

    pub fn note_off(&self, delay: usize, note: u8, velocity: u8) {
        self.engine().note_off(delay, note, velocity);
    }

    pub fn cc(&self, delay: usize, cc: usize, value: u8) {
        self.engine().cc(delay, cc, normalize_7bit(value));
    }

    /// High-definition controller event with a normalized value.
    pub fn hdcc(&self, delay: usize, cc: usize, value: f32) {
        self.engine().cc(delay, cc, value.clamp(0.0, 1.0));
    }

    pub fn pitch_wheel(&self, delay: usize, pitch: i32) {
        self.engine().pitch_wheel(delay, pitch);
    }

    pub fn aftertouch(&self, delay: usize, value: u8) {
        self.engine().aftertouch(delay, value);
    }

    pub fn tempo(&self, delay: usize, seconds_per_quarter: f32) {
        self.engine().tempo(delay, seconds_per_quarter);
    }

    pub fn time_signature(&self, _delay: usize, numerator: u16, denominator: u16) {
        let mut engine = self.engine();
        engine.time_signature = (numerator.max(1), denominator.max(1));
    }

    pub fn time_position(&self, _delay: usize, bar: i32, bar_position: f64) {
        let mut engine = self.engine();
        engine.time_position = (bar, bar_position);
    }

    pub fn playback_state(&self, _delay: usize, playing: bool) {
        self.engine().host_playing = playing;
    }

    /// Last time signature the host reported.
    pub fn host_time_signature(&self) -> (u16, u16) {
        self.engine().time_signature
    }

    /// Last transport position the host reported.
    pub fn host_time_position(&self) -> (i32, f64) {
        self.engine().time_position
    }

    /// Whether the host transport is rolling.
    pub fn is_host_playing(&self) -> bool {
        self.engine().host_playing
    }

    // ------------------------------------------------------------------
    // SFZ loading

    /// Loads an SFZ file, replacing the current instrument.
    ///
    /// On failure the engine is left cleared and silent.
    pub fn load_sfz_file(&self, path: &Path) -> bool {
        self.engine().load_sfz_file(path)
    }

    /// Loads SFZ text with sample paths relative to `root`.
    pub fn load_sfz_string(&self, root: &Path, text: &str) -> bool {
        self.engine().load_sfz_string(root, text)
    }

    pub fn num_regions(&self) -> usize {
        self.engine().regions.len()
    }

    /// Opcodes no region understood, for reporting.
    pub fn unknown_opcodes(&self) -> Vec<String> {
        self.engine().unknown_opcodes.iter().cloned().collect()
    }

    /// Labels from `label_ccN` control opcodes.
    pub fn cc_labels(&self) -> Vec<(usize, String)> {
        self.engine().cc_labels.clone()
    }

    // ------------------------------------------------------------------
    // Configuration

    pub fn set_num_voices(&self, num_voices: usize) {
        let mut engine = self.engine();
        if num_voices > 0 {
            engine.config.num_voices = num_voices;
            engine.voices.resize(num_voices);
            let slots = engine.config.actual_num_voices();
            engine.matrix.set_num_voice_slots(slots);
        }
    }

    pub fn set_oversampling_factor(&self, factor: u32) {
        let mut engine = self.engine();
        if matches!(factor, 1 | 2 | 4 | 8) {
            engine.config.oversampling_factor = factor;
            engine.pool.set_oversampling(factor);
            engine.reload_current_file();
        }
    }

    pub fn set_preload_size(&self, preload_size: u32) {
        let mut engine = self.engine();
        engine.config.preload_size = preload_size;
        engine.pool.set_preload_size(preload_size);
        engine.reload_current_file();
    }

    /// Master volume in dB, clamped to the engine's excursion.
    pub fn set_volume(&self, volume_db: f32) {
        let mut engine = self.engine();
        engine.config.volume_db =
            volume_db.clamp(-config::VOLUME_MAX_DB, config::VOLUME_MAX_DB);
    }

    pub fn volume(&self) -> f32 {
        self.engine().config.volume_db
    }

    /// Interpolation quality (1..=10) for one rendering context.
    pub fn set_sample_quality(&self, mode: ProcessMode, quality: i32) {
        let mut engine = self.engine();
        let quality = quality.clamp(1, 10);
        match mode {
            ProcessMode::ProcessLive => engine.live_quality = quality,
            ProcessMode::ProcessFreewheeling => engine.freewheel_quality = quality,
        }
        engine.apply_quality();
    }

    pub fn enable_freewheeling(&self) {
        let mut engine = self.engine();
        engine.config.freewheeling = true;
        engine.apply_quality();
    }

    pub fn disable_freewheeling(&self) {
        let mut engine = self.engine();
        engine.config.freewheeling = false;
        engine.apply_quality();
    }

    /// Seeds the engine's event randomness, for reproducible renders.
    pub fn set_random_seed(&self, seed: u64) {
        self.engine().rng = SmallRng::seed_from_u64(seed);
    }

    /// Starts or synchronously drains the background loaders.
    pub fn set_active(&self, active: bool) {
        self.engine().pool.set_active(active);
    }

    // ------------------------------------------------------------------
    // Tuning

    pub fn load_scala_file(&self, path: &Path) -> bool {
        let mut engine = self.engine();
        let loaded = engine.tuning.load_scala_file(path);
        if loaded {
            engine.scala_path = Some(path.to_path_buf());
        }
        loaded
    }

    pub fn load_scala_string(&self, text: &str) -> bool {
        self.engine().tuning.load_scala_string(text)
    }

    pub fn set_scala_root_key(&self, root_key: i32) {
        self.engine().tuning.set_scala_root_key(root_key);
    }

    pub fn set_tuning_frequency(&self, frequency: f32) {
        self.engine().tuning.set_tuning_frequency(frequency);
    }

    pub fn load_stretch_tuning_by_ratio(&self, ratio: f32) {
        self.engine().tuning.load_stretch_by_ratio(ratio);
    }

    // ------------------------------------------------------------------
    // Persisted state

    /// Captures the host-persisted parameters.
    pub fn persisted_state(&self) -> PersistedState {
        let engine = self.engine();
        PersistedState {
            sfz_file_path: engine
                .sfz_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            volume: engine.config.volume_db,
            num_voices: engine.config.num_voices as i32,
            oversampling_log2: engine.config.oversampling_factor.trailing_zeros() as i32,
            preload_size: engine.config.preload_size as i32,
            scala_file_path: engine
                .scala_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            scala_root_key: engine.scala_root_key,
            tuning_frequency: engine.tuning_frequency,
            stretched_tuning: engine.stretched_tuning,
        }
    }

    /// Applies host-persisted parameters, reloading files as needed.
    pub fn apply_persisted_state(&self, state: &PersistedState) {
        self.set_volume(state.volume);
        if state.num_voices > 0 {
            self.set_num_voices(state.num_voices as usize);
        }
        self.set_oversampling_factor(1 << state.oversampling_log2.clamp(0, 3));
        self.set_preload_size(state.preload_size.max(0) as u32);

        if !state.scala_file_path.is_empty() {
            self.load_scala_file(Path::new(&state.scala_file_path));
        }
        {
            let mut engine = self.engine();
            engine.scala_root_key = state.scala_root_key;
            engine.tuning_frequency = state.tuning_frequency;
            engine.stretched_tuning = state.stretched_tuning;
            engine.tuning.set_scala_root_key(state.scala_root_key);
            engine.tuning.set_tuning_frequency(state.tuning_frequency);
            engine.tuning.load_stretch_by_ratio(state.stretched_tuning);
        }
        if !state.sfz_file_path.is_empty() {
            self.load_sfz_file(Path::new(&state.sfz_file_path));
        }
    }

    // ------------------------------------------------------------------
    // Introspection

    /// Copy of one region's parsed parameters, for inspection.
    pub fn region(&self, index: usize) -> Option<Region> {
        self.engine().regions.get(index).cloned()
    }

    /// Voices still holding their note.
    pub fn playing_voice_count(&self) -> usize {
        self.engine()
            .voices
            .voices()
            .iter()
            .filter(|voice| voice.state() == VoiceState::Playing)
            .count()
    }

    /// Voices producing sound, releases included.
    pub fn active_voice_count(&self) -> usize {
        self.engine().voices.active_voice_count()
    }
}

impl Default for Synth {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine state behind the control mutex.
struct Engine {
    config: EngineConfig,
    sample_rate: f32,
    samples_per_block: usize,

    midi: MidiState,
    regions: Vec<Region>,
    region_sets: Vec<RegionSet>,
    region_set_of: Vec<usize>,
    voices: VoiceList,
    matrix: ModulationMatrix,
    pool: FilePool,
    tuning: Tuning,
    curves: CurveSet,
    effect_buses: Vec<EffectBus>,
    effect_factory: EffectFactory,

    // Dispatch acceleration
    note_activation: Vec<Vec<usize>>,
    cc_activation: Vec<Vec<usize>>,
    previous_keyswitch_regions: Vec<usize>,

    // Control-block state
    unknown_opcodes: BTreeSet<String>,
    cc_labels: Vec<(usize, String)>,
    note_offset: i32,
    octave_offset: i32,
    default_path: PathBuf,
    default_switch: Option<i32>,

    sfz_path: Option<PathBuf>,
    scala_path: Option<PathBuf>,
    scala_root_key: i32,
    tuning_frequency: f32,
    stretched_tuning: f32,

    live_quality: i32,
    freewheel_quality: i32,

    time_signature: (u16, u16),
    time_position: (i32, f64),
    host_playing: bool,

    rng: SmallRng,

    // Render scratch
    voice_buffer: StereoBuffer,
    main_out: StereoBuffer,
    mix_out: StereoBuffer,
}

impl Engine {
    fn new(pool: FilePool) -> Self {
        let config = EngineConfig::default();
        let samples_per_block = config::DEFAULT_SAMPLES_PER_BLOCK;
        Self {
            sample_rate: config::DEFAULT_SAMPLE_RATE,
            samples_per_block,
            midi: MidiState::new(),
            regions: Vec::new(),
            region_sets: Vec::new(),
            region_set_of: Vec::new(),
            voices: VoiceList::new(config.num_voices),
            matrix: ModulationMatrix::new(
                config::DEFAULT_SAMPLE_RATE,
                samples_per_block,
                config.actual_num_voices(),
            ),
            pool,
            tuning: Tuning::new(),
            curves: CurveSet::with_defaults(),
            effect_buses: vec![EffectBus::main(samples_per_block)],
            effect_factory: EffectFactory::new(),
            note_activation: vec![Vec::new(); 128],
            cc_activation: vec![Vec::new(); config::NUM_CCS],
            previous_keyswitch_regions: Vec::new(),
            unknown_opcodes: BTreeSet::new(),
            cc_labels: Vec::new(),
            note_offset: 0,
            octave_offset: 0,
            default_path: PathBuf::new(),
            default_switch: None,
            sfz_path: None,
            scala_path: None,
            scala_root_key: 60,
            tuning_frequency: 440.0,
            stretched_tuning: 0.0,
            live_quality: 2,
            freewheel_quality: 10,
            time_signature: (4, 4),
            time_position: (0, 0.0),
            host_playing: false,
            rng: SmallRng::seed_from_u64(config::DEFAULT_RANDOM_SEED),
            config,
            voice_buffer: StereoBuffer::new(samples_per_block),
            main_out: StereoBuffer::new(samples_per_block),
            mix_out: StereoBuffer::new(samples_per_block),
        }
    }

    fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.midi.set_sample_rate(sample_rate);
        self.matrix.set_sample_rate(sample_rate);
        for voice in self.voices.voices_mut() {
            voice.set_sample_rate(sample_rate);
        }
    }

    fn set_samples_per_block(&mut self, samples_per_block: usize) {
        let samples_per_block = samples_per_block.clamp(1, config::MAX_BLOCK_SIZE);
        self.samples_per_block = samples_per_block;
        self.matrix.set_samples_per_block(samples_per_block);
        for voice in self.voices.voices_mut() {
            voice.set_samples_per_block(samples_per_block);
        }
        for bus in &mut self.effect_buses {
            bus.set_samples_per_block(samples_per_block);
        }
        self.voice_buffer.resize(samples_per_block);
        self.main_out.resize(samples_per_block);
        self.mix_out.resize(samples_per_block);
    }

    fn apply_quality(&mut self) {
        let quality = if self.config.freewheeling {
            self.freewheel_quality
        } else {
            self.live_quality
        };
        let model = InterpolatorModel::from_quality(quality);
        for voice in self.voices.voices_mut() {
            voice.set_quality(model);
        }
    }

    // ------------------------------------------------------------------
    // SFZ loading

    fn clear(&mut self) {
        self.regions.clear();
        self.region_sets.clear();
        self.region_set_of.clear();
        self.voices.reset_all();
        self.voices.clear_limits();
        self.matrix.clear();
        self.curves = CurveSet::with_defaults();
        self.effect_buses.truncate(1);
        self.effect_buses[0] = EffectBus::main(self.samples_per_block);
        for list in &mut self.note_activation {
            list.clear();
        }
        for list in &mut self.cc_activation {
            list.clear();
        }
        self.previous_keyswitch_regions.clear();
        self.midi.reset_all_controllers(0);
        self.unknown_opcodes.clear();
        self.cc_labels.clear();
        self.note_offset = 0;
        self.octave_offset = 0;
        self.default_path = PathBuf::new();
        self.default_switch = None;
    }

    fn load_sfz_file(&mut self, path: &Path) -> bool {
        let outcome = match parser::parse_sfz_file(path) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!("cannot load {}: {}", path.display(), error);
                self.clear();
                return false;
            }
        };
        let root = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        let loaded = self.load_blocks(&root, outcome.blocks, outcome.diagnostics.len());
        if loaded {
            self.sfz_path = Some(path.to_path_buf());
        }
        loaded
    }

    fn load_sfz_string(&mut self, root: &Path, text: &str) -> bool {
        let outcome = parser::parse_sfz(text);
        self.load_blocks(root, outcome.blocks, outcome.diagnostics.len())
    }

    fn reload_current_file(&mut self) {
        if let Some(path) = self.sfz_path.clone() {
            self.load_sfz_file(&path);
        }
    }

    fn load_blocks(&mut self, root: &Path, blocks: Vec<ParsedBlock>, diagnostics: usize) -> bool {
        self.clear();
        if diagnostics > 0 {
            info!("sfz parser skipped {} construct(s)", diagnostics);
        }

        // Opcode stacks for the header hierarchy
        let mut global_opcodes: Vec<Opcode> = Vec::new();
        let mut master_opcodes: Vec<Opcode> = Vec::new();
        let mut group_opcodes: Vec<Opcode> = Vec::new();

        // The implicit global set is index 0
        self.region_sets.push(RegionSet::new(None));
        let global_set = 0usize;
        let mut master_set = global_set;
        let mut current_set = global_set;

        for block in blocks {
            match block.header {
                Header::Global => {
                    global_opcodes = block.opcodes;
                    master_opcodes.clear();
                    group_opcodes.clear();
                    master_set = global_set;
                    current_set = global_set;
                    self.handle_global_opcodes(&global_opcodes);
                    self.region_sets[global_set].polyphony =
                        read_polyphony(&global_opcodes);
                }
                Header::Control => self.handle_control_opcodes(&block.opcodes),
                Header::Master => {
                    master_opcodes = block.opcodes;
                    group_opcodes.clear();
                    self.region_sets.push(RegionSet::new(Some(global_set)));
                    master_set = self.region_sets.len() - 1;
                    current_set = master_set;
                    self.region_sets[master_set].polyphony =
                        read_polyphony(&master_opcodes);
                }
                Header::Group => {
                    group_opcodes = block.opcodes;
                    self.region_sets.push(RegionSet::new(Some(master_set)));
                    current_set = self.region_sets.len() - 1;
                    self.region_sets[current_set].polyphony =
                        read_polyphony(&group_opcodes);
                    self.register_group_polyphony(&group_opcodes);
                }
                Header::Region => {
                    self.build_region(
                        &global_opcodes,
                        &master_opcodes,
                        &group_opcodes,
                        &block.opcodes,
                        current_set,
                    );
                }
                Header::Curve => {
                    self.curves.add(Curve::from_opcodes(&block.opcodes));
                }
                Header::Effect => self.build_effect(&block.opcodes),
            }
        }

        self.resolve_samples(root);
        self.finalize_load();
        !self.regions.is_empty()
    }

    fn handle_global_opcodes(&mut self, opcodes: &[Opcode]) {
        for opcode in opcodes {
            if opcode.name == "sw_default" {
                self.default_switch = opcode.read_note(Range::new(0, 127));
            }
        }
    }

    fn handle_control_opcodes(&mut self, opcodes: &[Opcode]) {
        for opcode in opcodes {
            match opcode.name.as_str() {
                "default_path" => {
                    self.default_path = PathBuf::from(opcode.value.replace('\\', "/"));
                }
                "set_cc" => {
                    if let (Some(cc), Some(value)) =
                        (opcode.parameter, opcode.read(Range::new(0.0f32, 127.0)))
                    {
                        self.midi.cc_event(0, cc as usize, value / 127.0);
                    }
                }
                "set_hdcc" => {
                    if let (Some(cc), Some(value)) =
                        (opcode.parameter, opcode.read(Range::new(0.0f32, 1.0)))
                    {
                        self.midi.cc_event(0, cc as usize, value);
                    }
                }
                "label_cc" => {
                    if let Some(cc) = opcode.parameter {
                        self.cc_labels.push((cc as usize, opcode.value.clone()));
                    }
                }
                "note_offset" => {
                    if let Some(value) = opcode.read(Range::new(-127, 127)) {
                        self.note_offset = value;
                    }
                }
                "octave_offset" => {
                    if let Some(value) = opcode.read(Range::new(-10, 10)) {
                        self.octave_offset = value;
                    }
                }
                name if name.starts_with("hint_") => {}
                other => {
                    self.unknown_opcodes.insert(other.to_string());
                }
            }
        }
    }

    fn register_group_polyphony(&mut self, opcodes: &[Opcode]) {
        let group = opcodes
            .iter()
            .find(|opcode| opcode.name == "group")
            .and_then(|opcode| opcode.read(Range::new(0u32, u32::MAX)));
        let polyphony = read_polyphony(opcodes);
        if let (Some(group), Some(limit)) = (group, polyphony) {
            self.voices.set_group_polyphony(group, limit);
        }
    }

    fn build_region(
        &mut self,
        global: &[Opcode],
        master: &[Opcode],
        group: &[Opcode],
        region_opcodes: &[Opcode],
        set_index: usize,
    ) {
        let id = self.regions.len() as u32;
        let mut region = Region::new(id);

        // Hierarchy levels apply in order, later levels override.
        // Polyphony stays at its own level; the sets account for it.
        for opcode in global.iter().chain(master).chain(group) {
            if opcode.name == "polyphony" || opcode.name == "sw_default" {
                continue;
            }
            if !region.parse_opcode(opcode) {
                self.unknown_opcodes.insert(opcode.name.clone());
            }
        }
        for opcode in region_opcodes {
            if !region.parse_opcode(opcode) {
                self.unknown_opcodes.insert(opcode.name.clone());
            }
        }

        self.regions.push(region);
        self.region_set_of.push(set_index);
    }

    fn build_effect(&mut self, opcodes: &[Opcode]) {
        let bus_index = opcodes
            .iter()
            .find(|opcode| opcode.name == "bus")
            .map(|opcode| match opcode.value.as_str() {
                "main" => 0,
                value => value
                    .strip_prefix("fx")
                    .and_then(|digits| digits.parse::<usize>().ok())
                    .filter(|&index| index >= 1 && index <= 8)
                    .unwrap_or(0),
            })
            .unwrap_or(0);

        while self.effect_buses.len() <= bus_index {
            let bus = EffectBus::new(self.samples_per_block);
            self.effect_buses.push(bus);
        }

        let bus = &mut self.effect_buses[bus_index];
        for opcode in opcodes {
            bus.apply_routing_opcode(opcode);
        }

        if let Some(kind) = opcodes.iter().find(|opcode| opcode.name == "type") {
            match self
                .effect_factory
                .create(&kind.value, opcodes, self.sample_rate)
            {
                Some(effect) => bus.add_effect(effect),
                None => {
                    warn!("unknown effect type: {}", kind.value);
                    self.unknown_opcodes.insert(format!("type={}", kind.value));
                }
            }
        }
    }

    /// Loads sample files and drops regions whose sample cannot load.
    fn resolve_samples(&mut self, root: &Path) {
        let sample_root = if self.default_path.as_os_str().is_empty() {
            root.to_path_buf()
        } else {
            root.join(&self.default_path)
        };
        self.pool.set_root_directory(sample_root);

        let mut kept_regions = Vec::with_capacity(self.regions.len());
        let mut kept_sets = Vec::with_capacity(self.region_set_of.len());
        for (mut region, set_index) in self
            .regions
            .drain(..)
            .zip(self.region_set_of.drain(..).collect::<Vec<_>>())
        {
            match &region.sample {
                SampleSource::None => {
                    warn!("region {} names no sample, dropping it", region.id);
                    continue;
                }
                SampleSource::File(path) => {
                    let path = path.clone();
                    match self.pool.preload(&path) {
                        Ok(handle) => region.set_handle(handle),
                        Err(error) => {
                            warn!("dropping region {}: {}", region.id, error);
                            continue;
                        }
                    }
                }
                SampleSource::Sine | SampleSource::Silence => {}
            }
            kept_regions.push(region);
            kept_sets.push(set_index);
        }
        self.regions = kept_regions;
        self.region_set_of = kept_sets;
    }

    /// Builds activation lists, registers modulations and latches the
    /// initial controller state.
    fn finalize_load(&mut self) {
        for (index, region) in self.regions.iter().enumerate() {
            for note in region.key_range.start()..=region.key_range.end() {
                self.note_activation[note as usize & 127].push(index);
            }

            let has_keyswitch = region.keyswitch_last.is_some()
                || region.keyswitch_down.is_some()
                || region.keyswitch_up.is_some();
            if has_keyswitch {
                for note in region.keyswitch_range.start()..=region.keyswitch_range.end() {
                    let list = &mut self.note_activation[note as usize & 127];
                    if !list.contains(&index) {
                        list.push(index);
                    }
                }
            }
            if region.previous_note.is_some() {
                self.previous_keyswitch_regions.push(index);
            }

            for cc in 0..config::NUM_CCS {
                if region.uses_cc(cc) {
                    self.cc_activation[cc].push(index);
                }
            }
        }

        self.register_modulations();
        self.matrix.set_curves(self.curves.clone());

        // Latch the initial controller and wheel state
        let default_switch = self.default_switch;
        for region in &mut self.regions {
            for cc in 0..config::NUM_CCS {
                region.register_cc(cc, self.midi.cc_value(cc));
            }
            if let Some(switch) = default_switch {
                region.register_note_on(switch, 1.0, 0.5);
                region.register_note_off(switch, 0.0, 0.5);
            }
            region.register_pitch_wheel(0.0);
            region.register_aftertouch(0.0);
            region.register_tempo(0.5);
        }

        info!("loaded {} region(s)", self.regions.len());
    }

    fn register_modulations(&mut self) {
        for region in &self.regions {
            let region_id = region.id;

            let mut connect = |matrix: &mut ModulationMatrix,
                               source: SourceKey,
                               target: TargetKey,
                               depth: f32,
                               vel_to_depth: f32| {
                let source_id = matrix.register_source(source);
                let target_id = matrix.register_target(target);
                matrix.connect(source_id, target_id, depth, vel_to_depth);
            };

            for connection in &region.connections {
                let source = match &connection.source {
                    ModSourceSpec::Cc { cc, curve, smooth, step } => SourceKey::Controller {
                        cc: *cc,
                        curve: *curve,
                        smooth: *smooth,
                        step: *step,
                    },
                    ModSourceSpec::Lfo(index) => SourceKey::Lfo {
                        region: region_id,
                        index: *index as u32,
                        config: region.lfos.get(*index).copied().unwrap_or_default(),
                    },
                    ModSourceSpec::FlexEg(index) => SourceKey::FlexEg {
                        region: region_id,
                        index: *index as u32,
                        description: region.flex_egs.get(*index).cloned().unwrap_or_default(),
                    },
                    ModSourceSpec::PitchEg => SourceKey::PitchEg {
                        region: region_id,
                        description: region.pitch_eg.clone().unwrap_or_default(),
                    },
                    ModSourceSpec::FilterEg => SourceKey::FilterEg {
                        region: region_id,
                        description: region.filter_eg.clone().unwrap_or_default(),
                    },
                };
                let target = target_key(region_id, connection.target);
                connect(
                    &mut self.matrix,
                    source,
                    target,
                    connection.depth,
                    connection.vel_to_depth,
                );
            }

            // The dedicated pitch and filter envelopes route implicitly
            if let Some(description) = &region.pitch_eg {
                connect(
                    &mut self.matrix,
                    SourceKey::PitchEg {
                        region: region_id,
                        description: description.clone(),
                    },
                    TargetKey::Pitch { region: region_id },
                    region.pitch_eg_depth,
                    0.0,
                );
            }
            if let Some(description) = &region.filter_eg {
                connect(
                    &mut self.matrix,
                    SourceKey::FilterEg {
                        region: region_id,
                        description: description.clone(),
                    },
                    TargetKey::FilterCutoff {
                        region: region_id,
                        index: 0,
                    },
                    region.filter_eg_depth,
                    0.0,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // MIDI dispatch

    fn transposed(&self, note: u8) -> i32 {
        (note as i32 + self.note_offset + 12 * self.octave_offset).clamp(0, 127)
    }

    fn note_on(&mut self, delay: usize, note: u8, velocity: u8) {
        if velocity == 0 {
            self.note_off(delay, note, 0);
            return;
        }

        let note = self.transposed(note);
        let velocity = normalize_7bit(velocity);
        self.midi.note_on_event(delay, note as u8, velocity);

        let rand_value: f32 = self.rng.gen();
        let candidates = self.note_activation[note as usize & 127].clone();
        for region_index in candidates {
            if self.regions[region_index].register_note_on(note, velocity, rand_value) {
                let trigger = TriggerEvent {
                    kind: TriggerKind::NoteOn,
                    number: note as u8,
                    value: velocity,
                    channel: 1,
                };
                self.start_voice(region_index, delay, trigger);
            }
        }

        for &region_index in &self.previous_keyswitch_regions.clone() {
            self.regions[region_index].latch_previous_keyswitch(note);
        }
    }

    fn note_off(&mut self, delay: usize, note: u8, velocity: u8) {
        let note = self.transposed(note);

        // Running-status keyboards send zero velocity on note-off
        let velocity = if velocity == 0 {
            self.midi.note_velocity(note as u8)
        } else {
            normalize_7bit(velocity)
        };

        let sustain_held = self.midi.cc_value(config::SUSTAIN_CC) >= config::HALF_CC_THRESHOLD;

        // Release playing voices (or defer to the pedal)
        self.for_each_voice_region(|voice, region, matrix| {
            if voice.register_note_off(delay, note as u8, velocity, sustain_held, region) {
                matrix.release_voice(voice.id(), delay);
            }
        });

        // Fire release-triggered regions
        let rand_value: f32 = self.rng.gen();
        let candidates = self.note_activation[note as usize & 127].clone();
        for region_index in candidates {
            if self.regions[region_index].register_note_off(note, velocity, rand_value) {
                if sustain_held {
                    self.regions[region_index]
                        .delayed_releases
                        .push((note as u8, velocity));
                    continue;
                }
                self.fire_release_region(region_index, delay, note as u8, velocity);
            }
        }
    }

    /// Starts a release-trigger voice when the region qualifies.
    fn fire_release_region(&mut self, region_index: usize, delay: usize, note: u8, velocity: f32) {
        let region = &self.regions[region_index];

        // Plain release regions only sound while their attack voice is
        // still audible, unless the region is marked rt-dead. An
        // instrument with no attack region for the note has no such
        // voice to track, so the release always fires there.
        if region.trigger == Trigger::Release && !region.rt_dead {
            let has_attack_region = self.regions.iter().any(|other| {
                !other.trigger.is_release() && other.key_range.contains_with_end(note as i32)
            });
            let attack_playing = self.voices.voices().iter().any(|voice| {
                !voice.is_free()
                    && voice.trigger_kind() == TriggerKind::NoteOn
                    && voice.trigger_number() == note
            });
            if has_attack_region && !attack_playing {
                return;
            }
        }

        let velocity = match region.velocity_override {
            VelocityOverride::Current => velocity,
            VelocityOverride::Previous => region.last_note_velocity(note as i32),
        };

        let trigger = TriggerEvent {
            kind: TriggerKind::NoteOff,
            number: note,
            value: velocity,
            channel: 1,
        };
        self.start_voice(region_index, delay, trigger);
    }

    fn cc(&mut self, delay: usize, cc: usize, value: f32) {
        if cc >= config::NUM_CCS {
            return;
        }

        // Channel-mode messages
        match cc {
            120 | 123 => {
                // All sound off / all notes off
                self.midi.cc_event(delay, cc, value);
                self.voices.reset_all();
                return;
            }
            121 => {
                self.midi.reset_all_controllers(delay);
                return;
            }
            _ => {}
        }

        let sustain_released =
            cc == config::SUSTAIN_CC && value < config::HALF_CC_THRESHOLD;

        self.midi.cc_event(delay, cc, value);

        // Voices with a deferred note-off release on pedal up
        self.for_each_voice_region(|voice, _region, matrix| {
            if voice.register_cc(delay, cc, value) {
                matrix.release_voice(voice.id(), delay);
            }
        });

        // Regions with queued note-offs fire them on pedal up
        if sustain_released {
            for region_index in 0..self.regions.len() {
                let pending = std::mem::take(&mut self.regions[region_index].delayed_releases);
                for (note, velocity) in pending {
                    self.fire_release_region(region_index, delay, note, velocity);
                }
            }
        }

        // CC-triggered regions and condition latching
        let candidates = self.cc_activation[cc].clone();
        for region_index in candidates {
            if self.regions[region_index].register_cc(cc, value) {
                let trigger = TriggerEvent {
                    kind: TriggerKind::Cc,
                    number: cc as u8,
                    value,
                    channel: 1,
                };
                self.start_voice(region_index, delay, trigger);
            }
        }
    }

    fn pitch_wheel(&mut self, delay: usize, pitch: i32) {
        let bend = normalize_bend(pitch);
        self.midi.pitch_bend_event(delay, bend);
        for region in &mut self.regions {
            region.register_pitch_wheel(bend);
        }
    }

    fn aftertouch(&mut self, delay: usize, value: u8) {
        let value = normalize_7bit(value);
        self.midi.aftertouch_event(delay, value);
        for region in &mut self.regions {
            region.register_aftertouch(value);
        }
    }

    fn tempo(&mut self, delay: usize, seconds_per_quarter: f32) {
        self.midi.tempo_event(delay, seconds_per_quarter);
        for region in &mut self.regions {
            region.register_tempo(seconds_per_quarter);
        }
    }

    /// Runs a closure over every non-free voice with its region and the
    /// matrix, working around the disjoint field borrows.
    fn for_each_voice_region(
        &mut self,
        mut callback: impl FnMut(&mut crate::voice::Voice, &Region, &mut ModulationMatrix),
    ) {
        let regions = &self.regions;
        let matrix = &mut self.matrix;
        for voice in self.voices.voices_mut() {
            if let Some(region_index) = voice.region_index() {
                if let Some(region) = regions.get(region_index) {
                    callback(voice, region, matrix);
                }
            }
        }
    }

    /// Admits a region trigger through off-groups and polyphony, then
    /// starts a voice.
    fn start_voice(&mut self, region_index: usize, delay: usize, trigger: TriggerEvent) {
        // Off-by processing for the triggering region's group
        let group = self.regions[region_index].group;
        self.for_each_voice_region(|voice, region, matrix| {
            if voice.check_off_group(delay, group, region) {
                matrix.release_voice(voice.id(), delay);
            }
        });

        // Nested polyphony limits
        let polyphony_delay = self.voices.check_polyphony(
            &self.regions,
            &self.region_sets,
            &self.region_set_of,
            region_index,
            self.sample_rate,
        );

        // Engine-wide budget and allocation
        let Some((voice_index, steal_delay)) = self.voices.allocate(self.sample_rate) else {
            warn!("voice pool exhausted, dropping event");
            return;
        };

        let delay = delay + polyphony_delay.max(steal_delay);
        let start_order = self.voices.next_start_order();
        let region = &self.regions[region_index];
        let voice = self.voices.voice_mut(voice_index);

        voice.start(
            region_index,
            region,
            delay,
            trigger,
            start_order,
            &self.midi,
            &self.tuning,
            &mut self.rng,
        );
        self.matrix.trigger_voice(
            voice.id(),
            region.id,
            delay,
            trigger.value,
            &self.midi,
        );
    }

    // ------------------------------------------------------------------
    // Rendering

    fn render_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let num_frames = left
            .len()
            .min(right.len())
            .min(self.samples_per_block);

        crate::dsp::fill(left, 0.0);
        crate::dsp::fill(right, 0.0);
        self.main_out.fill(0.0);
        self.mix_out.fill(0.0);
        for bus in &mut self.effect_buses {
            bus.clear();
        }

        self.matrix.begin_cycle(num_frames, &self.midi);

        let Engine {
            regions,
            voices,
            matrix,
            pool,
            midi,
            effect_buses,
            voice_buffer,
            ..
        } = self;

        for voice in voices.voices_mut() {
            let Some(region_index) = voice.region_index() else {
                continue;
            };
            let Some(region) = regions.get(region_index) else {
                continue;
            };

            matrix.begin_voice(voice.id(), region.id, voice.trigger_value());
            voice.render_block(region, matrix, pool, midi, voice_buffer, num_frames);
            matrix.end_voice();

            for (bus_index, bus) in effect_buses.iter_mut().enumerate() {
                let send = region.gain_to_effect_bus(bus_index);
                if send > 0.0 {
                    bus.input_mut().multiply_add1(send, voice_buffer);
                }
            }

            if voice.needs_cleanup() {
                let id = voice.id();
                voice.reset();
                matrix.clear_voice(id);
            }
        }

        for bus in self.effect_buses.iter_mut() {
            bus.process(num_frames);
            bus.mix_outputs_to(&mut self.main_out, &mut self.mix_out);
        }
        self.main_out.add(&self.mix_out);

        let master_gain = db_to_mag(self.config.volume_db);
        crate::dsp::apply_gain1(master_gain, &self.main_out.left()[..num_frames], left);
        crate::dsp::apply_gain1(master_gain, &self.main_out.right()[..num_frames], right);

        self.matrix.end_cycle();
        self.midi.advance_time(num_frames);
        self.pool.garbage_collect();
    }
}

fn read_polyphony(opcodes: &[Opcode]) -> Option<usize> {
    opcodes
        .iter()
        .find(|opcode| opcode.name == "polyphony")
        .and_then(|opcode| opcode.read(Range::new(1u32, 1024)))
        .map(|limit| limit as usize)
}

fn target_key(region_id: u32, spec: ModTargetSpec) -> TargetKey {
    match spec {
        ModTargetSpec::Amplitude => TargetKey::Amplitude { region: region_id },
        ModTargetSpec::Pan => TargetKey::Pan { region: region_id },
        ModTargetSpec::Width => TargetKey::Width { region: region_id },
        ModTargetSpec::Position => TargetKey::Position { region: region_id },
        ModTargetSpec::Pitch => TargetKey::Pitch { region: region_id },
        ModTargetSpec::Volume => TargetKey::Volume { region: region_id },
        ModTargetSpec::FilterCutoff(index) => TargetKey::FilterCutoff {
            region: region_id,
            index: index as u32,
        },
        ModTargetSpec::EqGain(index) => TargetKey::EqGain {
            region: region_id,
            index: index as u32,
        },
    }
}
