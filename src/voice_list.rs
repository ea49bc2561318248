//! Voice List Module
//!
//! The bounded voice pool with its stealing policies and the nested
//! polyphony accounting: per-region limits, per-group limits, the
//! `<global>/<master>/<group>` region-set hierarchy, and the engine-wide
//! voice budget. Voices released by the stealing policy fade out inside
//! the oversized pool while their replacements start.

use crate::config;
use crate::region::Region;
use crate::voice::{Voice, VoiceState};

use std::collections::HashMap;

/// Which voice to cut when the pool or a polyphony level is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StealingPolicy {
    /// The lowest-indexed active voice
    First,

    /// The voice that started longest ago
    Oldest,

    /// The quietest voice, weighted towards older ones
    #[default]
    EnvelopeAndAge,
}

/// One node of the `<global>/<master>/<group>` hierarchy.
///
/// Sets form a tree through parent indices; the synth owns them in a
/// flat vector alongside the regions.
#[derive(Debug, Clone)]
pub struct RegionSet {
    pub parent: Option<usize>,
    pub polyphony: Option<usize>,
}

impl RegionSet {
    pub fn new(parent: Option<usize>) -> Self {
        Self {
            parent,
            polyphony: None,
        }
    }
}

/// The pre-allocated voice pool.
pub struct VoiceList {
    voices: Vec<Voice>,

    /// Engine-wide playable voice budget; the pool itself is larger so
    /// stolen voices can fade
    num_required_voices: usize,

    policy: StealingPolicy,
    start_counter: u64,

    /// Per-group polyphony limits from `polyphony` on `<group>` headers
    group_limits: HashMap<u32, usize>,
}

impl VoiceList {
    pub fn new(num_required_voices: usize) -> Self {
        let mut list = Self {
            voices: Vec::new(),
            num_required_voices,
            policy: StealingPolicy::default(),
            start_counter: 0,
            group_limits: HashMap::new(),
        };
        list.resize(num_required_voices);
        list
    }

    /// Resizes the pool to `required * OVERFLOW_VOICE_MULTIPLIER`.
    pub fn resize(&mut self, num_required_voices: usize) {
        self.num_required_voices = num_required_voices;
        let actual = num_required_voices * config::OVERFLOW_VOICE_MULTIPLIER;
        if actual < self.voices.len() {
            self.voices.truncate(actual);
        } else {
            for id in self.voices.len()..actual {
                self.voices.push(Voice::new(id));
            }
        }
    }

    pub fn set_policy(&mut self, policy: StealingPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> StealingPolicy {
        self.policy
    }

    /// Total pool size including overflow headroom.
    pub fn num_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    pub fn voice(&self, index: usize) -> &Voice {
        &self.voices[index]
    }

    pub fn voice_mut(&mut self, index: usize) -> &mut Voice {
        &mut self.voices[index]
    }

    /// Number of voices currently producing sound.
    pub fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|voice| !voice.is_free()).count()
    }

    /// Monotonic counter stamped onto starting voices.
    pub fn next_start_order(&mut self) -> u64 {
        self.start_counter += 1;
        self.start_counter
    }

    /// Installs a group polyphony limit.
    pub fn set_group_polyphony(&mut self, group: u32, limit: usize) {
        self.group_limits.insert(group, limit);
    }

    /// Clears load-time state, keeping the pool.
    pub fn clear_limits(&mut self) {
        self.group_limits.clear();
    }

    /// Picks a free voice, stealing when the engine budget is full.
    ///
    /// Returns the voice index and the extra start delay imposed by a
    /// steal fade, or None when nothing can be allocated.
    pub fn allocate(&mut self, sample_rate: f32) -> Option<(usize, usize)> {
        let active: Vec<usize> = (0..self.voices.len())
            .filter(|&index| !self.voices[index].is_free())
            .collect();

        let mut extra_delay = 0;
        if active.len() >= self.num_required_voices {
            if let Some(victim) = self.steal_candidate(&active) {
                extra_delay = self.steal(victim, sample_rate);
            }
        }

        let free = (0..self.voices.len()).find(|&index| self.voices[index].is_free());
        free.map(|index| (index, extra_delay))
    }

    /// Enforces region, group and set polyphony before a start.
    ///
    /// When a level is full, the victim is chosen among that level's
    /// voices with the configured policy and released. Returns the extra
    /// start delay from the steal fades.
    pub fn check_polyphony(
        &mut self,
        regions: &[Region],
        sets: &[RegionSet],
        region_set_of: &[usize],
        region_index: usize,
        sample_rate: f32,
    ) -> usize {
        let region = &regions[region_index];
        let mut extra_delay = 0;

        // Region-level limit
        if let Some(limit) = region.polyphony {
            let members: Vec<usize> = self.voices_on(|other| other == region_index);
            if members.len() >= limit {
                if let Some(victim) = self.steal_candidate(&members) {
                    extra_delay = extra_delay.max(self.steal(victim, sample_rate));
                }
            }
        }

        // Group-level limit
        if let Some(&limit) = self.group_limits.get(&region.group) {
            let group = region.group;
            let members: Vec<usize> =
                self.voices_on(|other| regions[other].group == group);
            if members.len() >= limit {
                if let Some(victim) = self.steal_candidate(&members) {
                    extra_delay = extra_delay.max(self.steal(victim, sample_rate));
                }
            }
        }

        // Hierarchy-set limits, walking up from the region's set
        let mut set_index = region_set_of.get(region_index).copied();
        while let Some(current) = set_index {
            if let Some(limit) = sets[current].polyphony {
                let members: Vec<usize> = self.voices_on(|other| {
                    let mut chain = region_set_of.get(other).copied();
                    while let Some(ancestor) = chain {
                        if ancestor == current {
                            return true;
                        }
                        chain = sets[ancestor].parent;
                    }
                    false
                });
                if members.len() >= limit {
                    if let Some(victim) = self.steal_candidate(&members) {
                        extra_delay = extra_delay.max(self.steal(victim, sample_rate));
                    }
                }
            }
            set_index = sets[current].parent;
        }

        extra_delay
    }

    /// Voices still holding their note whose region satisfies the
    /// predicate. Releasing voices are already on their way out and do
    /// not count against polyphony limits.
    fn voices_on(&self, mut predicate: impl FnMut(usize) -> bool) -> Vec<usize> {
        (0..self.voices.len())
            .filter(|&index| {
                let voice = &self.voices[index];
                voice.state() == VoiceState::Playing
                    && voice.region_index().map(&mut predicate).unwrap_or(false)
            })
            .collect()
    }

    /// Applies the stealing policy over candidate voice indices.
    pub fn steal_candidate(&self, candidates: &[usize]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match self.policy {
            StealingPolicy::First => candidates.iter().copied().min(),
            StealingPolicy::Oldest => candidates
                .iter()
                .copied()
                .min_by_key(|&index| self.voices[index].start_order()),
            StealingPolicy::EnvelopeAndAge => candidates.iter().copied().min_by(|&a, &b| {
                let score = |index: usize| {
                    let voice = &self.voices[index];
                    voice.envelope_value() / (1.0 + voice.age() as f32)
                };
                score(a)
                    .partial_cmp(&score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
        }
    }

    fn steal(&mut self, victim: usize, sample_rate: f32) -> usize {
        let fade = (config::FAST_RELEASE_SECONDS * sample_rate) as u32;
        log::debug!("stealing voice {}", victim);
        self.voices[victim].steal(fade);
        fade as usize
    }

    /// Resets every voice to the free state.
    pub fn reset_all(&mut self) {
        for voice in &mut self.voices {
            voice.reset();
        }
    }
}
