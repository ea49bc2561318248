//! End-to-end tests for the FORZANDO engine
//!
//! Each test drives the full synth through MIDI events and rendered
//! blocks over an in-memory sample set.

mod common;

use common::{calculate_peak, calculate_rms, constant_file, ramp_file, TestRig};
use forzando::{PersistedState, Synth};

use std::f32::consts::FRAC_1_SQRT_2;

// --- Scenario: one region, one note ---
#[test]
fn test_single_region_single_note() {
    let rig = TestRig::new(
        &[("dummy.wav", constant_file(48000, 1.0))],
        "<region> sample=dummy.wav",
    );

    rig.synth.note_on(0, 60, 127);
    assert_eq!(rig.synth.playing_voice_count(), 1);

    let (left, right) = rig.render(512);
    common::assert_samples_are_finite(&left);
    common::assert_samples_in_range(&left, 1.0);

    // Constant sample, instant default attack, center equal-power pan
    assert!((left[10] - FRAC_1_SQRT_2).abs() < 1e-3, "left {}", left[10]);
    assert!((right[10] - FRAC_1_SQRT_2).abs() < 1e-3);
    assert!((left[500] - FRAC_1_SQRT_2).abs() < 1e-3);
}

// --- Scenario: key range and pitch keycenter ---
#[test]
fn test_key_range_and_pitch_keycenter() {
    let sfz = "<region> sample=ramp.wav lokey=60 hikey=72 pitch_keycenter=60 amp_veltrack=0";
    let files = [("ramp.wav", ramp_file(48000))];

    // At the keycenter the ramp plays at unity speed
    let rig = TestRig::new(&files, sfz);
    rig.synth.note_on(0, 60, 100);
    let (left, _) = rig.render(64);
    let slope = (left[40] - left[30]) / 10.0 / FRAC_1_SQRT_2;
    assert!((slope - 1.0).abs() < 0.01, "unity slope, got {}", slope);

    // One octave up doubles the playback speed
    let rig = TestRig::new(&files, sfz);
    rig.synth.note_on(0, 72, 100);
    let (left, _) = rig.render(64);
    let slope = (left[40] - left[30]) / 10.0 / FRAC_1_SQRT_2;
    assert!((slope - 2.0).abs() < 0.02, "double slope, got {}", slope);

    // Below the key range nothing starts
    let rig = TestRig::new(&files, sfz);
    rig.synth.note_on(0, 48, 100);
    assert_eq!(rig.synth.playing_voice_count(), 0);
}

// --- Scenario: hierarchical opcodes ---
#[test]
fn test_hierarchical_opcodes() {
    let sfz = "<global>width=40 <group>pan=30 delay=56 <region>sample=a.wav <region>sample=b.wav \
               <group>pan=-10 delay=36 <region>sample=a.wav <region>sample=b.wav";
    let rig = TestRig::new(
        &[
            ("a.wav", constant_file(256, 0.5)),
            ("b.wav", constant_file(256, 0.5)),
        ],
        sfz,
    );

    assert_eq!(rig.synth.num_regions(), 4);

    for index in 0..2 {
        let region = rig.synth.region(index).unwrap();
        assert_eq!(region.width, 40.0);
        assert_eq!(region.pan, 30.0);
        assert_eq!(region.delay, 56.0);
    }
    for index in 2..4 {
        let region = rig.synth.region(index).unwrap();
        assert_eq!(region.width, 40.0);
        assert_eq!(region.pan, -10.0);
        assert_eq!(region.delay, 36.0);
    }
}

// --- Scenario: release trigger with rt_decay ---
#[test]
fn test_release_trigger_rt_decay() {
    let files = [("r.wav", constant_file(48000, 1.0))];
    let peak_after_release = |rt_decay: &str| -> f32 {
        let sfz = format!(
            "<region> sample=r.wav trigger=release amp_veltrack=0 rt_decay={}",
            rt_decay
        );
        let rig = TestRig::new(&files, &sfz);

        // The note-on starts nothing on a release region
        rig.synth.note_on(0, 60, 100);
        assert_eq!(rig.synth.playing_voice_count(), 0);

        // One second later the note-off fires the release sample
        rig.run_for_samples(48000);
        rig.synth.note_off(0, 60, 0);
        assert_eq!(rig.synth.playing_voice_count(), 1);

        let (left, _) = rig.render(512);
        calculate_peak(&left)
    };

    let nominal = peak_after_release("0");
    let decayed = peak_after_release("6");

    // 6 dB per second of hold time halves the release level
    let ratio = decayed / nominal;
    assert!((ratio - 0.501).abs() < 0.01, "expected -6 dB, ratio {}", ratio);
}

// --- Scenario: polyphony stealing ---
#[test]
fn test_polyphony_stealing() {
    let rig = TestRig::new(
        &[("a.wav", constant_file(48000, 1.0))],
        "<region> sample=a.wav",
    );
    rig.synth.set_num_voices(2);

    rig.synth.note_on(0, 60, 100);
    rig.synth.note_on(0, 64, 100);
    assert_eq!(rig.synth.playing_voice_count(), 2);

    rig.synth.note_on(0, 67, 100);
    // Two voices hold notes; the stolen one fades in the overflow pool
    assert_eq!(rig.synth.playing_voice_count(), 2);
    assert_eq!(rig.synth.active_voice_count(), 3);

    // The fade is 10 ms; after one block the stolen voice is gone
    rig.render(512);
    assert_eq!(rig.synth.active_voice_count(), 2);

    // The oldest note (60) was the one stolen
    rig.synth.note_off(0, 60, 0);
    assert_eq!(rig.synth.playing_voice_count(), 2);
    rig.synth.note_off(0, 64, 0);
    assert_eq!(rig.synth.playing_voice_count(), 1);
}

// --- Scenario: sustain pedal defers releases ---
#[test]
fn test_sustain_pedal_defers_release() {
    let rig = TestRig::new(
        &[("a.wav", constant_file(96000, 1.0))],
        "<region> sample=a.wav ampeg_release=0.2",
    );

    rig.synth.cc(0, 64, 127);
    rig.synth.note_on(0, 60, 100);
    rig.synth.note_off(100, 60, 0);

    // Pedal down: the voice keeps playing
    assert_eq!(rig.synth.playing_voice_count(), 1);
    rig.render(512);
    assert_eq!(rig.synth.playing_voice_count(), 1);

    // Pedal up: the voice moves to its release
    rig.synth.cc(200, 64, 0);
    assert_eq!(rig.synth.playing_voice_count(), 0);
    assert!(rig.synth.active_voice_count() >= 1, "release is still fading");
}

// --- Reload idempotence ---
#[test]
fn test_reload_preserves_region_identity() {
    let files = [
        ("a.wav", constant_file(256, 1.0)),
        ("b.wav", constant_file(256, 1.0)),
    ];
    let sfz = "<region> sample=a.wav lokey=10 hikey=20 <region> sample=b.wav lokey=30 hikey=40";
    let rig = TestRig::new(&files, sfz);

    let first: Vec<u32> = (0..rig.synth.num_regions())
        .map(|index| rig.synth.region(index).unwrap().id)
        .collect();

    assert!(rig.synth.load_sfz_string(std::path::Path::new(""), sfz));
    let second: Vec<u32> = (0..rig.synth.num_regions())
        .map(|index| rig.synth.region(index).unwrap().id)
        .collect();

    assert_eq!(first, second);
    assert_eq!(rig.synth.num_regions(), 2);
}

// --- Deterministic rendering under a fixed seed ---
#[test]
fn test_seeded_rendering_is_bit_identical() {
    let files = [("a.wav", constant_file(48000, 1.0))];
    let sfz = "<region> sample=a.wav amp_random=6 pitch_random=50 delay_random=0.001";

    let render_once = || -> Vec<f32> {
        let rig = TestRig::new(&files, sfz);
        rig.synth.note_on(0, 60, 100);
        rig.synth.note_on(7, 64, 90);
        let (left, _) = rig.render(512);
        left
    };

    let first = render_once();
    let second = render_once();
    assert_eq!(first, second, "same seed must render identically");
    assert!(calculate_rms(&first) > 0.0);
}

// --- Master volume ---
#[test]
fn test_master_volume_scales_output() {
    let files = [("a.wav", constant_file(48000, 1.0))];
    let sfz = "<region> sample=a.wav amp_veltrack=0";

    let rig = TestRig::new(&files, sfz);
    rig.synth.note_on(0, 60, 100);
    let (loud, _) = rig.render(256);

    let rig = TestRig::new(&files, sfz);
    rig.synth.set_volume(-20.0);
    rig.synth.note_on(0, 60, 100);
    let (quiet, _) = rig.render(256);

    let ratio = calculate_peak(&quiet) / calculate_peak(&loud);
    assert!((ratio - 0.1).abs() < 0.005, "-20 dB is a tenth, got {}", ratio);
}

// --- Unknown opcodes are reported, not fatal ---
#[test]
fn test_unknown_opcodes_are_collected() {
    let rig = TestRig::new(
        &[("a.wav", constant_file(256, 1.0))],
        "<region> sample=a.wav gargle=3 volume=-3",
    );
    assert_eq!(rig.synth.num_regions(), 1);
    let unknown = rig.synth.unknown_opcodes();
    assert!(unknown.contains(&"gargle".to_string()));
    assert!(!unknown.contains(&"volume".to_string()));
}

// --- Missing sample files drop their region only ---
#[test]
fn test_missing_sample_drops_region() {
    let rig = TestRig::new(
        &[("real.wav", constant_file(256, 1.0))],
        "<region> sample=real.wav <region> sample=missing.wav",
    );
    assert_eq!(rig.synth.num_regions(), 1);
}

// --- Off-by groups silence each other ---
#[test]
fn test_off_by_group_cuts_voice() {
    let sfz = "<region> sample=a.wav lokey=60 hikey=60 group=1 off_by=2 \
               <region> sample=a.wav lokey=62 hikey=62 group=2";
    let rig = TestRig::new(&[("a.wav", constant_file(96000, 1.0))], sfz);

    rig.synth.note_on(0, 60, 100);
    assert_eq!(rig.synth.playing_voice_count(), 1);

    // The group-2 note silences the group-1 voice
    rig.synth.note_on(0, 62, 100);
    assert_eq!(rig.synth.playing_voice_count(), 1);
    rig.render(512);
    rig.render(512);
    assert_eq!(rig.synth.active_voice_count(), 1);
}

// --- Round robin over two regions ---
#[test]
fn test_sequence_alternates_regions() {
    let sfz = "<region> sample=a.wav seq_length=2 seq_position=1 \
               <region> sample=b.wav seq_length=2 seq_position=2";
    let rig = TestRig::new(
        &[
            ("a.wav", constant_file(4800, 1.0)),
            ("b.wav", constant_file(4800, 1.0)),
        ],
        sfz,
    );

    rig.synth.note_on(0, 60, 100);
    assert_eq!(rig.synth.playing_voice_count(), 1);
    rig.synth.note_on(0, 60, 100);
    assert_eq!(rig.synth.playing_voice_count(), 2);
}

// --- Persisted state through the synth ---
#[test]
fn test_persisted_state_capture_and_apply() {
    let synth = Synth::new();
    synth.set_volume(-7.5);
    synth.set_num_voices(24);
    synth.set_preload_size(4096);

    let state = synth.persisted_state();
    assert_eq!(state.volume, -7.5);
    assert_eq!(state.num_voices, 24);
    assert_eq!(state.preload_size, 4096);

    let mut bytes = Vec::new();
    state.store(&mut bytes).unwrap();
    let loaded = PersistedState::load(&mut std::io::Cursor::new(&bytes)).unwrap();
    assert_eq!(state, loaded);

    let other = Synth::new();
    other.apply_persisted_state(&loaded);
    assert_eq!(other.volume(), -7.5);
    assert_eq!(other.persisted_state().num_voices, 24);
}

// --- Silence with no instrument loaded ---
#[test]
fn test_empty_synth_renders_silence() {
    let synth = Synth::new();
    synth.set_sample_rate(48000.0);
    synth.set_samples_per_block(256);
    synth.note_on(0, 60, 100);

    let mut left = vec![1.0f32; 256];
    let mut right = vec![1.0f32; 256];
    synth.render_block(&mut left, &mut right);
    assert!(left.iter().all(|&x| x == 0.0));
    assert!(right.iter().all(|&x| x == 0.0));
}

// --- Generator regions ---
#[test]
fn test_sine_generator_region() {
    let rig = TestRig::new(&[], "<region> sample=*sine lokey=0 hikey=127");
    rig.synth.note_on(0, 69, 127);
    let (left, right) = rig.render(512);

    let rms = calculate_rms(&left);
    assert!(rms > 0.2, "sine region should sound, rms {}", rms);
    for (l, r) in left.iter().zip(right.iter()) {
        assert!((l - r).abs() < 1e-5);
    }
    common::assert_samples_in_range(&left, 1.0);
}

// --- All sound off ---
#[test]
fn test_all_sound_off_resets_voices() {
    let rig = TestRig::new(
        &[("a.wav", constant_file(96000, 1.0))],
        "<region> sample=a.wav",
    );
    rig.synth.note_on(0, 60, 100);
    rig.synth.note_on(0, 64, 100);
    assert_eq!(rig.synth.active_voice_count(), 2);

    rig.synth.cc(0, 120, 0);
    assert_eq!(rig.synth.active_voice_count(), 0);
}

// --- Velocity crossfades stay continuous across the range ---
#[test]
fn test_velocity_crossfade_monotonic() {
    let files = [("a.wav", constant_file(48000, 1.0))];
    let sfz = "<region> sample=a.wav xfin_lovel=20 xfin_hivel=100 amp_veltrack=0";

    let mut last_peak = -1.0f32;
    for velocity in [10u8, 30, 50, 70, 90, 110] {
        let rig = TestRig::new(&files, sfz);
        rig.synth.note_on(0, 60, velocity);
        let (left, _) = rig.render(128);
        let peak = calculate_peak(&left);
        assert!(
            peak >= last_peak - 1e-4,
            "crossfade regressed at velocity {}: {} < {}",
            velocity,
            peak,
            last_peak
        );
        last_peak = peak;
    }
    assert!(last_peak > 0.7, "full velocity reaches nominal level");
}
