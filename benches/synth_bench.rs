//! Full-engine benchmarks for the FORZANDO engine
//!
//! Measures block rendering across polyphony levels over an in-memory
//! sample set.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use forzando::file_pool::{AudioReader, InMemoryFile, InMemoryReader};
use forzando::Synth;

use std::path::Path;
use std::sync::Arc;

const BLOCK: usize = 512;

fn make_synth() -> Synth {
    let reader = Arc::new(InMemoryReader::new());
    let data: Vec<f32> = (0..96000).map(|i| (i as f32 * 0.01).sin()).collect();
    reader.insert("tone.wav", InMemoryFile::mono(data, 48000.0));

    let synth = Synth::with_reader(reader as Arc<dyn AudioReader>);
    synth.set_sample_rate(48000.0);
    synth.set_samples_per_block(BLOCK);
    synth.load_sfz_string(
        Path::new(""),
        "<region> sample=tone.wav loop_mode=loop_continuous loop_start=0 loop_end=95999",
    );
    synth
}

fn bench_render_idle(c: &mut Criterion) {
    let synth = make_synth();
    let mut left = vec![0.0f32; BLOCK];
    let mut right = vec![0.0f32; BLOCK];

    c.bench_function("render_idle", |b| {
        b.iter(|| {
            synth.render_block(&mut left, &mut right);
            black_box(left[0])
        })
    });
}

fn bench_render_single_voice(c: &mut Criterion) {
    let synth = make_synth();
    synth.note_on(0, 60, 100);
    let mut left = vec![0.0f32; BLOCK];
    let mut right = vec![0.0f32; BLOCK];

    c.bench_function("render_single_voice", |b| {
        b.iter(|| {
            synth.render_block(&mut left, &mut right);
            black_box(left[0])
        })
    });
}

fn bench_render_polyphony_16(c: &mut Criterion) {
    let synth = make_synth();
    for note in 48..64 {
        synth.note_on(0, note, 100);
    }
    let mut left = vec![0.0f32; BLOCK];
    let mut right = vec![0.0f32; BLOCK];

    c.bench_function("render_polyphony_16", |b| {
        b.iter(|| {
            synth.render_block(&mut left, &mut right);
            black_box(left[0])
        })
    });
}

fn bench_note_dispatch(c: &mut Criterion) {
    let synth = make_synth();
    let mut left = vec![0.0f32; BLOCK];
    let mut right = vec![0.0f32; BLOCK];

    c.bench_function("note_on_off_cycle", |b| {
        b.iter(|| {
            synth.note_on(0, 60, 100);
            synth.note_off(16, 60, 0);
            synth.render_block(&mut left, &mut right);
            black_box(left[0])
        })
    });
}

criterion_group!(
    benches,
    bench_render_idle,
    bench_render_single_voice,
    bench_render_polyphony_16,
    bench_note_dispatch
);
criterion_main!(benches);
