//! Micro-benchmarks for the per-step audio-code sampling path.
//!
//! Run with: `cargo bench -- sampling`

use candle_core::{Device, Tensor};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use xtts_clone::generation::{
    apply_repetition_penalty, sample, suppress_token, GenerationConfig, SamplingContext,
};

/// Audio-code vocabulary of the XTTS-v2 GPT (1024 codes plus start and stop).
const AUDIO_VOCAB: usize = 1026;
const STOP_CODE: u32 = 1025;

fn random_logits(vocab_size: usize, device: &Device) -> Tensor {
    let data: Vec<f32> = (0..vocab_size)
        .map(|i| (i as f32 * 0.1).sin() * 5.0)
        .collect();
    Tensor::new(data, device).unwrap().unsqueeze(0).unwrap()
}

fn bench_sample(c: &mut Criterion) {
    let device = Device::Cpu;
    let logits = random_logits(AUDIO_VOCAB, &device);
    let mut group = c.benchmark_group("sample");

    // Form defaults first, then top-k and top-p each on their own.
    for (name, top_k, top_p) in [("form_defaults", 50, 0.85), ("top_k_only", 50, 1.0), ("top_p_only", 0, 0.85)] {
        let config = GenerationConfig {
            top_k,
            top_p,
            ..Default::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(name), &config, |b, config| {
            let mut ctx = SamplingContext::new(Some(42));
            b.iter(|| sample(black_box(&logits), black_box(config), &mut ctx).unwrap());
        });
    }
    group.finish();
}

fn bench_repetition_penalty(c: &mut Criterion) {
    let device = Device::Cpu;
    let logits = random_logits(AUDIO_VOCAB, &device);
    let mut group = c.benchmark_group("repetition_penalty");

    for n_prev in [0usize, 100, 600] {
        let previous: Vec<u32> = (0..n_prev).map(|i| (i * 7 % 1024) as u32).collect();
        group.bench_with_input(BenchmarkId::from_parameter(format!("prev_{n_prev}")), &previous, |b, previous| {
            b.iter(|| apply_repetition_penalty(black_box(&logits), black_box(previous), 10.0).unwrap());
        });
    }
    group.finish();
}

fn bench_step(c: &mut Criterion) {
    let device = Device::Cpu;
    let logits = random_logits(AUDIO_VOCAB, &device);
    let previous: Vec<u32> = (0..200).map(|i| (i * 13 % 1024) as u32).collect();
    let config = GenerationConfig {
        stop_token_id: Some(STOP_CODE),
        ..Default::default()
    };

    c.bench_function("penalize_suppress_sample", |b| {
        let mut ctx = SamplingContext::new(Some(42));
        b.iter(|| {
            let l = apply_repetition_penalty(black_box(&logits), &previous, config.repetition_penalty).unwrap();
            let l = suppress_token(&l, STOP_CODE).unwrap();
            sample(&l, &config, &mut ctx).unwrap()
        });
    });
}

criterion_group!(benches, bench_sample, bench_repetition_penalty, bench_step);
criterion_main!(benches);
