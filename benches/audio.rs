//! Micro-benchmarks for reference-audio preparation (mel spectrograms,
//! resampling).
//!
//! Run with: `cargo bench -- audio`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::f32::consts::PI;
use std::hint::black_box;
use xtts_clone::audio::{resample, AudioBuffer, MelConfig, MelSpectrogram};

/// 440 Hz sine of the given length.
fn sine_wave(duration_secs: f32, sample_rate: u32) -> Vec<f32> {
    let n = (duration_secs * sample_rate as f32) as usize;
    (0..n)
        .map(|i| (2.0 * PI * 440.0 * i as f32 / sample_rate as f32).sin())
        .collect()
}

fn bench_mel_spectrogram(c: &mut Criterion) {
    let mut group = c.benchmark_group("mel_spectrogram");

    for (name, config) in [("cloning", MelConfig::cloning()), ("speaker", MelConfig::speaker_encoder())] {
        let rate = config.sample_rate;
        let mel = MelSpectrogram::new(config);
        for duration in [3.0f32, 6.0] {
            let samples = sine_wave(duration, rate);
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{name}_{duration}s")),
                &samples,
                |b, samples| b.iter(|| mel.compute(black_box(samples))),
            );
        }
    }
    group.finish();
}

fn bench_resample(c: &mut Criterion) {
    let mut group = c.benchmark_group("resample");

    // Reference recordings are usually 44.1 or 48 kHz.
    for (from_rate, to_rate) in [(44100u32, 22050u32), (48000, 22050), (22050, 16000)] {
        let audio = AudioBuffer::new(sine_wave(6.0, from_rate), from_rate);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{from_rate}to{to_rate}")),
            &audio,
            |b, audio| b.iter(|| resample(black_box(audio), to_rate).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_mel_spectrogram, bench_resample);
criterion_main!(benches);
