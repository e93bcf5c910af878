//! WAV I/O and the in-memory waveform type handed out by synthesis.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Mono waveform with its sample rate.
///
/// Samples are 32-bit floats in \[-1.0, 1.0\]. Synthesis produces these at
/// [`OUTPUT_SAMPLE_RATE`](super::OUTPUT_SAMPLE_RATE); reference recordings are
/// loaded at whatever rate the file has and resampled by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Mono audio samples in \[-1.0, 1.0\] range
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Convert to a `[1, samples]` tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.samples, (1, self.samples.len()), device)?)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Keep at most `seconds` of audio from the start.
    pub fn truncate_seconds(&mut self, seconds: f32) {
        let max_len = (seconds * self.sample_rate as f32) as usize;
        self.samples.truncate(max_len);
    }

    /// Scale so the loudest sample sits at `peak`. Silence is left alone.
    pub fn normalize_peak(&mut self, peak: f32) {
        let max_abs = self.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        if max_abs > 0.0 {
            let scale = peak / max_abs;
            for sample in &mut self.samples {
                *sample *= scale;
            }
        }
    }

    /// Append another buffer recorded at the same rate.
    pub fn append(&mut self, other: &AudioBuffer) -> Result<()> {
        if other.sample_rate != self.sample_rate {
            anyhow::bail!(
                "cannot append {} Hz audio to a {} Hz buffer",
                other.sample_rate,
                self.sample_rate
            );
        }
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_wav(path)
    }
}

/// Load a WAV file, down-mixing to mono.
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to decode WAV file: {}", path.display()))?,
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to decode WAV file: {}", path.display()))?
        }
    };

    let mono = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    Ok(AudioBuffer::new(mono, spec.sample_rate))
}

/// Write mono 16-bit PCM, overwriting any existing file.
pub fn save_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;

    for &sample in samples {
        // NaN maps to silence rather than an arbitrary cast
        let clamped = if sample.is_nan() {
            0.0
        } else {
            sample.clamp(-1.0, 1.0)
        };
        writer.write_sample((clamped * 32767.0) as i16)?;
    }

    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_duration() {
        let buffer = AudioBuffer::new(vec![0.0; 48000], 24000);
        assert!((buffer.duration() - 2.0).abs() < 1e-6);
        assert_eq!(AudioBuffer::new(vec![0.0; 10], 0).duration(), 0.0);
    }

    #[test]
    fn test_truncate_seconds() {
        let mut buffer = AudioBuffer::new(vec![0.1; 22050 * 5], 22050);
        buffer.truncate_seconds(3.0);
        assert_eq!(buffer.len(), 22050 * 3);

        // Shorter than the limit: untouched
        buffer.truncate_seconds(10.0);
        assert_eq!(buffer.len(), 22050 * 3);
    }

    #[test]
    fn test_normalize_peak() {
        let mut buffer = AudioBuffer::new(vec![0.5, -0.25, 0.1], 22050);
        buffer.normalize_peak(0.75);
        assert!((buffer.samples[0] - 0.75).abs() < 1e-6);
        assert!((buffer.samples[1] + 0.375).abs() < 1e-6);

        let mut silent = AudioBuffer::new(vec![0.0; 4], 22050);
        silent.normalize_peak(0.75);
        assert!(silent.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_append_checks_rate() {
        let mut a = AudioBuffer::new(vec![0.1, 0.2], 24000);
        a.append(&AudioBuffer::new(vec![0.3], 24000)).unwrap();
        assert_eq!(a.samples, vec![0.1, 0.2, 0.3]);
        assert!(a.append(&AudioBuffer::new(vec![0.3], 16000)).is_err());
    }

    #[test]
    fn test_tensor_conversion() {
        let device = Device::Cpu;
        let buffer = AudioBuffer::new(vec![0.1, 0.2, 0.3], 24000);
        let tensor = buffer.to_tensor(&device).unwrap();
        assert_eq!(tensor.dims(), &[1, 3]);
        let back: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(back, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_save_and_load_wav() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("voice.wav");

        let original = AudioBuffer::new(vec![0.1, 0.2, -0.3, 0.4, -0.5], 24000);
        original.save(&path).unwrap();

        let loaded = AudioBuffer::load(&path).unwrap();
        assert_eq!(loaded.sample_rate, 24000);
        assert_eq!(loaded.samples.len(), 5);
        for (a, b) in original.samples.iter().zip(loaded.samples.iter()) {
            assert!((a - b).abs() < 1e-4, "sample mismatch: {a} vs {b}");
        }
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..4 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.len(), 4);
        assert!((loaded.samples[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_save_overwrites_and_handles_nan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.wav");
        save_wav(&path, &[0.5; 100], 24000).unwrap();
        save_wav(&path, &[f32::NAN, 2.0], 24000).unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.samples[0], 0.0);
        assert!((loaded.samples[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_load_nonexistent_file() {
        assert!(load_wav("/nonexistent/path/to/file.wav").is_err());
    }
}
