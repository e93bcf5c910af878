//! Audio resampling using rubato
//!
//! Reference recordings arrive at arbitrary rates; conditioning needs them at
//! 22.05 kHz (GPT) and 16 kHz (speaker encoder).

use anyhow::{Context, Result};
use rubato::{
    FastFixedIn, PolynomialDegree, Resampler as RubatoResampler, SincFixedIn,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::AudioBuffer;

const CHUNK_SIZE: usize = 1024;

/// Resampling quality preset
#[derive(Debug, Clone, Copy, Default)]
pub enum ResampleQuality {
    /// Cubic polynomial interpolation
    Fast,
    #[default]
    Normal,
    /// Longer sinc kernel, slower
    High,
}

/// Audio resampler
pub struct Resampler {
    quality: ResampleQuality,
}

impl Resampler {
    pub fn new(quality: ResampleQuality) -> Self {
        Self { quality }
    }

    /// Resample audio to a target sample rate.
    ///
    /// The output is aligned with the input (the filter delay is removed) and
    /// holds `ceil(len * target / source)` samples.
    pub fn resample(&self, audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
        if audio.sample_rate == target_rate {
            return Ok(audio.clone());
        }
        if audio.sample_rate == 0 {
            anyhow::bail!("cannot resample audio with a sample rate of 0");
        }
        if audio.is_empty() {
            return Ok(AudioBuffer::new(Vec::new(), target_rate));
        }

        let ratio = target_rate as f64 / audio.sample_rate as f64;
        let expected = (audio.len() as f64 * ratio).ceil() as usize;

        let samples = match self.quality {
            ResampleQuality::Fast => {
                let mut resampler = FastFixedIn::<f32>::new(
                    ratio,
                    1.0,
                    PolynomialDegree::Cubic,
                    CHUNK_SIZE,
                    1,
                )
                .context("Failed to create fast resampler")?;
                process_chunks(&mut resampler, &audio.samples, expected)?
            }
            ResampleQuality::Normal | ResampleQuality::High => {
                let long = matches!(self.quality, ResampleQuality::High);
                let params = SincInterpolationParameters {
                    sinc_len: if long { 256 } else { 128 },
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: if long { 256 } else { 128 },
                    window: WindowFunction::BlackmanHarris2,
                };
                let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_SIZE, 1)
                    .context("Failed to create sinc resampler")?;
                process_chunks(&mut resampler, &audio.samples, expected)?
            }
        };

        Ok(AudioBuffer::new(samples, target_rate))
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new(ResampleQuality::Normal)
    }
}

/// Feed fixed-size chunks (zero-padding the tail) until the delayed output
/// covers `expected` samples, then cut out the aligned window.
fn process_chunks<R: RubatoResampler<f32>>(
    resampler: &mut R,
    samples: &[f32],
    expected: usize,
) -> Result<Vec<f32>> {
    let delay = resampler.output_delay();
    let wanted = delay + expected;
    let mut output = Vec::with_capacity(wanted + CHUNK_SIZE);
    let mut pos = 0;

    while output.len() < wanted {
        let mut chunk = vec![0.0f32; CHUNK_SIZE];
        if pos < samples.len() {
            let end = (pos + CHUNK_SIZE).min(samples.len());
            chunk[..end - pos].copy_from_slice(&samples[pos..end]);
        } else if pos > samples.len() + 16 * CHUNK_SIZE {
            anyhow::bail!("resampler did not produce enough output");
        }
        pos += CHUNK_SIZE;

        let input = vec![chunk];
        let result = resampler
            .process(&input[..], None)
            .context("Resampling failed")?;
        if let Some(channel) = result.into_iter().next() {
            output.extend(channel);
        }
    }

    Ok(output[delay..wanted].to_vec())
}

/// Convenience function to resample audio
pub fn resample(audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    Resampler::default().resample(audio, target_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_no_resample_needed() {
        let audio = AudioBuffer::new(vec![0.25; 1000], 22050);
        let result = resample(&audio, 22050).unwrap();
        assert_eq!(result, audio);
    }

    #[test]
    fn test_output_length_is_exact() {
        let audio = AudioBuffer::new(vec![0.0; 22050], 22050);
        let result = resample(&audio, 16000).unwrap();
        assert_eq!(result.sample_rate, 16000);
        assert_eq!(result.len(), 16000);

        let audio = AudioBuffer::new(vec![0.0; 1600], 16000);
        let result = resample(&audio, 24000).unwrap();
        assert_eq!(result.len(), 2400);
    }

    #[test]
    fn test_fast_and_high_quality() {
        let audio = AudioBuffer::new(vec![0.0; 2048], 48000);
        for quality in [ResampleQuality::Fast, ResampleQuality::High] {
            let result = Resampler::new(quality).resample(&audio, 24000).unwrap();
            assert_eq!(result.sample_rate, 24000);
            assert_eq!(result.len(), 1024);
        }
    }

    #[test]
    fn test_resample_preserves_sine_wave() {
        let freq = 100.0;
        let audio = AudioBuffer::new(
            (0..4800)
                .map(|i| (2.0 * PI * freq * i as f32 / 48000.0).sin())
                .collect(),
            48000,
        );

        let result = resample(&audio, 24000).unwrap();
        let max_val = result
            .samples
            .iter()
            .map(|s| s.abs())
            .fold(0.0f32, f32::max);
        assert!(max_val > 0.5);
    }

    #[test]
    fn test_resample_empty_and_tiny() {
        let result = resample(&AudioBuffer::new(vec![], 24000), 48000).unwrap();
        assert_eq!(result.sample_rate, 48000);
        assert!(result.is_empty());

        let result = resample(&AudioBuffer::new(vec![0.5, -0.5], 24000), 48000).unwrap();
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_zero_rate_is_an_error() {
        assert!(resample(&AudioBuffer::new(vec![0.0; 4], 0), 16000).is_err());
    }
}
