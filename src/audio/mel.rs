//! Mel-spectrogram computation
//!
//! Follows torchaudio's `MelSpectrogram` transform: centered reflect-padded
//! STFT, a window shorter than the FFT is zero-padded on both sides, and the
//! triangular filterbank is built on either the HTK or the Slaney mel scale.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;

/// Analysis window applied to each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Hann,
    Hamming,
}

/// Frequency-to-mel mapping used to place the filterbank triangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MelScale {
    /// `2595 * log10(1 + f / 700)`
    Htk,
    /// Linear below 1 kHz, logarithmic above
    Slaney,
}

/// Configuration for mel spectrogram computation
#[derive(Debug, Clone)]
pub struct MelConfig {
    /// Sample rate of input audio
    pub sample_rate: u32,
    /// FFT window size
    pub n_fft: usize,
    /// Hop length between frames
    pub hop_length: usize,
    /// Window length (defaults to n_fft)
    pub win_length: Option<usize>,
    /// Number of mel bands
    pub n_mels: usize,
    /// Minimum frequency for mel filterbank
    pub fmin: f32,
    /// Maximum frequency for mel filterbank (defaults to sample_rate / 2)
    pub fmax: Option<f32>,
    pub window: WindowKind,
    pub mel_scale: MelScale,
    /// Area-normalize each filter (`norm="slaney"`)
    pub slaney_norm: bool,
    /// Reflect-pad `n_fft / 2` on both sides before framing
    pub center: bool,
    /// Exponent applied to the magnitude spectrum (2.0 = power)
    pub power: f32,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            n_fft: 1024,
            hop_length: 256,
            win_length: None,
            n_mels: 80,
            fmin: 0.0,
            fmax: None,
            window: WindowKind::Hann,
            mel_scale: MelScale::Htk,
            slaney_norm: false,
            center: true,
            power: 2.0,
        }
    }
}

impl MelConfig {
    /// Mel used to condition the GPT on the reference voice.
    pub fn cloning() -> Self {
        Self {
            sample_rate: 22050,
            n_fft: 2048,
            hop_length: 256,
            win_length: Some(1024),
            n_mels: 80,
            fmin: 0.0,
            fmax: Some(8000.0),
            window: WindowKind::Hann,
            mel_scale: MelScale::Htk,
            slaney_norm: true,
            center: true,
            power: 2.0,
        }
    }

    /// Mel fed to the ResNet speaker encoder (16 kHz input).
    pub fn speaker_encoder() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 512,
            hop_length: 160,
            win_length: Some(400),
            n_mels: 64,
            fmin: 0.0,
            fmax: None,
            window: WindowKind::Hamming,
            mel_scale: MelScale::Htk,
            slaney_norm: false,
            center: true,
            power: 2.0,
        }
    }
}

/// Mel-spectrogram extractor
pub struct MelSpectrogram {
    config: MelConfig,
    /// Precomputed mel filterbank, `[n_mels][n_fft / 2 + 1]`
    mel_basis: Vec<Vec<f32>>,
    /// Window zero-padded to `n_fft`
    window: Vec<f32>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Self {
        let win_length = config.win_length.unwrap_or(config.n_fft).min(config.n_fft);
        let fmax = config.fmax.unwrap_or(config.sample_rate as f32 / 2.0);

        let mel_basis = Self::create_mel_filterbank(&config, fmax);

        let short = match config.window {
            WindowKind::Hann => Self::hann_window(win_length),
            WindowKind::Hamming => Self::hamming_window(win_length),
        };
        let offset = (config.n_fft - win_length) / 2;
        let mut window = vec![0.0f32; config.n_fft];
        window[offset..offset + win_length].copy_from_slice(&short);

        Self {
            config,
            mel_basis,
            window,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Mel spectrogram as `[n_frames][n_mels]`.
    pub fn compute(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let power = self.config.power;
        let spec: Vec<Vec<f32>> = self
            .stft(samples)
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .map(|c| {
                        let mag_sq = c.norm_sqr();
                        if power == 2.0 {
                            mag_sq
                        } else {
                            mag_sq.sqrt().powf(power)
                        }
                    })
                    .collect()
            })
            .collect();

        self.apply_mel_filterbank(&spec)
    }

    /// Mel spectrogram as a `[n_mels, n_frames]` tensor.
    pub fn compute_tensor(&self, samples: &[f32], device: &Device) -> Result<Tensor> {
        let mel = self.compute(samples);
        Self::frames_to_tensor(mel, self.config.n_mels, device)
    }

    /// `ln(max(mel, floor))` as a `[n_mels, n_frames]` tensor.
    pub fn compute_log_tensor(
        &self,
        samples: &[f32],
        floor: f32,
        device: &Device,
    ) -> Result<Tensor> {
        let log_mel: Vec<Vec<f32>> = self
            .compute(samples)
            .into_iter()
            .map(|frame| frame.into_iter().map(|v| v.max(floor).ln()).collect())
            .collect();
        Self::frames_to_tensor(log_mel, self.config.n_mels, device)
    }

    fn frames_to_tensor(frames: Vec<Vec<f32>>, n_mels: usize, device: &Device) -> Result<Tensor> {
        let n_frames = frames.len();
        let flat: Vec<f32> = frames.into_iter().flatten().collect();
        Ok(Tensor::from_vec(flat, (n_frames, n_mels), device)?.t()?.contiguous()?)
    }

    /// Short-time Fourier transform, positive frequencies only.
    fn stft(&self, samples: &[f32]) -> Vec<Vec<Complex<f32>>> {
        let n_fft = self.config.n_fft;
        let hop_length = self.config.hop_length.max(1);

        let padded = if self.config.center {
            reflect_pad(samples, n_fft / 2)
        } else {
            samples.to_vec()
        };
        if padded.len() < n_fft {
            return Vec::new();
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);

        let n_frames = (padded.len() - n_fft) / hop_length + 1;
        let mut result = Vec::with_capacity(n_frames);

        for i in 0..n_frames {
            let start = i * hop_length;
            let mut buffer: Vec<Complex<f32>> = padded[start..start + n_fft]
                .iter()
                .zip(self.window.iter())
                .map(|(&s, &w)| Complex::new(s * w, 0.0))
                .collect();

            fft.process(&mut buffer);
            buffer.truncate(n_fft / 2 + 1);
            result.push(buffer);
        }

        result
    }

    fn apply_mel_filterbank(&self, spec: &[Vec<f32>]) -> Vec<Vec<f32>> {
        spec.iter()
            .map(|frame| {
                self.mel_basis
                    .iter()
                    .map(|filter| filter.iter().zip(frame.iter()).map(|(f, p)| f * p).sum())
                    .collect()
            })
            .collect()
    }

    fn hz_to_mel(f: f32, scale: MelScale) -> f32 {
        match scale {
            MelScale::Htk => 2595.0 * (1.0 + f / 700.0).log10(),
            MelScale::Slaney => {
                const F_SP: f32 = 200.0 / 3.0;
                const MIN_LOG_HZ: f32 = 1000.0;
                const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
                const LOGSTEP: f32 = 0.068_751_74; // ln(6.4) / 27
                if f < MIN_LOG_HZ {
                    f / F_SP
                } else {
                    MIN_LOG_MEL + (f / MIN_LOG_HZ).ln() / LOGSTEP
                }
            }
        }
    }

    fn mel_to_hz(m: f32, scale: MelScale) -> f32 {
        match scale {
            MelScale::Htk => 700.0 * (10f32.powf(m / 2595.0) - 1.0),
            MelScale::Slaney => {
                const F_SP: f32 = 200.0 / 3.0;
                const MIN_LOG_HZ: f32 = 1000.0;
                const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
                const LOGSTEP: f32 = 0.068_751_74;
                if m < MIN_LOG_MEL {
                    m * F_SP
                } else {
                    MIN_LOG_HZ * ((m - MIN_LOG_MEL) * LOGSTEP).exp()
                }
            }
        }
    }

    /// Triangular filterbank over `n_fft / 2 + 1` linear bins.
    fn create_mel_filterbank(config: &MelConfig, fmax: f32) -> Vec<Vec<f32>> {
        let n_freqs = config.n_fft / 2 + 1;
        let n_mels = config.n_mels;
        let scale = config.mel_scale;

        let mel_min = Self::hz_to_mel(config.fmin, scale);
        let mel_max = Self::hz_to_mel(fmax, scale);
        let hz_points: Vec<f32> = (0..=n_mels + 1)
            .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
            .map(|m| Self::mel_to_hz(m, scale))
            .collect();

        let fft_freqs: Vec<f32> = (0..n_freqs)
            .map(|i| i as f32 * config.sample_rate as f32 / config.n_fft as f32)
            .collect();

        let mut filterbank = vec![vec![0.0f32; n_freqs]; n_mels];

        for (i, filter) in filterbank.iter_mut().enumerate() {
            let f_lower = hz_points[i];
            let f_center = hz_points[i + 1];
            let f_upper = hz_points[i + 2];

            for (val, &freq) in filter.iter_mut().zip(fft_freqs.iter()) {
                let up = if f_center > f_lower {
                    (freq - f_lower) / (f_center - f_lower)
                } else {
                    0.0
                };
                let down = if f_upper > f_center {
                    (f_upper - freq) / (f_upper - f_center)
                } else {
                    0.0
                };
                *val = up.min(down).max(0.0);
            }

            if config.slaney_norm {
                let band_width = f_upper - f_lower;
                if band_width > 0.0 {
                    let enorm = 2.0 / band_width;
                    for val in filter.iter_mut() {
                        *val *= enorm;
                    }
                }
            }
        }

        filterbank
    }

    /// Periodic Hann window
    fn hann_window(length: usize) -> Vec<f32> {
        (0..length)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / length as f32).cos()))
            .collect()
    }

    /// Periodic Hamming window
    fn hamming_window(length: usize) -> Vec<f32> {
        (0..length)
            .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f32 / length as f32).cos())
            .collect()
    }
}

/// Reflect-pad without repeating the edge sample. Signals shorter than the
/// pad clamp to their last index.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if samples.is_empty() {
        return vec![0.0; 2 * pad];
    }
    let last = samples.len() - 1;
    let mut padded = Vec::with_capacity(samples.len() + 2 * pad);
    for i in (1..=pad).rev() {
        padded.push(samples[i.min(last)]);
    }
    padded.extend_from_slice(samples);
    for i in 0..pad {
        padded.push(samples[last.saturating_sub(i + 1)]);
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_presets() {
        let cloning = MelConfig::cloning();
        assert_eq!(cloning.n_fft, 2048);
        assert_eq!(cloning.hop_length, 256);
        assert_eq!(cloning.fmax, Some(8000.0));
        assert!(cloning.slaney_norm);

        let spk = MelConfig::speaker_encoder();
        assert_eq!(spk.sample_rate, 16000);
        assert_eq!(spk.n_mels, 64);
        assert_eq!(spk.window, WindowKind::Hamming);
    }

    #[test]
    fn test_windows() {
        let hann = MelSpectrogram::hann_window(4);
        assert!((hann[0] - 0.0).abs() < 1e-6);
        assert!((hann[2] - 1.0).abs() < 1e-6);

        let hamming = MelSpectrogram::hamming_window(4);
        assert!((hamming[0] - 0.08).abs() < 1e-6);
        assert!((hamming[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_short_window_is_centered() {
        let mel = MelSpectrogram::new(MelConfig::speaker_encoder());
        assert_eq!(mel.window.len(), 512);
        // (512 - 400) / 2 zeros on each side
        assert!(mel.window[..56].iter().all(|&w| w == 0.0));
        assert!(mel.window[56] > 0.0);
        assert!(mel.window[456..].iter().all(|&w| w == 0.0));
    }

    #[test]
    fn test_htk_round_trip() {
        for hz in [0.0f32, 440.0, 1000.0, 8000.0] {
            let m = MelSpectrogram::hz_to_mel(hz, MelScale::Htk);
            let back = MelSpectrogram::mel_to_hz(m, MelScale::Htk);
            assert!((back - hz).abs() < 0.05, "{hz} -> {back}");
        }
        assert!((MelSpectrogram::hz_to_mel(700.0, MelScale::Htk) - 2595.0 * 2f32.log10()).abs() < 1e-3);
    }

    #[test]
    fn test_filterbank_shape_and_sign() {
        let mel = MelSpectrogram::new(MelConfig::default());
        assert_eq!(mel.mel_basis.len(), 80);
        assert_eq!(mel.mel_basis[0].len(), 513);
        assert!(mel.mel_basis.iter().flatten().all(|&v| v >= 0.0));
        // Every filter catches at least one bin
        assert!(mel.mel_basis.iter().all(|f| f.iter().any(|&v| v > 0.0)));
    }

    #[test]
    fn test_fmax_limits_filterbank() {
        let mel = MelSpectrogram::new(MelConfig::cloning());
        // Bins above 8 kHz receive no weight
        let cutoff_bin = (8000.0 * 2048.0 / 22050.0) as usize + 2;
        for filter in &mel.mel_basis {
            assert!(filter[cutoff_bin..].iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_centered_frame_count() {
        let mel = MelSpectrogram::new(MelConfig::cloning());
        let frames = mel.compute(&vec![0.0f32; 22050]);
        // center=True gives 1 + len / hop frames
        assert_eq!(frames.len(), 1 + 22050 / 256);
    }

    #[test]
    fn test_silence_is_zero() {
        let mel = MelSpectrogram::new(MelConfig::speaker_encoder());
        let result = mel.compute(&vec![0.0f32; 16000]);
        assert!(result.iter().flatten().all(|&v| v < 1e-9));
    }

    #[test]
    fn test_sine_energy_lands_in_low_bands() {
        let mel = MelSpectrogram::new(MelConfig::default());
        let result = mel.compute(&sine(300.0, 22050, 22050));
        let mid = &result[result.len() / 2];
        let (peak_band, _) = mid
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        assert!(peak_band < 20, "peak band {peak_band}");
    }

    #[test]
    fn test_log_tensor_floor_and_shape() {
        let mel = MelSpectrogram::new(MelConfig::cloning());
        let device = Device::Cpu;
        let tensor = mel
            .compute_log_tensor(&vec![0.0f32; 22050], 1e-5, &device)
            .unwrap();
        assert_eq!(tensor.dims(), &[80, 87]);
        let min = tensor.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap();
        assert!((min - 1e-5f32.ln()).abs() < 1e-4);
    }

    #[test]
    fn test_reflect_pad() {
        assert_eq!(reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2), vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
        assert_eq!(reflect_pad(&[], 1), vec![0.0, 0.0]);
        assert_eq!(reflect_pad(&[5.0], 2).len(), 5);
    }
}
