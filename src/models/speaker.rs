//! Speaker encoder (squeeze-excitation ResNet) for voice cloning
//!
//! - **Front end**: pre-emphasis, 64-band log mel, per-band instance norm
//! - **SEBasicBlock**: two 3x3 convs with batch norm, channel gating, residual
//! - **Attentive statistics pooling**: softmax attention over time, weighted
//!   mean and standard deviation
//! - **Projection**: linear to the embedding size, L2-normalized
//!
//! Weight prefix: `hifigan_decoder.speaker_encoder.*`

use anyhow::Result;
use candle_core::{Device, Module, ModuleT, Tensor, D};
use candle_nn::{
    batch_norm, conv1d, conv2d, conv2d_no_bias, linear, BatchNorm, BatchNormConfig, Conv1d,
    Conv1dConfig, Conv2d, Conv2dConfig, Linear, VarBuilder,
};

use crate::audio::{resample, AudioBuffer, MelConfig, MelSpectrogram, SPEAKER_ENCODER_SAMPLE_RATE};
use crate::models::config::SpeakerEncoderConfig;

const PREEMPHASIS: f32 = 0.97;
const SE_REDUCTION: usize = 8;

// ── Helpers ─────────────────────────────────────────────────────────────────

/// `y[n] = x[n] - 0.97 * x[n - 1]`, with `x[-1]` reflected to `x[1]`.
fn pre_emphasis(samples: &[f32]) -> Vec<f32> {
    let Some(&first) = samples.first() else {
        return Vec::new();
    };
    let before = samples.get(1).copied().unwrap_or(first);
    let mut out = Vec::with_capacity(samples.len());
    out.push(first - PREEMPHASIS * before);
    out.extend(samples.windows(2).map(|w| w[1] - PREEMPHASIS * w[0]));
    out
}

fn relu(x: &Tensor) -> Result<Tensor> {
    Ok(x.maximum(&x.zeros_like()?)?)
}

fn sigmoid(x: &Tensor) -> Result<Tensor> {
    let neg_x = x.neg()?;
    let exp_neg_x = neg_x.exp()?;
    Ok((exp_neg_x + 1.0)?.recip()?)
}

/// Normalize each row of `[B, C, T]` over time.
fn instance_norm(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    Ok(centered.broadcast_div(&(var + 1e-5)?.sqrt()?)?)
}

fn bn(channels: usize, vb: VarBuilder) -> Result<BatchNorm> {
    Ok(batch_norm(channels, BatchNormConfig::default(), vb)?)
}

// ── Building blocks ─────────────────────────────────────────────────────────

/// Channel gating from globally pooled features.
///
/// Weight keys: `fc.0.*`, `fc.2.*`
struct SqueezeExcitation {
    fc1: Linear,
    fc2: Linear,
}

impl SqueezeExcitation {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = (channels / SE_REDUCTION).max(1);
        Ok(Self {
            fc1: linear(channels, hidden, vb.pp("fc.0"))?,
            fc2: linear(hidden, channels, vb.pp("fc.2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // x: [B, C, H, W]
        let pooled = x.mean(D::Minus1)?.mean(D::Minus1)?; // [B, C]
        let gate = relu(&self.fc1.forward(&pooled)?)?;
        let gate = sigmoid(&self.fc2.forward(&gate)?)?;
        Ok(x.broadcast_mul(&gate.unsqueeze(D::Minus1)?.unsqueeze(D::Minus1)?)?)
    }
}

struct SeBasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    se: SqueezeExcitation,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl SeBasicBlock {
    fn new(inplanes: usize, planes: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let strided = Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let downsample = if stride != 1 || inplanes != planes {
            let cfg = Conv2dConfig {
                stride,
                ..Default::default()
            };
            Some((
                conv2d_no_bias(inplanes, planes, 1, cfg, vb.pp("downsample.0"))?,
                bn(planes, vb.pp("downsample.1"))?,
            ))
        } else {
            None
        };

        Ok(Self {
            conv1: conv2d_no_bias(inplanes, planes, 3, strided, vb.pp("conv1"))?,
            bn1: bn(planes, vb.pp("bn1"))?,
            conv2: conv2d_no_bias(planes, planes, 3, same, vb.pp("conv2"))?,
            bn2: bn(planes, vb.pp("bn2"))?,
            se: SqueezeExcitation::new(planes, vb.pp("se"))?,
            downsample,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = relu(&self.conv1.forward(x)?)?;
        let out = self.bn1.forward_t(&out, false)?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, false)?;
        let out = self.se.forward(&out)?;

        let residual = match &self.downsample {
            Some((conv, norm)) => norm.forward_t(&conv.forward(x)?, false)?,
            None => x.clone(),
        };
        relu(&(out + residual)?)
    }
}

/// Attention weights over time, `[B, C, T]` softmaxed on T.
///
/// Weight keys: `attention.0.*` (conv), `attention.2.*` (batch norm), `attention.3.*` (conv)
struct AttentionPooling {
    conv_in: Conv1d,
    norm: BatchNorm,
    conv_out: Conv1d,
}

impl AttentionPooling {
    fn new(channels: usize, attention_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv_in: conv1d(channels, attention_channels, 1, Conv1dConfig::default(), vb.pp("0"))?,
            norm: bn(attention_channels, vb.pp("2"))?,
            conv_out: conv1d(attention_channels, channels, 1, Conv1dConfig::default(), vb.pp("3"))?,
        })
    }

    /// Weighted mean and standard deviation, `[B, 2C]`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = relu(&self.conv_in.forward(x)?)?;
        let w = self.norm.forward_t(&w, false)?;
        let w = candle_nn::ops::softmax_last_dim(&self.conv_out.forward(&w)?)?;

        let mu = x.mul(&w)?.sum(D::Minus1)?;
        let second = x.sqr()?.mul(&w)?.sum(D::Minus1)?;
        let sg = (second - mu.sqr()?)?.clamp(1e-5, f64::INFINITY)?.sqrt()?;
        Ok(Tensor::cat(&[&mu, &sg], 1)?)
    }
}

// ── Main encoder ────────────────────────────────────────────────────────────

/// ResNet speaker encoder.
///
/// ```text
/// conv1:      Conv2d(1 → f[0], 3x3) → ReLU → BN
/// layer1..4:  SEBasicBlock stacks, strides 1, 2, 2, 2
/// attention:  Conv1d → ReLU → BN → Conv1d → softmax over time
/// fc:         Linear(2 × f[3] × input_dim / 8 → d_vector)
/// ```
pub struct SpeakerEncoder {
    mel_extractor: MelSpectrogram,
    conv1: Conv2d,
    bn1: BatchNorm,
    layers: Vec<Vec<SeBasicBlock>>,
    attention: AttentionPooling,
    fc: Linear,
    device: Device,
}

impl SpeakerEncoder {
    /// The `vb` should already be scoped to the encoder prefix.
    pub fn new(config: &SpeakerEncoderConfig, d_vector_dim: usize, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let filters = &config.num_filters;
        if filters.len() != 4 || config.layers.len() != 4 {
            anyhow::bail!("speaker encoder expects four ResNet stages");
        }

        let mut layers = Vec::with_capacity(4);
        let mut inplanes = filters[0];
        for (i, (&planes, &blocks)) in filters.iter().zip(&config.layers).enumerate() {
            let stride = if i == 0 { 1 } else { 2 };
            let stage = vb.pp(format!("layer{}", i + 1));
            let mut stack = Vec::with_capacity(blocks);
            for j in 0..blocks {
                let s = if j == 0 { stride } else { 1 };
                stack.push(SeBasicBlock::new(inplanes, planes, s, stage.pp(j.to_string()))?);
                inplanes = planes;
            }
            layers.push(stack);
        }

        let pooled_channels = filters[3] * (config.input_dim / 8);
        let conv1_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        Ok(Self {
            mel_extractor: MelSpectrogram::new(MelConfig::speaker_encoder()),
            conv1: conv2d(1, filters[0], 3, conv1_cfg, vb.pp("conv1"))?,
            bn1: bn(filters[0], vb.pp("bn1"))?,
            layers,
            attention: AttentionPooling::new(
                pooled_channels,
                config.attention_channels,
                vb.pp("attention"),
            )?,
            fc: linear(pooled_channels * 2, d_vector_dim, vb.pp("fc"))?,
            device,
        })
    }

    /// Speaker embedding of a reference recording, `[1, d_vector, 1]`.
    ///
    /// Audio at any rate is resampled to 16 kHz first.
    pub fn embed(&self, audio: &AudioBuffer) -> Result<Tensor> {
        let audio = if audio.sample_rate == SPEAKER_ENCODER_SAMPLE_RATE {
            audio.clone()
        } else {
            resample(audio, SPEAKER_ENCODER_SAMPLE_RATE)?
        };
        if audio.is_empty() {
            anyhow::bail!("reference audio is empty");
        }

        let emphasized = pre_emphasis(&audio.samples);
        let mel = self
            .mel_extractor
            .compute_tensor(&emphasized, &self.device)?
            .unsqueeze(0)?; // [1, 64, T]
        let features = instance_norm(&(mel + 1e-6)?.log()?)?;

        Ok(self.forward(&features)?.unsqueeze(D::Minus1)?)
    }

    /// Normalized log-mel `[B, input_dim, T]` to unit-norm `[B, d_vector]`.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let x = features.unsqueeze(1)?; // [B, 1, F, T]
        let x = relu(&self.conv1.forward(&x)?)?;
        let mut x = self.bn1.forward_t(&x, false)?;
        for stack in &self.layers {
            for block in stack {
                x = block.forward(&x)?;
            }
        }

        let (b, c, h, t) = x.dims4()?;
        let x = x.reshape((b, c * h, t))?;
        let pooled = self.attention.forward(&x)?;
        let embed = self.fc.forward(&pooled)?;

        let norm = embed
            .sqr()?
            .sum_keepdim(D::Minus1)?
            .sqrt()?
            .clamp(1e-12, f64::INFINITY)?;
        Ok(embed.broadcast_div(&norm)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::tiny_config;
    use crate::models::test_support::random_vb;

    #[test]
    fn test_pre_emphasis_reflects_first_sample() {
        let out = pre_emphasis(&[1.0, 2.0, 4.0]);
        let expected = [1.0 - 0.97 * 2.0, 2.0 - 0.97, 4.0 - 0.97 * 2.0];
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6);
        }
        assert!(pre_emphasis(&[]).is_empty());
    }

    #[test]
    fn test_relu() {
        let x = Tensor::new(&[-1.0f32, 0.0, 2.0], &Device::Cpu).unwrap();
        let y: Vec<f32> = relu(&x).unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_sigmoid() {
        let x = Tensor::new(&[0.0f32], &Device::Cpu).unwrap();
        let y: Vec<f32> = sigmoid(&x).unwrap().to_vec1().unwrap();
        assert!((y[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_instance_norm_zero_mean_unit_variance() {
        let x = Tensor::new(&[[[1.0f32, 2.0, 3.0, 4.0], [10.0, 10.0, 20.0, 20.0]]], &Device::Cpu)
            .unwrap();
        let y = instance_norm(&x).unwrap();
        let mean: Vec<f32> = y.mean(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let var: Vec<f32> = y
            .sqr()
            .unwrap()
            .mean(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (m, v) in mean.iter().zip(var) {
            assert!(m.abs() < 1e-5);
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_embedding_is_unit_norm() {
        let config = tiny_config();
        let spk = &config.model_args.speaker_encoder;
        let (_varmap, vb) = random_vb(9, |vb| SpeakerEncoder::new(spk, 8, vb).map(|_| ()));
        let encoder = SpeakerEncoder::new(spk, 8, vb).unwrap();

        let samples: Vec<f32> = (0..22050)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();
        let audio = AudioBuffer::new(samples, 22050);
        let embed = encoder.embed(&audio).unwrap();
        assert_eq!(embed.dims(), &[1, 8, 1]);

        let norm: f32 = embed
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .sqrt()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
