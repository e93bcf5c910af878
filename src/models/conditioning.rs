//! Voice conditioning for the GPT: a convolutional attention encoder over the
//! reference mel followed by a perceiver that resamples it to a fixed number
//! of latents.
//!
//! Weight prefixes: `gpt.conditioning_encoder.*`, `gpt.conditioning_perceiver.*`

use anyhow::Result;
use candle_core::{Module, Tensor, D};
use candle_nn::{conv1d, group_norm, linear, linear_no_bias, Conv1d, Conv1dConfig, GroupNorm, Linear, VarBuilder};

use super::config::PerceiverConfig;

const GROUP_NORM_EPS: f64 = 1e-5;
const RMS_NORM_EPS: f64 = 1e-12;

/// Group count for a channel width: 32, fewer for narrow layers, halved until
/// it divides the width.
pub fn norm_groups(channels: usize) -> usize {
    let mut groups = if channels <= 16 {
        8
    } else if channels <= 64 {
        16
    } else {
        32
    };
    while groups > 1 && channels % groups != 0 {
        groups /= 2;
    }
    groups
}

fn pointwise(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv1d> {
    Ok(conv1d(in_c, out_c, 1, Conv1dConfig::default(), vb)?)
}

/// Self-attention over the time axis of a `[batch, channels, time]` map.
struct AttentionBlock {
    norm: GroupNorm,
    qkv: Conv1d,
    proj_out: Conv1d,
    num_heads: usize,
}

impl AttentionBlock {
    fn new(channels: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: group_norm(norm_groups(channels), channels, GROUP_NORM_EPS, vb.pp("norm"))?,
            qkv: pointwise(channels, channels * 3, vb.pp("qkv"))?,
            proj_out: pointwise(channels, channels, vb.pp("proj_out"))?,
            num_heads,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, time) = x.dims3()?;
        let x = self.norm.forward(x)?;
        let qkv = self.qkv.forward(&x)?;

        let ch = channels / self.num_heads;
        let qkv = qkv.reshape((batch * self.num_heads, ch * 3, time))?;
        // Both sides are scaled by ch^-1/4 so the product carries ch^-1/2
        let scale = 1.0 / (ch as f64).sqrt().sqrt();
        let q = (qkv.narrow(1, 0, ch)? * scale)?;
        let k = (qkv.narrow(1, ch, ch)? * scale)?;
        let v = qkv.narrow(1, 2 * ch, ch)?;

        let weights = q.transpose(1, 2)?.contiguous()?.matmul(&k.contiguous()?)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let h = v
            .contiguous()?
            .matmul(&weights.transpose(1, 2)?.contiguous()?)?
            .reshape((batch, channels, time))?;

        Ok((x + self.proj_out.forward(&h)?)?)
    }
}

/// Mel to `[batch, hidden, frames]` conditioning features.
pub struct ConditioningEncoder {
    init: Conv1d,
    attn: Vec<AttentionBlock>,
}

impl ConditioningEncoder {
    pub fn new(
        spec_dim: usize,
        embedding_dim: usize,
        attn_blocks: usize,
        num_heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let attn = (0..attn_blocks)
            .map(|i| AttentionBlock::new(embedding_dim, num_heads, vb.pp(format!("attn.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            init: pointwise(spec_dim, embedding_dim, vb.pp("init"))?,
            attn,
        })
    }

    pub fn forward(&self, mel: &Tensor) -> Result<Tensor> {
        let mut h = self.init.forward(mel)?;
        for block in &self.attn {
            h = block.forward(&h)?;
        }
        Ok(h)
    }
}

// ── Perceiver ─────────────────────────────────────────────────────────

/// Cross-attention from the latents to `[latents | context]`.
struct PerceiverAttention {
    to_q: Linear,
    to_kv: Linear,
    to_out: Linear,
    heads: usize,
    dim_head: usize,
}

impl PerceiverAttention {
    fn new(dim: usize, heads: usize, dim_head: usize, vb: VarBuilder) -> Result<Self> {
        let inner = heads * dim_head;
        Ok(Self {
            to_q: linear_no_bias(dim, inner, vb.pp("to_q"))?,
            to_kv: linear_no_bias(dim, inner * 2, vb.pp("to_kv"))?,
            to_out: linear_no_bias(inner, dim, vb.pp("to_out"))?,
            heads,
            dim_head,
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, len, _) = x.dims3()?;
        Ok(x.reshape((batch, len, self.heads, self.dim_head))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, latents: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (batch, n, _) = latents.dims3()?;
        let context = Tensor::cat(&[latents, context], 1)?;

        let inner = self.heads * self.dim_head;
        let kv = self.to_kv.forward(&context)?;
        let q = self.split_heads(&self.to_q.forward(latents)?)?;
        let k = self.split_heads(&kv.narrow(D::Minus1, 0, inner)?)?;
        let v = self.split_heads(&kv.narrow(D::Minus1, inner, inner)?)?;

        let scale = 1.0 / (self.dim_head as f64).sqrt();
        let weights = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, n, inner))?;

        Ok(self.to_out.forward(&out)?)
    }
}

/// Linear, GEGLU, linear.
struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
    inner: usize,
}

impl FeedForward {
    fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        let inner = dim * mult * 2 / 3;
        Ok(Self {
            proj_in: linear(dim, inner * 2, vb.pp("0"))?,
            proj_out: linear(inner, dim, vb.pp("2"))?,
            inner,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.proj_in.forward(x)?;
        let value = h.narrow(D::Minus1, 0, self.inner)?;
        let gate = h.narrow(D::Minus1, self.inner, self.inner)?;
        let h = (gate.gelu_erf()? * value)?;
        Ok(self.proj_out.forward(&h)?)
    }
}

/// Resamples a variable-length sequence to a fixed set of latents.
pub struct PerceiverResampler {
    latents: Tensor,
    layers: Vec<(PerceiverAttention, FeedForward)>,
    gamma: Tensor,
    scale: f64,
}

impl PerceiverResampler {
    pub fn new(dim: usize, config: &PerceiverConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..config.depth)
            .map(|i| {
                let layer = vb.pp(format!("layers.{i}"));
                Ok((
                    PerceiverAttention::new(dim, config.heads, config.dim_head, layer.pp("0"))?,
                    FeedForward::new(dim, config.ff_mult, layer.pp("1"))?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            latents: vb.get((config.num_latents, dim), "latents")?,
            layers,
            gamma: vb.get(dim, "norm.gamma")?,
            scale: (dim as f64).sqrt(),
        })
    }

    /// `[batch, frames, dim]` to `[batch, num_latents, dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let (n, dim) = self.latents.dims2()?;
        let mut latents = self.latents.unsqueeze(0)?.broadcast_as((batch, n, dim))?.contiguous()?;

        for (attn, ff) in &self.layers {
            latents = (attn.forward(&latents, x)? + &latents)?;
            latents = (ff.forward(&latents)? + &latents)?;
        }

        // L2-normalize, rescale by sqrt(dim), then per-channel gain
        let norm = latents
            .sqr()?
            .sum_keepdim(D::Minus1)?
            .sqrt()?
            .clamp(RMS_NORM_EPS, f64::INFINITY)?;
        let out = (latents.broadcast_div(&norm)? * self.scale)?;
        Ok(out.broadcast_mul(&self.gamma)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::random_vb;
    use candle_core::Device;

    #[test]
    fn test_norm_groups() {
        assert_eq!(norm_groups(1024), 32);
        assert_eq!(norm_groups(32), 16);
        assert_eq!(norm_groups(16), 8);
        assert_eq!(norm_groups(12), 4);
        assert_eq!(norm_groups(80), 16);
    }

    #[test]
    fn test_encoder_keeps_time_axis() {
        let (_varmap, vb) = random_vb(1, |vb| ConditioningEncoder::new(80, 32, 2, 2, vb).map(|_| ()));
        let enc = ConditioningEncoder::new(80, 32, 2, 2, vb).unwrap();
        let mel = Tensor::randn(0f32, 1.0, (1, 80, 13), &Device::Cpu).unwrap();
        let out = enc.forward(&mel).unwrap();
        assert_eq!(out.dims(), &[1, 32, 13]);
    }

    #[test]
    fn test_perceiver_output_is_fixed_length_and_scaled() {
        let config = PerceiverConfig {
            num_latents: 4,
            depth: 2,
            heads: 2,
            dim_head: 8,
            ff_mult: 2,
        };
        let (varmap, vb) = random_vb(2, |vb| PerceiverResampler::new(32, &config, vb).map(|_| ()));
        // Unit gain so the output rows have norm sqrt(dim)
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name == "norm.gamma" {
                var.set(&Tensor::ones(32, candle_core::DType::F32, &Device::Cpu).unwrap())
                    .unwrap();
            }
        }
        let perceiver = PerceiverResampler::new(32, &config, vb).unwrap();

        for frames in [3, 17] {
            let x = Tensor::randn(0f32, 1.0, (1, frames, 32), &Device::Cpu).unwrap();
            let out = perceiver.forward(&x).unwrap();
            assert_eq!(out.dims(), &[1, 4, 32]);

            let norms: Vec<f32> = out
                .sqr()
                .unwrap()
                .sum(D::Minus1)
                .unwrap()
                .sqrt()
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            for n in norms {
                assert!((n - 32f32.sqrt()).abs() < 1e-3, "row norm {n}");
            }
        }
    }
}
