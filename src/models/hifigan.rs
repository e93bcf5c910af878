//! HiFi-GAN vocoder conditioned on a speaker embedding.
//!
//! GPT latents are stretched to the vocoder frame rate with linear
//! interpolation, then upsampled to a waveform by transposed convolutions
//! interleaved with dilated residual blocks. The speaker embedding is added
//! after the input convolution and after every upsampling stage.
//!
//! Weight prefix: `hifigan_decoder.waveform_decoder.*`

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{
    conv1d, Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, VarBuilder,
};

use super::config::XttsConfig;

const LRELU_SLOPE: f64 = 0.1;

/// Load a possibly weight-normalized kernel of `shape`.
///
/// Accepts both the legacy `weight_g`/`weight_v` pair and the newer
/// parametrization layout, falling back to a plain `weight`. The norm is
/// taken over every axis except the first.
pub fn load_weight_norm(shape: (usize, usize, usize), vb: &VarBuilder) -> Result<Tensor> {
    let pair = if vb.contains_tensor("weight_g") {
        Some(("weight_g", "weight_v"))
    } else if vb.contains_tensor("parametrizations.weight.original0") {
        Some((
            "parametrizations.weight.original0",
            "parametrizations.weight.original1",
        ))
    } else {
        None
    };

    let Some((g_name, v_name)) = pair else {
        return Ok(vb.get(shape, "weight")?);
    };

    let g = vb.get((shape.0, 1, 1), g_name)?;
    let v = vb.get(shape, v_name)?;
    let norm = v.sqr()?.sum_keepdim(1)?.sum_keepdim(2)?.sqrt()?;
    Ok(v.broadcast_mul(&g.broadcast_div(&norm)?)?)
}

fn wn_conv1d(
    in_c: usize,
    out_c: usize,
    kernel: usize,
    config: Conv1dConfig,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv1d> {
    let weight = load_weight_norm((out_c, in_c, kernel), &vb)?;
    let bias = if bias { Some(vb.get(out_c, "bias")?) } else { None };
    Ok(Conv1d::new(weight, bias, config))
}

fn wn_conv_transpose1d(
    in_c: usize,
    out_c: usize,
    kernel: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<ConvTranspose1d> {
    // Transposed kernels are stored [in, out, kernel]
    let weight = load_weight_norm((in_c, out_c, kernel), &vb)?;
    let bias = vb.get(out_c, "bias")?;
    let config = ConvTranspose1dConfig {
        padding: (kernel - stride) / 2,
        output_padding: 0,
        stride,
        dilation: 1,
        groups: 1,
    };
    Ok(ConvTranspose1d::new(weight, Some(bias), config))
}

/// Two dilated convolutions per dilation, each pair residual.
struct ResBlock {
    convs1: Vec<Conv1d>,
    convs2: Vec<Conv1d>,
}

impl ResBlock {
    fn new(channels: usize, kernel: usize, dilations: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::with_capacity(dilations.len());
        for (j, &d) in dilations.iter().enumerate() {
            let dilated = Conv1dConfig {
                padding: (kernel * d - d) / 2,
                dilation: d,
                ..Default::default()
            };
            let plain = Conv1dConfig {
                padding: (kernel - 1) / 2,
                ..Default::default()
            };
            convs1.push(wn_conv1d(channels, channels, kernel, dilated, true, vb.pp(format!("convs1.{j}")))?);
            convs2.push(wn_conv1d(channels, channels, kernel, plain, true, vb.pp(format!("convs2.{j}")))?);
        }
        Ok(Self { convs1, convs2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (c1, c2) in self.convs1.iter().zip(&self.convs2) {
            let xt = c1.forward(&leaky_relu(&x, LRELU_SLOPE)?)?;
            let xt = c2.forward(&leaky_relu(&xt, LRELU_SLOPE)?)?;
            x = (xt + x)?;
        }
        Ok(x)
    }
}

/// Waveform generator.
pub struct HifiganGenerator {
    conv_pre: Conv1d,
    cond_layer: Conv1d,
    ups: Vec<ConvTranspose1d>,
    conds: Vec<Conv1d>,
    resblocks: Vec<ResBlock>,
    num_kernels: usize,
    conv_post: Conv1d,
}

impl HifiganGenerator {
    pub fn new(config: &XttsConfig, vb: VarBuilder) -> Result<Self> {
        let a = &config.model_args;
        let h = &a.hifigan;
        let uic = h.upsample_initial_channel;
        let edge = Conv1dConfig {
            padding: 3,
            ..Default::default()
        };

        let mut ups = Vec::new();
        let mut conds = Vec::new();
        let mut resblocks = Vec::new();
        let mut ch = uic;
        for (i, (&rate, &kernel)) in h
            .upsample_rates
            .iter()
            .zip(&h.upsample_kernel_sizes)
            .enumerate()
        {
            let next = uic >> (i + 1);
            ups.push(wn_conv_transpose1d(ch, next, kernel, rate, vb.pp(format!("ups.{i}")))?);
            if a.cond_d_vector_in_each_upsampling_layer {
                conds.push(conv1d(a.d_vector_dim, next, 1, Conv1dConfig::default(), vb.pp(format!("conds.{i}")))?);
            }
            for (j, (&k, dilations)) in h
                .resblock_kernel_sizes
                .iter()
                .zip(&h.resblock_dilation_sizes)
                .enumerate()
            {
                let idx = i * h.resblock_kernel_sizes.len() + j;
                resblocks.push(ResBlock::new(next, k, dilations, vb.pp(format!("resblocks.{idx}")))?);
            }
            ch = next;
        }

        Ok(Self {
            conv_pre: wn_conv1d(a.decoder_input_dim, uic, 7, edge, true, vb.pp("conv_pre"))?,
            cond_layer: conv1d(a.d_vector_dim, uic, 1, Conv1dConfig::default(), vb.pp("cond_layer"))?,
            ups,
            conds,
            resblocks,
            num_kernels: h.resblock_kernel_sizes.len(),
            conv_post: wn_conv1d(ch, 1, 7, edge, false, vb.pp("conv_post"))?,
        })
    }

    /// `[1, latent_dim, frames]` features and `[1, d_vector, 1]` speaker
    /// embedding to a `[1, 1, samples]` waveform in `[-1, 1]`.
    pub fn forward(&self, x: &Tensor, g: &Tensor) -> Result<Tensor> {
        let mut o = self.conv_pre.forward(x)?;
        o = o.broadcast_add(&self.cond_layer.forward(g)?)?;

        for (i, up) in self.ups.iter().enumerate() {
            o = up.forward(&leaky_relu(&o, LRELU_SLOPE)?)?;
            if let Some(cond) = self.conds.get(i) {
                o = o.broadcast_add(&cond.forward(g)?)?;
            }
            let blocks = &self.resblocks[i * self.num_kernels..(i + 1) * self.num_kernels];
            let mut sum = blocks[0].forward(&o)?;
            for block in &blocks[1..] {
                sum = (sum + block.forward(&o)?)?;
            }
            o = (sum / self.num_kernels as f64)?;
        }

        let o = self.conv_post.forward(&leaky_relu(&o, 0.01)?)?;
        Ok(o.tanh()?)
    }
}

/// Latent-to-waveform decoder.
pub struct HifiganDecoder {
    generator: HifiganGenerator,
    code_scale: f64,
    rate_scale: f64,
}

impl HifiganDecoder {
    pub fn new(config: &XttsConfig, vb: VarBuilder) -> Result<Self> {
        let a = &config.model_args;
        Ok(Self {
            generator: HifiganGenerator::new(config, vb.pp("waveform_decoder"))?,
            code_scale: a.gpt_code_stride_len as f64 / a.output_hop_length as f64,
            rate_scale: a.output_sample_rate as f64 / a.input_sample_rate as f64,
        })
    }

    /// `[1, frames, latent_dim]` GPT latents to output-rate samples.
    pub fn decode(&self, latents: &Tensor, speaker: &Tensor) -> Result<Vec<f32>> {
        let z = latents.transpose(1, 2)?.contiguous()?;
        let z = interpolate_linear(&z, self.code_scale)?;
        let z = if (self.rate_scale - 1.0).abs() > f64::EPSILON {
            interpolate_linear(&z, self.rate_scale)?
        } else {
            z
        };
        let wav = self.generator.forward(&z, speaker)?;
        Ok(wav.flatten_all()?.to_vec1()?)
    }
}

fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    Ok(candle_nn::ops::leaky_relu(x, slope)?)
}

/// Linear resize of the last axis of `[batch, channels, len]` by `scale`,
/// with half-pixel source positions (corners not aligned).
pub fn interpolate_linear(x: &Tensor, scale: f64) -> Result<Tensor> {
    let (batch, channels, len) = x.dims3()?;
    let out_len = (len as f64 * scale).floor() as usize;
    if out_len == 0 || len == 0 {
        anyhow::bail!("cannot resize {len} frames by {scale}");
    }

    let mut weights = vec![0f32; len * out_len];
    for i in 0..out_len {
        let src = ((i as f64 + 0.5) / scale - 0.5).max(0.0);
        let lo = (src.floor() as usize).min(len - 1);
        let hi = (lo + 1).min(len - 1);
        let frac = (src - lo as f64) as f32;
        weights[lo * out_len + i] += 1.0 - frac;
        weights[hi * out_len + i] += frac;
    }
    let weights = Tensor::from_vec(weights, (len, out_len), x.device())?.to_dtype(x.dtype())?;

    let flat = x.reshape((batch * channels, len))?;
    Ok(flat.matmul(&weights)?.reshape((batch, channels, out_len))?)
}
