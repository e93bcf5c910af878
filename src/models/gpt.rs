//! GPT-2 audio-code generator.
//!
//! A GPT-2 stack without learned absolute positions; text and audio streams
//! carry their own learned position tables instead. The prompt is
//! `[conditioning latents | text + positions | start-audio]`, and each sampled
//! audio code is fed back with its own position. The normalized hidden state
//! of every fed position is kept as the latent the vocoder decodes.
//!
//! Weight prefix: `gpt.*`

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};

use super::conditioning::{ConditioningEncoder, PerceiverResampler};
use super::config::XttsConfig;
use super::kv_cache::KVCache;
use crate::generation::{apply_repetition_penalty, sample, suppress_token, GenerationConfig, SamplingContext};

const LN_EPS: f64 = 1e-5;

/// Create a causal attention mask.
///
/// Returns a `[1, 1, seq_len, offset + seq_len]` tensor where position `(i, j)`
/// is `0.0` if `j <= offset + i` and `NEG_INFINITY` otherwise.
pub fn create_causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let total_len = offset + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j <= offset + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();

    Ok(Tensor::from_vec(mask, (1, 1, seq_len, total_len), device)?)
}

/// GPT-2 style projection: weight stored `[in, out]`, applied as `x @ W + b`.
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get((in_dim, out_dim), "weight")?,
            bias: vb.get(out_dim, "bias")?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

struct Gpt2Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Gpt2Attention {
    fn new(hidden: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = hidden / num_heads;
        Ok(Self {
            c_attn: Conv1D::new(hidden, 3 * hidden, vb.pp("c_attn"))?,
            c_proj: Conv1D::new(hidden, hidden, vb.pp("c_proj"))?,
            num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn forward(&self, x: &Tensor, mask: Option<&Tensor>, cache: &mut KVCache) -> Result<Tensor> {
        let (batch, seq_len, hidden) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;

        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, i * hidden, hidden)?
                .reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let (k, v) = cache.update(&split(1)?, &split(2)?)?;

        let weights = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let weights = match mask {
            Some(mask) => weights.broadcast_add(mask)?,
            None => weights,
        };
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, hidden))?;

        self.c_proj.forward(&out)
    }
}

struct Gpt2Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl Gpt2Mlp {
    fn new(hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: Conv1D::new(hidden, 4 * hidden, vb.pp("c_fc"))?,
            c_proj: Conv1D::new(4 * hidden, hidden, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // tanh-approximated GELU ("gelu_new")
        let h = self.c_fc.forward(x)?.gelu()?;
        self.c_proj.forward(&h)
    }
}

struct Gpt2Block {
    ln_1: LayerNorm,
    attn: Gpt2Attention,
    ln_2: LayerNorm,
    mlp: Gpt2Mlp,
}

impl Gpt2Block {
    fn new(hidden: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(hidden, LN_EPS, vb.pp("ln_1"))?,
            attn: Gpt2Attention::new(hidden, num_heads, vb.pp("attn"))?,
            ln_2: layer_norm(hidden, LN_EPS, vb.pp("ln_2"))?,
            mlp: Gpt2Mlp::new(hidden, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: Option<&Tensor>, cache: &mut KVCache) -> Result<Tensor> {
        let h = (x + self.attn.forward(&self.ln_1.forward(x)?, mask, cache)?)?;
        Ok((&h + self.mlp.forward(&self.ln_2.forward(&h)?)?)?)
    }
}

/// Output of one generation run.
#[derive(Debug)]
pub struct GeneratedCodes {
    /// Sampled audio codes, stop code excluded
    pub codes: Vec<u32>,
    /// `[1, n, hidden]` latents for the vocoder
    pub latents: Tensor,
    /// True when the stop code ended the run
    pub stopped: bool,
}

/// Text-and-voice conditioned audio-code model.
pub struct XttsGpt {
    blocks: Vec<Gpt2Block>,
    ln_f: LayerNorm,
    final_norm: LayerNorm,
    mel_head: Linear,
    text_embedding: Embedding,
    mel_embedding: Embedding,
    text_pos_embedding: Embedding,
    mel_pos_embedding: Embedding,
    conditioning_encoder: ConditioningEncoder,
    perceiver: Option<PerceiverResampler>,
    start_text_token: u32,
    stop_text_token: u32,
    start_audio_token: u32,
    max_text_positions: usize,
    max_audio_positions: usize,
    device: Device,
}

impl XttsGpt {
    pub fn new(
        config: &XttsConfig,
        start_text_token: u32,
        stop_text_token: u32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let a = &config.model_args;
        let hidden = a.gpt_n_model_channels;
        let max_text_positions = a.gpt_max_text_tokens + 2;
        let max_audio_positions = a.gpt_max_audio_tokens + 3;

        let blocks = (0..a.gpt_layers)
            .map(|i| Gpt2Block::new(hidden, a.gpt_n_heads, vb.pp(format!("gpt.h.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let perceiver = if a.gpt_use_perceiver_resampler {
            Some(PerceiverResampler::new(
                hidden,
                &a.perceiver,
                vb.pp("conditioning_perceiver"),
            )?)
        } else {
            None
        };

        Ok(Self {
            blocks,
            ln_f: layer_norm(hidden, LN_EPS, vb.pp("gpt.ln_f"))?,
            final_norm: layer_norm(hidden, LN_EPS, vb.pp("final_norm"))?,
            mel_head: linear(hidden, a.gpt_num_audio_tokens, vb.pp("mel_head"))?,
            text_embedding: embedding(a.gpt_number_text_tokens, hidden, vb.pp("text_embedding"))?,
            mel_embedding: embedding(a.gpt_num_audio_tokens, hidden, vb.pp("mel_embedding"))?,
            text_pos_embedding: embedding(max_text_positions, hidden, vb.pp("text_pos_embedding.emb"))?,
            mel_pos_embedding: embedding(max_audio_positions, hidden, vb.pp("mel_pos_embedding.emb"))?,
            conditioning_encoder: ConditioningEncoder::new(
                80,
                hidden,
                a.conditioning_attn_blocks,
                a.gpt_n_heads,
                vb.pp("conditioning_encoder"),
            )?,
            perceiver,
            start_text_token,
            stop_text_token,
            start_audio_token: a.gpt_start_audio_token,
            max_text_positions,
            max_audio_positions,
            device: vb.device().clone(),
        })
    }

    /// Condense a normalized `[1, 80, frames]` cloning mel into `[1, latents, hidden]`.
    pub fn style_embedding(&self, mel: &Tensor) -> Result<Tensor> {
        let conds = self.conditioning_encoder.forward(mel)?; // [1, hidden, frames]
        match &self.perceiver {
            Some(perceiver) => perceiver.forward(&conds.transpose(1, 2)?.contiguous()?),
            None => Ok(conds.mean_keepdim(D::Minus1)?.transpose(1, 2)?.contiguous()?),
        }
    }

    fn embed_positions(&self, table: &Embedding, start: usize, len: usize) -> Result<Tensor> {
        let ids = Tensor::arange(start as u32, (start + len) as u32, &self.device)?.unsqueeze(0)?;
        Ok(table.forward(&ids)?)
    }

    fn forward_stack(&self, embeds: &Tensor, caches: &mut [KVCache]) -> Result<Tensor> {
        let seq_len = embeds.dim(1)?;
        let offset = caches.first().map(|c| c.seq_len()).unwrap_or(0);
        let mask = if seq_len > 1 {
            Some(create_causal_mask(seq_len, offset, &self.device)?)
        } else {
            None
        };

        let mut h = embeds.clone();
        for (block, cache) in self.blocks.iter().zip(caches.iter_mut()) {
            h = block.forward(&h, mask.as_ref(), cache)?;
        }
        Ok(self.ln_f.forward(&h)?)
    }

    /// Sample audio codes for `text_ids` in the voice of `cond_latents`.
    pub fn generate(
        &self,
        cond_latents: &Tensor,
        text_ids: &[u32],
        config: &GenerationConfig,
        ctx: &mut SamplingContext,
    ) -> Result<GeneratedCodes> {
        let mut text = Vec::with_capacity(text_ids.len() + 2);
        text.push(self.start_text_token);
        text.extend_from_slice(text_ids);
        text.push(self.stop_text_token);
        if text.len() > self.max_text_positions {
            anyhow::bail!(
                "text is {} tokens long, the model accepts at most {}",
                text_ids.len(),
                self.max_text_positions - 2
            );
        }

        let text_t = Tensor::new(text.as_slice(), &self.device)?.unsqueeze(0)?;
        let text_emb = (self.text_embedding.forward(&text_t)?
            + self.embed_positions(&self.text_pos_embedding, 0, text.len())?)?;

        let start_t = Tensor::new(&[self.start_audio_token], &self.device)?.unsqueeze(0)?;
        let start_emb = (self.mel_embedding.forward(&start_t)?
            + self.embed_positions(&self.mel_pos_embedding, 0, 1)?)?;

        let cond_latents = cond_latents.to_dtype(DType::F32)?;
        let prompt = Tensor::cat(&[&cond_latents, &text_emb, &start_emb], 1)?;

        let mut caches = vec![KVCache::new(); self.blocks.len()];
        let hidden = self.forward_stack(&prompt, &mut caches)?;
        let mut last = hidden.narrow(1, hidden.dim(1)? - 1, 1)?;

        let max_codes = config
            .max_new_tokens
            .min(self.max_audio_positions.saturating_sub(2))
            .max(1);
        let mut codes: Vec<u32> = Vec::new();
        let mut seen: Vec<u32> = vec![self.start_audio_token];
        let mut latents: Vec<Tensor> = Vec::new();
        let mut stopped = false;

        loop {
            let normed = self.final_norm.forward(&last)?;
            latents.push(normed.clone());

            let logits = self.mel_head.forward(&normed)?.squeeze(1)?;
            let logits = apply_repetition_penalty(&logits, &seen, config.repetition_penalty)?;
            let logits = match config.stop_token_id {
                Some(stop) if codes.len() < config.min_new_tokens => suppress_token(&logits, stop)?,
                _ => logits,
            };

            let token: u32 = sample(&logits, config, ctx)?.flatten_all()?.to_vec1::<u32>()?[0];
            if config.stop_token_id == Some(token) {
                stopped = true;
                break;
            }
            codes.push(token);
            seen.push(token);
            if codes.len() >= max_codes {
                break;
            }

            let token_t = Tensor::new(&[token], &self.device)?.unsqueeze(0)?;
            let emb = (self.mel_embedding.forward(&token_t)?
                + self.embed_positions(&self.mel_pos_embedding, codes.len(), 1)?)?;
            last = self.forward_stack(&emb, &mut caches)?;
        }

        tracing::debug!(
            codes = codes.len(),
            stopped,
            "audio code generation finished"
        );

        // The position that predicted the stop code has no code of its own.
        if stopped {
            latents.pop();
        }
        if codes.is_empty() {
            anyhow::bail!("the model stopped before producing any audio code");
        }

        Ok(GeneratedCodes {
            codes,
            latents: Tensor::cat(&latents, 1)?,
            stopped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::tiny_config;
    use crate::models::test_support::random_vb;

    #[test]
    fn test_causal_mask() {
        let device = Device::Cpu;
        let mask = create_causal_mask(2, 1, &device).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 2, 3]);
        let vals: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(&vals[..2], &[0.0, 0.0]);
        assert!(vals[2].is_infinite());
        assert_eq!(&vals[3..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_style_embedding_shape() {
        let config = tiny_config();
        let (_varmap, vb) = random_vb(7, |vb| XttsGpt::new(&config, 46, 0, vb.pp("gpt")).map(|_| ()));
        let gpt = XttsGpt::new(&config, 46, 0, vb.pp("gpt")).unwrap();

        let mel = Tensor::randn(0f32, 1.0, (1, 80, 20), &Device::Cpu).unwrap();
        let style = gpt.style_embedding(&mel).unwrap();
        assert_eq!(style.dims(), &[1, 4, 32]);
    }

    #[test]
    fn test_generate_is_seeded_and_bounded() {
        let config = tiny_config();
        let (_varmap, vb) = random_vb(11, |vb| XttsGpt::new(&config, 46, 0, vb.pp("gpt")).map(|_| ()));
        let gpt = XttsGpt::new(&config, 46, 0, vb.pp("gpt")).unwrap();

        let cond = Tensor::randn(0f32, 1.0, (1, 4, 32), &Device::Cpu).unwrap();
        let gen_config = GenerationConfig {
            max_new_tokens: 6,
            min_new_tokens: 1,
            stop_token_id: Some(9),
            ..config.generation_defaults()
        };

        let run = |seed| {
            let mut ctx = SamplingContext::new(Some(seed));
            gpt.generate(&cond, &[5, 6, 7], &gen_config, &mut ctx).unwrap()
        };
        let a = run(42);
        let b = run(42);
        assert_eq!(a.codes, b.codes);
        assert!(a.codes.len() <= 6);
        assert!(a.codes.iter().all(|&c| c < 10 && c != 9));

        assert_eq!(a.latents.dims(), &[1, a.codes.len(), 32]);
    }

    #[test]
    fn test_stop_leaves_one_latent_per_code() {
        let config = tiny_config();
        let (_varmap, vb) = random_vb(13, |vb| XttsGpt::new(&config, 46, 0, vb.pp("gpt")).map(|_| ()));
        let gpt = XttsGpt::new(&config, 46, 0, vb.pp("gpt")).unwrap();
        let cond = Tensor::randn(0f32, 1.0, (1, 4, 32), &Device::Cpu).unwrap();

        // top_k = 1 makes the path greedy, so the first run tells us which
        // code the second run will stop on.
        let greedy = GenerationConfig {
            max_new_tokens: 6,
            top_k: 1,
            stop_token_id: None,
            ..config.generation_defaults()
        };
        let mut ctx = SamplingContext::new(Some(3));
        let capped = gpt.generate(&cond, &[5, 6], &greedy, &mut ctx).unwrap();
        assert!(!capped.stopped);
        assert_eq!(capped.latents.dims(), &[1, capped.codes.len(), 32]);

        let k = (1..capped.codes.len())
            .find(|&k| !capped.codes[..k].contains(&capped.codes[k]))
            .expect("greedy run repeats one code");
        let stopping = GenerationConfig {
            stop_token_id: Some(capped.codes[k]),
            min_new_tokens: 1,
            ..greedy
        };
        let mut ctx = SamplingContext::new(Some(3));
        let out = gpt.generate(&cond, &[5, 6], &stopping, &mut ctx).unwrap();
        assert!(out.stopped);
        assert_eq!(out.codes, capped.codes[..k]);
        assert_eq!(out.latents.dims(), &[1, k, 32]);
    }

    #[test]
    fn test_min_new_tokens_holds_back_stop() {
        let config = tiny_config();
        let (_varmap, vb) = random_vb(3, |vb| XttsGpt::new(&config, 46, 0, vb.pp("gpt")).map(|_| ()));
        let gpt = XttsGpt::new(&config, 46, 0, vb.pp("gpt")).unwrap();

        let cond = Tensor::zeros((1, 4, 32), DType::F32, &Device::Cpu).unwrap();
        let gen_config = GenerationConfig {
            max_new_tokens: 4,
            min_new_tokens: 4,
            stop_token_id: Some(9),
            ..config.generation_defaults()
        };
        let mut ctx = SamplingContext::new(Some(1));
        let out = gpt.generate(&cond, &[5], &gen_config, &mut ctx).unwrap();
        assert_eq!(out.codes.len(), 4);
        assert!(!out.stopped);
    }

    #[test]
    fn test_overlong_text_is_rejected() {
        let config = tiny_config();
        let (_varmap, vb) = random_vb(5, |vb| XttsGpt::new(&config, 46, 0, vb.pp("gpt")).map(|_| ()));
        let gpt = XttsGpt::new(&config, 46, 0, vb.pp("gpt")).unwrap();
        let cond = Tensor::zeros((1, 4, 32), DType::F32, &Device::Cpu).unwrap();
        let mut ctx = SamplingContext::new(Some(1));
        let err = gpt
            .generate(&cond, &[5; 100], &config.generation_defaults(), &mut ctx)
            .unwrap_err();
        assert!(err.to_string().contains("at most 64"));
    }
}
