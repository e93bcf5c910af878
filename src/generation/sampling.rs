//! Token sampling for autoregressive audio-code generation
//!
//! All randomness lives in a [`SamplingContext`] owned by a single request, so
//! concurrent requests never share RNG state and a seeded request is
//! reproducible.

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor, D};
use serde::{Deserialize, Serialize};

/// RNG state for a single generation session.
///
/// Seeded contexts produce identical sequences across runs and threads.
/// Unseeded contexts draw their seed from the clock once, at construction.
#[derive(Debug, Clone)]
pub struct SamplingContext {
    state: u64,
}

impl SamplingContext {
    pub fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
        });
        Self {
            state: Self::mix(seed),
        }
    }

    /// Rewind to the state `SamplingContext::new(Some(seed))` starts in.
    pub fn reset(&mut self, seed: u64) {
        self.state = Self::mix(seed);
    }

    // Mix seed with the PCG increment to avoid degenerate states
    fn mix(seed: u64) -> u64 {
        seed.wrapping_mul(2685821657736338717)
            .wrapping_add(1442695040888963407)
    }

    /// Uniform f32 in [0, 1), PCG XSH RR 64/32.
    pub fn rand_f32(&mut self) -> f32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);

        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        let output = xorshifted.rotate_right(rot);

        // 24 bits keep the result strictly below 1.0 in f32
        (output >> 8) as f32 / (1u32 << 24) as f32
    }
}

/// Knobs for one autoregressive run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of audio codes to generate
    pub max_new_tokens: usize,
    /// Logit divisor (<1.0 sharpens, >1.0 flattens)
    pub temperature: f64,
    /// Keep only the k most likely codes (0 = disabled)
    pub top_k: usize,
    /// Nucleus threshold (1.0 = disabled)
    pub top_p: f64,
    /// Penalty for codes already generated (1.0 = none)
    pub repetition_penalty: f64,
    /// Generation stops when this code is sampled
    pub stop_token_id: Option<u32>,
    /// Stop code is masked out until this many codes exist
    pub min_new_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 605,
            temperature: 0.7,
            top_k: 50,
            top_p: 0.85,
            repetition_penalty: 10.0,
            stop_token_id: None,
            min_new_tokens: 0,
        }
    }
}

/// Sample next token from `[batch, vocab]` logits, returning `[batch]` ids.
///
/// Temperature is applied first, then top-k, then top-p on what remains.
pub fn sample(
    logits: &Tensor,
    config: &GenerationConfig,
    ctx: &mut SamplingContext,
) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;

    if config.temperature < 0.01 {
        return greedy_sample(&logits);
    }

    let logits = if config.temperature != 1.0 {
        (logits / config.temperature)?
    } else {
        logits
    };

    let logits = if config.top_k > 0 {
        top_k_filter(&logits, config.top_k)?
    } else {
        logits
    };

    let logits = if config.top_p < 1.0 && config.top_p > 0.0 {
        top_p_filter(&logits, config.top_p)?
    } else {
        logits
    };

    let probs = candle_nn::ops::softmax_last_dim(&logits)?;
    multinomial_sample(&probs, ctx)
}

/// Keep the top k logits, set the rest to -inf.
///
/// CPU tensors use a native sort; other devices sort on device to avoid a
/// transfer.
fn top_k_filter(logits: &Tensor, k: usize) -> Result<Tensor> {
    let (batch, vocab) = logits.dims2()?;
    let k = k.clamp(1, vocab);

    if logits.device().is_cpu() {
        let mut result_data = Vec::with_capacity(batch * vocab);
        for b in 0..batch {
            let row: Vec<f32> = logits.i(b)?.to_vec1()?;
            let mut sorted = row.clone();
            sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            let threshold = sorted[k - 1];
            result_data.extend(
                row.iter()
                    .map(|&v| if v >= threshold { v } else { f32::NEG_INFINITY }),
            );
        }
        Ok(Tensor::from_vec(result_data, (batch, vocab), logits.device())?)
    } else {
        let (sorted, _) = logits.sort_last_dim(false)?;
        let threshold = sorted.narrow(1, k - 1, 1)?;
        let mask = logits.broadcast_ge(&threshold)?;
        let neg_inf =
            Tensor::new(&[f32::NEG_INFINITY], logits.device())?.broadcast_as(logits.shape())?;
        Ok(mask.where_cond(logits, &neg_inf)?)
    }
}

/// Keep the smallest set of tokens whose cumulative probability exceeds `p`.
fn top_p_filter(logits: &Tensor, p: f64) -> Result<Tensor> {
    let (batch, vocab) = logits.dims2()?;

    if logits.device().is_cpu() {
        let mut result_data = Vec::with_capacity(batch * vocab);

        for b in 0..batch {
            let row: Vec<f32> = logits.i(b)?.to_vec1()?;
            let mut indices: Vec<usize> = (0..vocab).collect();
            indices.sort_unstable_by(|&a, &b| {
                row[b]
                    .partial_cmp(&row[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let max_val = row[indices[0]];
            let exp_sorted: Vec<f32> = indices.iter().map(|&i| (row[i] - max_val).exp()).collect();
            let sum: f32 = exp_sorted.iter().sum();

            let mut cumsum = 0.0f32;
            let mut cutoff = vocab;
            for (i, &e) in exp_sorted.iter().enumerate() {
                cumsum += e / sum;
                if cumsum > p as f32 {
                    cutoff = i + 1;
                    break;
                }
            }

            let mut filtered = vec![f32::NEG_INFINITY; vocab];
            for &idx in &indices[..cutoff] {
                filtered[idx] = row[idx];
            }
            result_data.extend(filtered);
        }

        Ok(Tensor::from_vec(result_data, (batch, vocab), logits.device())?)
    } else {
        let (sorted_logits, _) = logits.sort_last_dim(false)?;
        let sorted_probs = candle_nn::ops::softmax_last_dim(&sorted_logits)?;
        let cumulative = sorted_probs.cumsum(1)?;

        // Probability mass strictly before each position
        let shifted = cumulative.narrow(1, 0, vocab - 1)?;
        let zeros = Tensor::zeros((batch, 1), DType::F32, logits.device())?;
        let before = Tensor::cat(&[&zeros, &shifted], 1)?;

        let threshold = Tensor::new(&[p as f32], logits.device())?.broadcast_as(before.shape())?;
        let remove = before.ge(&threshold)?;

        let pos_inf =
            Tensor::new(&[f32::INFINITY], logits.device())?.broadcast_as(sorted_logits.shape())?;
        let kept = remove.where_cond(&pos_inf, &sorted_logits)?;
        let min_kept = kept.min_keepdim(D::Minus1)?;

        let keep = logits.broadcast_ge(&min_kept)?;
        let neg_inf =
            Tensor::new(&[f32::NEG_INFINITY], logits.device())?.broadcast_as(logits.shape())?;
        Ok(keep.where_cond(logits, &neg_inf)?)
    }
}

/// Inverse-CDF draw from `[batch, vocab]` probabilities.
fn multinomial_sample(probs: &Tensor, ctx: &mut SamplingContext) -> Result<Tensor> {
    let (batch, vocab) = probs.dims2()?;
    let rows: Vec<Vec<f32>> = probs.to_dtype(DType::F32)?.to_vec2()?;

    let mut picked = Vec::with_capacity(batch);
    for row in rows {
        let u = ctx.rand_f32() * row.iter().sum::<f32>();
        let mut acc = 0.0f32;
        let mut choice = None;
        for (i, &p) in row.iter().enumerate() {
            acc += p;
            if p > 0.0 && acc > u {
                choice = Some(i);
                break;
            }
        }
        // Rounding can leave u above the final sum; take the last nonzero entry
        let choice = choice
            .or_else(|| row.iter().rposition(|&p| p > 0.0))
            .unwrap_or(vocab - 1);
        picked.push(choice as u32);
    }

    Ok(Tensor::from_vec(picked, batch, probs.device())?)
}

/// Divide positive (multiply negative) logits of every token in `previous`.
pub fn apply_repetition_penalty(logits: &Tensor, previous: &[u32], penalty: f64) -> Result<Tensor> {
    if (penalty - 1.0).abs() < 1e-9 || previous.is_empty() {
        return Ok(logits.clone());
    }

    let (_batch, vocab) = logits.dims2()?;
    let penalty = penalty as f32;

    let mut factors = vec![1.0f32; vocab];
    let row: Vec<f32> = logits.i(0)?.to_dtype(DType::F32)?.to_vec1()?;
    for &tid in previous {
        let idx = tid as usize;
        if idx < vocab {
            factors[idx] = if row[idx] > 0.0 { 1.0 / penalty } else { penalty };
        }
    }

    let factors = Tensor::from_vec(factors, (1, vocab), logits.device())?;
    Ok(logits.to_dtype(DType::F32)?.broadcast_mul(&factors)?)
}

/// Mask `token` to -inf, used to hold back the stop code.
pub fn suppress_token(logits: &Tensor, token: u32) -> Result<Tensor> {
    let (_batch, vocab) = logits.dims2()?;
    let idx = token as usize;
    if idx >= vocab {
        return Ok(logits.clone());
    }
    let mut mask = vec![0.0f32; vocab];
    mask[idx] = f32::NEG_INFINITY;
    let mask = Tensor::from_vec(mask, (1, vocab), logits.device())?;
    Ok(logits.to_dtype(DType::F32)?.broadcast_add(&mask)?)
}

/// Greedy sampling (argmax)
pub fn greedy_sample(logits: &Tensor) -> Result<Tensor> {
    Ok(logits.argmax(D::Minus1)?)
}
