//! Model configuration, parsed from the base model's `config.json`.
//!
//! Unknown keys are preserved so a spliced config can be written back out
//! without losing fields this crate does not interpret.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::generation::GenerationConfig;

/// Top-level `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XttsConfig {
    #[serde(default = "default_model_name")]
    pub model: String,

    pub model_args: XttsArgs,

    /// Language tags the checkpoint was trained on
    #[serde(default)]
    pub languages: Vec<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f64,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Seconds of reference audio used for GPT conditioning
    #[serde(default = "default_gpt_cond_len")]
    pub gpt_cond_len: f32,
    /// Conditioning window; longer references are averaged over windows
    #[serde(default = "default_gpt_cond_chunk_len")]
    pub gpt_cond_chunk_len: f32,
    /// Seconds of reference audio kept at all
    #[serde(default = "default_max_ref_len")]
    pub max_ref_len: f32,
    /// Peak-normalize the reference to 0.75 before conditioning
    #[serde(default)]
    pub sound_norm_refs: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `model_args` block: architecture sizes, special tokens and file paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XttsArgs {
    /// Path to the BPE vocabulary (`vocab.json`)
    #[serde(default)]
    pub tokenizer_file: String,
    /// Path to the discrete VAE weights (training only, validated at load)
    #[serde(default)]
    pub dvae_checkpoint: String,
    /// Path to per-band mel normalization statistics
    #[serde(default)]
    pub mel_norm_file: String,

    #[serde(default = "default_max_audio_tokens")]
    pub gpt_max_audio_tokens: usize,
    #[serde(default = "default_max_text_tokens")]
    pub gpt_max_text_tokens: usize,
    #[serde(default = "default_max_prompt_tokens")]
    pub gpt_max_prompt_tokens: usize,
    #[serde(default = "default_gpt_layers")]
    pub gpt_layers: usize,
    #[serde(default = "default_gpt_channels")]
    pub gpt_n_model_channels: usize,
    #[serde(default = "default_gpt_heads")]
    pub gpt_n_heads: usize,
    #[serde(default = "default_text_tokens")]
    pub gpt_number_text_tokens: usize,
    /// Falls back to the tokenizer's `[START]` id
    #[serde(default)]
    pub gpt_start_text_token: Option<u32>,
    /// Falls back to the tokenizer's `[STOP]` id
    #[serde(default)]
    pub gpt_stop_text_token: Option<u32>,
    #[serde(default = "default_audio_tokens")]
    pub gpt_num_audio_tokens: usize,
    #[serde(default = "default_start_audio_token")]
    pub gpt_start_audio_token: u32,
    #[serde(default = "default_stop_audio_token")]
    pub gpt_stop_audio_token: u32,
    #[serde(default = "default_code_stride_len")]
    pub gpt_code_stride_len: usize,
    #[serde(default = "default_true")]
    pub gpt_use_perceiver_resampler: bool,

    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
    #[serde(default = "default_output_hop_length")]
    pub output_hop_length: usize,
    #[serde(default = "default_decoder_input_dim")]
    pub decoder_input_dim: usize,
    #[serde(default = "default_d_vector_dim")]
    pub d_vector_dim: usize,
    #[serde(default = "default_true")]
    pub cond_d_vector_in_each_upsampling_layer: bool,

    /// Attention blocks in the conditioning encoder
    #[serde(default = "default_cond_blocks")]
    pub conditioning_attn_blocks: usize,
    #[serde(default)]
    pub perceiver: PerceiverConfig,
    #[serde(default)]
    pub hifigan: HifiganConfig,
    #[serde(default)]
    pub speaker_encoder: SpeakerEncoderConfig,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Perceiver resampler that condenses the conditioning sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceiverConfig {
    pub num_latents: usize,
    pub depth: usize,
    pub heads: usize,
    pub dim_head: usize,
    pub ff_mult: usize,
}

impl Default for PerceiverConfig {
    fn default() -> Self {
        Self {
            num_latents: 32,
            depth: 2,
            heads: 8,
            dim_head: 64,
            ff_mult: 4,
        }
    }
}

/// HiFi-GAN waveform decoder layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HifiganConfig {
    pub upsample_initial_channel: usize,
    pub upsample_rates: Vec<usize>,
    pub upsample_kernel_sizes: Vec<usize>,
    pub resblock_kernel_sizes: Vec<usize>,
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
}

impl Default for HifiganConfig {
    fn default() -> Self {
        Self {
            upsample_initial_channel: 512,
            upsample_rates: vec![8, 8, 2, 2],
            upsample_kernel_sizes: vec![16, 16, 4, 4],
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5]; 3],
        }
    }
}

impl HifiganConfig {
    /// Output samples per input frame
    pub fn upsample_factor(&self) -> usize {
        self.upsample_rates.iter().product()
    }
}

/// ResNet speaker encoder layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerEncoderConfig {
    /// Mel bands of the input spectrogram
    pub input_dim: usize,
    /// Blocks per stage
    pub layers: Vec<usize>,
    /// Channels per stage
    pub num_filters: Vec<usize>,
    /// Hidden channels of the attentive pooling
    pub attention_channels: usize,
}

impl Default for SpeakerEncoderConfig {
    fn default() -> Self {
        Self {
            input_dim: 64,
            layers: vec![3, 4, 6, 3],
            num_filters: vec![32, 64, 128, 256],
            attention_channels: 128,
        }
    }
}

fn default_model_name() -> String {
    "xtts".to_string()
}
fn default_temperature() -> f64 {
    0.75
}
fn default_length_penalty() -> f64 {
    1.0
}
fn default_repetition_penalty() -> f64 {
    5.0
}
fn default_top_k() -> usize {
    50
}
fn default_top_p() -> f64 {
    0.85
}
fn default_gpt_cond_len() -> f32 {
    30.0
}
fn default_gpt_cond_chunk_len() -> f32 {
    4.0
}
fn default_max_ref_len() -> f32 {
    30.0
}
fn default_max_audio_tokens() -> usize {
    605
}
fn default_max_text_tokens() -> usize {
    402
}
fn default_max_prompt_tokens() -> usize {
    70
}
fn default_gpt_layers() -> usize {
    30
}
fn default_gpt_channels() -> usize {
    1024
}
fn default_gpt_heads() -> usize {
    16
}
fn default_text_tokens() -> usize {
    6681
}
fn default_audio_tokens() -> usize {
    1026
}
fn default_start_audio_token() -> u32 {
    1024
}
fn default_stop_audio_token() -> u32 {
    1025
}
fn default_code_stride_len() -> usize {
    1024
}
fn default_true() -> bool {
    true
}
fn default_input_sample_rate() -> u32 {
    22050
}
fn default_output_sample_rate() -> u32 {
    24000
}
fn default_output_hop_length() -> usize {
    256
}
fn default_decoder_input_dim() -> usize {
    1024
}
fn default_d_vector_dim() -> usize {
    512
}
fn default_cond_blocks() -> usize {
    6
}

impl XttsConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that would otherwise surface as shape errors deep
    /// inside weight loading.
    pub fn validate(&self) -> Result<()> {
        let a = &self.model_args;
        if a.gpt_n_heads == 0 || a.gpt_n_model_channels % a.gpt_n_heads != 0 {
            anyhow::bail!(
                "gpt_n_model_channels ({}) must be divisible by gpt_n_heads ({})",
                a.gpt_n_model_channels,
                a.gpt_n_heads
            );
        }
        if a.gpt_start_audio_token as usize >= a.gpt_num_audio_tokens
            || a.gpt_stop_audio_token as usize >= a.gpt_num_audio_tokens
        {
            anyhow::bail!(
                "audio start/stop tokens must be below gpt_num_audio_tokens ({})",
                a.gpt_num_audio_tokens
            );
        }
        let h = &a.hifigan;
        if h.upsample_rates.len() != h.upsample_kernel_sizes.len() {
            anyhow::bail!("hifigan upsample_rates and upsample_kernel_sizes differ in length");
        }
        if h.resblock_kernel_sizes.len() != h.resblock_dilation_sizes.len() {
            anyhow::bail!("hifigan resblock kernel and dilation lists differ in length");
        }
        let s = &a.speaker_encoder;
        if s.layers.len() != 4 || s.num_filters.len() != 4 {
            anyhow::bail!("speaker encoder needs exactly four stages");
        }
        if s.input_dim % 8 != 0 {
            anyhow::bail!("speaker encoder input_dim must be divisible by 8");
        }
        Ok(())
    }

    /// Point the config at locally resolved files.
    pub fn splice_paths(&mut self, tokenizer: &Path, mel_stats: &Path, dvae: &Path) {
        self.model_args.tokenizer_file = tokenizer.to_string_lossy().into_owned();
        self.model_args.mel_norm_file = mel_stats.to_string_lossy().into_owned();
        self.model_args.dvae_checkpoint = dvae.to_string_lossy().into_owned();
    }

    /// Sampling defaults applied to every request; per-request values
    /// override temperature, top-k and top-p.
    pub fn generation_defaults(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.model_args.gpt_max_audio_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            stop_token_id: Some(self.model_args.gpt_stop_audio_token),
            // the vocoder needs at least one frame
            min_new_tokens: 1,
        }
    }

    /// Width of the GPT hidden state
    pub fn hidden_size(&self) -> usize {
        self.model_args.gpt_n_model_channels
    }
}

#[cfg(test)]
pub(crate) fn tiny_config() -> XttsConfig {
    let json = r#"{
        "model": "xtts",
        "model_args": {
            "gpt_max_audio_tokens": 12,
            "gpt_max_text_tokens": 64,
            "gpt_layers": 1,
            "gpt_n_model_channels": 32,
            "gpt_n_heads": 2,
            "gpt_number_text_tokens": 48,
            "gpt_start_text_token": 46,
            "gpt_stop_text_token": 0,
            "gpt_num_audio_tokens": 10,
            "gpt_start_audio_token": 8,
            "gpt_stop_audio_token": 9,
            "decoder_input_dim": 32,
            "d_vector_dim": 8,
            "output_hop_length": 256,
            "gpt_code_stride_len": 1024,
            "conditioning_attn_blocks": 1,
            "perceiver": { "num_latents": 4, "depth": 1, "heads": 2, "dim_head": 8, "ff_mult": 2 },
            "hifigan": {
                "upsample_initial_channel": 16,
                "upsample_rates": [2, 2],
                "upsample_kernel_sizes": [4, 4],
                "resblock_kernel_sizes": [3],
                "resblock_dilation_sizes": [[1, 3]]
            },
            "speaker_encoder": {
                "input_dim": 64,
                "layers": [1, 1, 1, 1],
                "num_filters": [4, 4, 8, 8],
                "attention_channels": 8
            }
        },
        "languages": ["es", "en"],
        "repetition_penalty": 2.0,
        "gpt_cond_len": 3,
        "max_ref_len": 10
    }"#;
    XttsConfig::from_json(json).unwrap()
}
