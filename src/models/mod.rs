//! Neural network models for XTTS
//!
//! This module contains:
//! - `config`: `config.json` model
//! - `kv_cache`: KV cache for autoregressive decoding
//! - `conditioning`: Reference mel encoder and perceiver resampler
//! - `gpt`: GPT-2 audio-code generator
//! - `speaker`: Speaker encoder (SE-ResNet)
//! - `hifigan`: HiFi-GAN vocoder
//! - `xtts`: The assembled model

pub mod conditioning;
pub mod config;
pub mod gpt;
pub mod hifigan;
pub mod kv_cache;
pub mod speaker;
pub mod xtts;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{HifiganConfig, PerceiverConfig, SpeakerEncoderConfig, XttsArgs, XttsConfig};
pub use gpt::{GeneratedCodes, XttsGpt};
pub use hifigan::HifiganDecoder;
pub use kv_cache::KVCache;
pub use speaker::SpeakerEncoder;
pub use xtts::{Xtts, XttsVoice};
