//! # xtts-clone
//!
//! Voice-cloning text-to-speech service built on an XTTS-v2 style model, in
//! pure Rust with [candle](https://github.com/huggingface/candle).
//!
//! ## Features
//!
//! - **Hub resolution** of the base model, a fine-tuned checkpoint and a
//!   reference recording, reusing the local HuggingFace cache
//! - **CPU inference**, with **CUDA** and **Metal** behind cargo features
//! - **Seeded sampling**: each request owns its RNG, so identical requests
//!   produce identical audio
//! - **Web form** with canned examples, served by axum
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xtts_clone::{load, AudioBuffer, DevicePreference, ModelFiles, SynthesisRequest, Synthesizer};
//!
//! let files = ModelFiles::from_roots("base".as_ref(), "checkpoint".as_ref())?;
//! let model = Arc::new(load(&files, DevicePreference::Auto)?.with_language("es")?);
//! let reference = AudioBuffer::load("speaker.wav")?;
//! let synth = Synthesizer::new(model, &reference, "outputs")?;
//!
//! let result = synth.synthesize(&SynthesisRequest::new("Hola, soy Pedro.", 0.7, 0.85, 50, 67));
//! println!("{} -> {:?}", result.status, result.path);
//! ```
//!
//! ## Architecture
//!
//! Startup runs once, in order:
//!
//! 1. **Resolve** ([`hub`]): three snapshot directories (base model,
//!    checkpoint, speaker audio), downloading only what is missing.
//! 2. **Locate** ([`locate`]): the checkpoint `.pth` and the speaker `.wav`
//!    inside those snapshots.
//! 3. **Load** ([`loader`]): config, tokenizer and weights into an
//!    [`Xtts`](models::Xtts) on the selected device.
//! 4. **Prepare** ([`synthesis`]): the reference recording becomes a voice
//!    (GPT conditioning latents plus a speaker embedding).
//!
//! Each request then runs the GPT over the text to sample audio codes, and the
//! HiFi-GAN vocoder turns the matching latents into 24 kHz audio.
//!
//! ## Sample Rate
//!
//! Output audio is always 24 kHz mono; see [`audio::OUTPUT_SAMPLE_RATE`].

pub mod audio;
pub mod generation;
pub mod hub;
pub mod loader;
pub mod locate;
pub mod models;
pub mod server;
pub mod settings;
pub mod synthesis;
pub mod tokenizer;

use anyhow::Result;
use candle_core::Device;

pub use audio::AudioBuffer;
pub use generation::{GenerationConfig, SamplingContext};
pub use hub::{AssetResolver, AssetSource, HubSource, LocalAssetBundle, RemoteAssetSpec, RetrievalError};
pub use loader::{load, resolve_assets, DevicePreference, ModelFiles, ResolvedAssets};
pub use locate::find_first;
pub use models::{Xtts, XttsConfig, XttsVoice};
pub use settings::Settings;
pub use synthesis::{SpeechModel, SynthesisRequest, SynthesisResult, SynthesisStatus, Synthesizer};

/// Select the best available device: CUDA, then Metal, then CPU.
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device string into a [`Device`].
///
/// Supported formats:
/// - `"auto"`: select best available via [`auto_device`]
/// - `"cpu"`: force CPU
/// - `"cuda"` or `"cuda:0"`: CUDA device 0
/// - `"cuda:N"`: CUDA device N
/// - `"metal"`: Apple Silicon GPU
pub fn parse_device(device_str: &str) -> Result<Device> {
    device_str.parse::<DevicePreference>()?.to_device()
}

/// Human-readable label for a [`Device`].
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_cpu() {
        let device = parse_device("cpu").unwrap();
        assert!(device.is_cpu());
        assert_eq!(device_info(&device), "CPU");
    }

    #[test]
    fn test_parse_device_auto_falls_back() {
        assert!(parse_device("auto").is_ok());
    }

    #[test]
    fn test_parse_device_unknown() {
        let err = parse_device("tpu").unwrap_err();
        assert!(err.to_string().contains("unknown device"));
    }
}
