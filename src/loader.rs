//! One-time model loading from resolved files.
//!
//! Parses `config.json`, points it at the resolved tokenizer, mel statistics
//! and dVAE files, builds the network, fills it from the checkpoint and moves
//! it to the selected device.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::hub::{AssetResolver, AssetSource};
use crate::locate::find_first;
use crate::models::{Xtts, XttsConfig};
use crate::settings::Settings;
use crate::tokenizer::TextTokenizer;

/// Key holding the state dict inside a `.pth` training checkpoint.
const STATE_DICT_KEY: &str = "model";
/// Prefix training checkpoints put in front of every model weight.
const TRAINER_PREFIX: &str = "xtts.";
/// Training-only submodules present in trainer checkpoints.
const IGNORED_PREFIXES: &[&str] = &[
    "torch_mel_spectrogram_style_encoder",
    "torch_mel_spectrogram_dvae",
    "dvae.",
];
const MEL_STATS_KEY: &str = "mel_stats";
const MEL_BANDS: usize = 80;

/// Every file the loader reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub checkpoint: PathBuf,
    pub vocab: PathBuf,
    pub mel_stats: PathBuf,
    pub dvae: PathBuf,
}

impl ModelFiles {
    /// Base model files sit at fixed names in the base snapshot; the
    /// checkpoint is the first `.pth` found under `checkpoint_root`.
    pub fn from_roots(base_root: &Path, checkpoint_root: &Path) -> Result<Self> {
        let checkpoint = find_first(checkpoint_root, ".pth").with_context(|| {
            format!("no .pth checkpoint found under {}", checkpoint_root.display())
        })?;
        Ok(Self {
            config: base_root.join("config.json"),
            checkpoint,
            vocab: base_root.join("vocab.json"),
            mel_stats: base_root.join("mel_stats.pth"),
            dvae: base_root.join("dvae.pth"),
        })
    }

    /// Fail fast on any file that is not there.
    pub fn check_exists(&self) -> Result<()> {
        for (what, path) in [
            ("config", &self.config),
            ("checkpoint", &self.checkpoint),
            ("tokenizer", &self.vocab),
            ("mel statistics", &self.mel_stats),
            ("dVAE checkpoint", &self.dvae),
        ] {
            if !path.is_file() {
                anyhow::bail!("{what} file not found: {}", path.display());
            }
        }
        Ok(())
    }
}

/// Model files plus the reference recording, all on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAssets {
    pub files: ModelFiles,
    pub speaker_wav: PathBuf,
}

/// Fetch the base model, checkpoint and speaker sets named in `settings` and
/// locate the files the loader needs inside them.
pub fn resolve_assets<S: AssetSource>(
    resolver: &AssetResolver<S>,
    settings: &Settings,
) -> Result<ResolvedAssets> {
    let base = resolver.resolve(&settings.base_model_spec())?;
    let checkpoint = resolver.resolve(&settings.checkpoint_spec())?;
    let speaker = resolver.resolve(&settings.speaker_spec())?;
    tracing::info!(
        base = %base.root.display(),
        checkpoint = %checkpoint.root.display(),
        speaker = %speaker.root.display(),
        "assets resolved"
    );

    let speaker_wav = find_first(&speaker.root, ".wav").with_context(|| {
        format!("no .wav reference found under {}", speaker.root.display())
    })?;
    let files = ModelFiles::from_roots(&base.root, &checkpoint.root)?;
    Ok(ResolvedAssets { files, speaker_wav })
}

/// Where to run inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA, then Metal, then CPU, depending on what was compiled in
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal,
}

impl FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            "metal" => Ok(Self::Metal),
            other => match other.strip_prefix("cuda:") {
                Some(idx) => idx
                    .parse()
                    .map(Self::Cuda)
                    .map_err(|e| anyhow::anyhow!("invalid CUDA device index '{idx}': {e}")),
                None => anyhow::bail!(
                    "unknown device '{other}'. Supported: auto, cpu, cuda, cuda:N, metal"
                ),
            },
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(i) => write!(f, "cuda:{i}"),
            Self::Metal => write!(f, "metal"),
        }
    }
}

impl DevicePreference {
    pub fn to_device(self) -> Result<Device> {
        match self {
            Self::Auto => crate::auto_device(),
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => {
                #[cfg(feature = "cuda")]
                {
                    Device::new_cuda(ordinal)
                        .map_err(|e| anyhow::anyhow!("failed to init CUDA device {ordinal}: {e}"))
                }
                #[cfg(not(feature = "cuda"))]
                anyhow::bail!(
                    "CUDA device {ordinal} requested but CUDA support is not compiled in. \
                     Rebuild with: cargo build --features cuda"
                )
            }
            Self::Metal => {
                #[cfg(feature = "metal")]
                {
                    Device::new_metal(0)
                        .map_err(|e| anyhow::anyhow!("failed to init Metal device: {e}"))
                }
                #[cfg(not(feature = "metal"))]
                anyhow::bail!(
                    "Metal support not compiled in. Rebuild with: cargo build --features metal"
                )
            }
        }
    }
}

/// Build the model described by `files` on the preferred device.
pub fn load(files: &ModelFiles, device: DevicePreference) -> Result<Xtts> {
    let started = Instant::now();
    files.check_exists()?;
    let device = device.to_device()?;

    let mut config = XttsConfig::from_file(&files.config)?;
    config.splice_paths(&files.vocab, &files.mel_stats, &files.dvae);
    tracing::info!(
        config = %files.config.display(),
        layers = config.model_args.gpt_layers,
        hidden = config.hidden_size(),
        languages = config.languages.len(),
        "parsed model config"
    );

    let tokenizer = TextTokenizer::from_file(&config.model_args.tokenizer_file)?;

    let mut weights = read_checkpoint(&files.checkpoint)?;
    tracing::info!(
        checkpoint = %files.checkpoint.display(),
        tensors = weights.len(),
        "read checkpoint"
    );

    let mel_stats = match weights.remove(MEL_STATS_KEY) {
        Some(stats) => stats,
        None => read_mel_stats(Path::new(&config.model_args.mel_norm_file))?,
    };

    let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
    let model = Xtts::new(config, tokenizer, mel_stats, vb)
        .with_context(|| format!("checkpoint {} does not fit the config", files.checkpoint.display()))?;

    tracing::info!(
        device = %crate::device_info(&device),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "model loaded"
    );
    Ok(model)
}

/// Read every weight in a `.pth` or `.safetensors` checkpoint, with trainer
/// prefixes removed and training-only tensors dropped.
pub fn read_checkpoint(path: &Path) -> Result<HashMap<String, Tensor>> {
    let is_safetensors = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));

    let raw: Vec<(String, Tensor)> = if is_safetensors {
        candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("failed to read {}", path.display()))?
            .into_iter()
            .collect()
    } else {
        let nested = candle_core::pickle::read_all_with_key(path, Some(STATE_DICT_KEY))
            .unwrap_or_default();
        if nested.is_empty() {
            candle_core::pickle::read_all_with_key(path, None)
                .with_context(|| format!("failed to read {}", path.display()))?
        } else {
            nested
        }
    };

    if raw.is_empty() {
        anyhow::bail!("checkpoint {} contains no tensors", path.display());
    }
    Ok(normalize_keys(raw))
}

fn normalize_keys(raw: Vec<(String, Tensor)>) -> HashMap<String, Tensor> {
    raw.into_iter()
        .filter_map(|(name, tensor)| {
            let name = name
                .strip_prefix(TRAINER_PREFIX)
                .map(str::to_string)
                .unwrap_or(name);
            if IGNORED_PREFIXES.iter().any(|p| name.starts_with(p)) {
                None
            } else {
                Some((name, tensor))
            }
        })
        .collect()
}

/// Mel normalization stats from a standalone file: the first 80-element tensor.
fn read_mel_stats(path: &Path) -> Result<Tensor> {
    let tensors = candle_core::pickle::read_all(path)
        .with_context(|| format!("failed to read mel statistics from {}", path.display()))?;
    tensors
        .into_iter()
        .map(|(_, t)| t)
        .find(|t| t.elem_count() == MEL_BANDS)
        .with_context(|| format!("no {MEL_BANDS}-band tensor in {}", path.display()))
}
