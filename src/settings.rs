//! Service settings read from the environment.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::hub::{repo_ids, RemoteAssetSpec};
use crate::loader::DevicePreference;

/// Everything the server binary needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `HF_TOKEN`
    pub hf_token: Option<String>,
    /// `HF_HUB_OFFLINE`: resolve from the local cache only
    pub offline: bool,
    pub base_model_repo: String,
    pub checkpoint_repo: String,
    pub speaker_repo: String,
    pub host: String,
    /// First port tried
    pub port: u16,
    /// Ports tried in total before giving up
    pub port_attempts: u16,
    pub device: DevicePreference,
    /// Generations allowed to run at once
    pub max_concurrency: usize,
    pub output_dir: PathBuf,
    /// `MAX_OUTPUT_FILES`: newest WAVs kept in `output_dir`, 0 keeps all
    pub max_output_files: usize,
    /// XTTS language tag the model speaks
    pub language: String,
    /// Seconds of the reference used for GPT conditioning
    pub gpt_cond_len: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hf_token: None,
            offline: false,
            base_model_repo: repo_ids::BASE_MODEL.to_string(),
            checkpoint_repo: repo_ids::CHECKPOINT.to_string(),
            speaker_repo: repo_ids::SPEAKER.to_string(),
            host: "0.0.0.0".to_string(),
            port: 7860,
            port_attempts: 10,
            device: DevicePreference::Auto,
            max_concurrency: 1,
            output_dir: PathBuf::from("outputs"),
            max_output_files: 100,
            language: "es".to_string(),
            gpt_cond_len: 3.0,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset or blank keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let settings = Self {
            hf_token: get("HF_TOKEN"),
            offline: match get("HF_HUB_OFFLINE") {
                Some(v) => parse_flag("HF_HUB_OFFLINE", &v)?,
                None => defaults.offline,
            },
            base_model_repo: get("BASE_MODEL_REPO").unwrap_or(defaults.base_model_repo),
            checkpoint_repo: get("CHECKPOINT_REPO").unwrap_or(defaults.checkpoint_repo),
            speaker_repo: get("SPEAKER_REPO").unwrap_or(defaults.speaker_repo),
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(get("PORT"), "PORT", defaults.port)?,
            port_attempts: parse_or(get("PORT_ATTEMPTS"), "PORT_ATTEMPTS", defaults.port_attempts)?,
            device: parse_or(get("DEVICE"), "DEVICE", defaults.device)?,
            max_concurrency: parse_or(
                get("MAX_CONCURRENCY"),
                "MAX_CONCURRENCY",
                defaults.max_concurrency,
            )?,
            output_dir: get("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            max_output_files: parse_or(
                get("MAX_OUTPUT_FILES"),
                "MAX_OUTPUT_FILES",
                defaults.max_output_files,
            )?,
            language: get("LANGUAGE").unwrap_or(defaults.language),
            gpt_cond_len: parse_or(get("GPT_COND_LEN"), "GPT_COND_LEN", defaults.gpt_cond_len)?,
        };

        if settings.port_attempts == 0 {
            anyhow::bail!("PORT_ATTEMPTS must be at least 1");
        }
        if settings.max_concurrency == 0 {
            anyhow::bail!("MAX_CONCURRENCY must be at least 1");
        }
        if settings.gpt_cond_len <= 0.0 {
            anyhow::bail!("GPT_COND_LEN must be positive");
        }
        Ok(settings)
    }

    pub fn base_model_spec(&self) -> RemoteAssetSpec {
        RemoteAssetSpec::base_model(&self.base_model_repo, self.hf_token.clone())
    }

    pub fn checkpoint_spec(&self) -> RemoteAssetSpec {
        RemoteAssetSpec::checkpoint(&self.checkpoint_repo, self.hf_token.clone())
    }

    pub fn speaker_spec(&self) -> RemoteAssetSpec {
        RemoteAssetSpec::speaker(&self.speaker_repo, self.hf_token.clone())
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match value {
        Some(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid {key}: '{v}'")),
        None => Ok(default),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("invalid {key}: '{value}' (expected 1/0 or true/false)"),
    }
}
