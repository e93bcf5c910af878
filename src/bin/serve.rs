//! Voice-clone web form.
//!
//! Resolves and loads everything once, then serves the form on the first free
//! port starting at `PORT`. Configuration comes from the environment; see
//! [`Settings`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use xtts_clone::server::{self, AppState, ServiceInfo};
use xtts_clone::{
    device_info, load, resolve_assets, AssetResolver, AudioBuffer, HubSource, Settings,
    SpeechModel, Synthesizer, Xtts,
};

fn prepare(settings: &Settings) -> Result<(Synthesizer<Xtts>, ServiceInfo)> {
    let resolver = AssetResolver::new(HubSource::new(settings.hf_token.clone(), settings.offline)?);
    let assets = resolve_assets(&resolver, settings)?;
    tracing::info!(
        checkpoint = %assets.files.checkpoint.display(),
        speaker = %assets.speaker_wav.display(),
        "loading model"
    );

    let model = load(&assets.files, settings.device)?
        .with_language(&settings.language)?
        .with_gpt_cond_len(settings.gpt_cond_len);
    let info = ServiceInfo {
        model: assets
            .files
            .checkpoint
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        device: device_info(model.device()),
        language: model.language().to_string(),
        sample_rate: model.sample_rate(),
    };

    let reference = AudioBuffer::load(&assets.speaker_wav)
        .with_context(|| format!("failed to read {}", assets.speaker_wav.display()))?;
    let synthesizer = Synthesizer::new(Arc::new(model), &reference, &settings.output_dir)?
        .with_max_outputs(settings.max_output_files);
    Ok((synthesizer, info))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    tracing::info!(
        base = %settings.base_model_repo,
        checkpoint = %settings.checkpoint_repo,
        speaker = %settings.speaker_repo,
        device = %settings.device,
        offline = settings.offline,
        "starting"
    );

    let startup = settings.clone();
    let (synthesizer, info) = tokio::task::spawn_blocking(move || prepare(&startup))
        .await
        .context("startup task panicked")??;
    tracing::info!(device = %info.device, language = %info.language, "model ready");

    let state = Arc::new(AppState::new(synthesizer, settings.max_concurrency, info));
    let app = server::router(state);

    let (listener, port) =
        server::bind_with_retry(&settings.host, settings.port, settings.port_attempts).await?;
    if port != settings.port {
        tracing::warn!(requested = settings.port, port, "requested port was busy");
    }
    server::serve(listener, app).await
}
