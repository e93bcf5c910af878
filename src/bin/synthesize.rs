//! One-shot synthesis to a WAV file.
//!
//! Usage:
//!     cargo run --bin synthesize -- --text "Hola, soy Pedro." --seed 67
//!     cargo run --bin synthesize -- --text "Hello" --language en --speaker-wav me.wav -o hello.wav

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use xtts_clone::{
    load, resolve_assets, AssetResolver, AudioBuffer, DevicePreference, HubSource, Settings,
    SynthesisRequest, Synthesizer,
};

/// Speak text in the cloned voice and write it to a WAV file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Text to synthesize
    #[arg(short, long)]
    text: String,

    /// Sampling temperature (0, 1]
    #[arg(long, default_value_t = 0.7)]
    temperature: f64,

    /// Top-p (nucleus) sampling parameter (0, 1]
    #[arg(long, default_value_t = 0.85)]
    top_p: f64,

    /// Top-k sampling parameter
    #[arg(long, default_value_t = 50)]
    top_k: usize,

    /// Random seed for reproducible generation
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Output WAV file path
    #[arg(short, long, default_value = "output.wav")]
    output: PathBuf,

    /// XTTS language tag
    #[arg(long, env = "LANGUAGE", default_value = "es")]
    language: String,

    /// Device for inference (auto, cpu, cuda, cuda:N, metal)
    #[arg(long, env = "DEVICE", default_value = "auto")]
    device: DevicePreference,

    /// Reference recording to clone instead of the one from the speaker repo
    #[arg(long)]
    speaker_wav: Option<PathBuf>,

    /// Seconds of the reference used for conditioning
    #[arg(long, default_value_t = 3.0)]
    gpt_cond_len: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::from_env()?;

    let resolver = AssetResolver::new(HubSource::new(settings.hf_token.clone(), settings.offline)?);
    let assets = resolve_assets(&resolver, &settings)?;
    let speaker_wav = args.speaker_wav.clone().unwrap_or(assets.speaker_wav);

    let model = load(&assets.files, args.device)?
        .with_language(&args.language)?
        .with_gpt_cond_len(args.gpt_cond_len);
    let reference = AudioBuffer::load(&speaker_wav)
        .with_context(|| format!("failed to read {}", speaker_wav.display()))?;

    let out_dir = match args.output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let synth = Synthesizer::new(Arc::new(model), &reference, &out_dir)?;

    let request = SynthesisRequest::new(args.text, args.temperature, args.top_p, args.top_k, args.seed);
    let result = synth.synthesize(&request);
    println!("{}", result.status);

    let path = result
        .path
        .with_context(|| format!("no audio produced: {}", result.status))?;
    std::fs::rename(&path, &args.output)
        .with_context(|| format!("failed to move {} to {}", path.display(), args.output.display()))?;

    if let Some(audio) = result.audio {
        println!(
            "Wrote {} ({:.2}s at {} Hz)",
            args.output.display(),
            audio.duration(),
            audio.sample_rate
        );
    }
    Ok(())
}
