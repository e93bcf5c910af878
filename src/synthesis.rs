//! Per-request synthesis against an already loaded model.
//!
//! [`Synthesizer`] owns the shared model handle, the prepared reference voice
//! and the output directory. Every call builds its own [`SamplingContext`]
//! from the request seed and writes to its own file, so concurrent calls never
//! observe each other.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::audio::AudioBuffer;
use crate::generation::{GenerationConfig, SamplingContext};
use crate::locate::find_all;

/// A text-to-speech model that can speak in a prepared voice.
///
/// Implementations are shared read-only across requests; all mutable
/// generation state lives in the [`SamplingContext`] passed to
/// [`generate`](SpeechModel::generate).
pub trait SpeechModel: Send + Sync {
    /// Conditioning derived once from a reference recording
    type Voice: Send + Sync + 'static;

    /// Rate of the audio returned by [`generate`](SpeechModel::generate)
    fn sample_rate(&self) -> u32;

    fn prepare_voice(&self, reference: &AudioBuffer) -> Result<Self::Voice>;

    fn generate(
        &self,
        text: &str,
        voice: &Self::Voice,
        config: &GenerationConfig,
        ctx: &mut SamplingContext,
    ) -> Result<AudioBuffer>;

    /// Sampling values not exposed per request (penalties, length caps)
    fn generation_defaults(&self) -> GenerationConfig {
        GenerationConfig::default()
    }
}

/// One form submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub seed: u64,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, temperature: f64, top_p: f64, top_k: usize, seed: u64) -> Self {
        Self {
            text: text.into(),
            temperature,
            top_p,
            top_k,
            seed,
        }
    }

    /// Check the sampling values are in range.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if !(self.temperature > 0.0 && self.temperature <= 1.0) {
            return Err(ParameterError::Temperature(self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ParameterError::TopP(self.top_p));
        }
        if self.top_k == 0 {
            return Err(ParameterError::TopK);
        }
        Ok(())
    }
}

/// Out-of-range sampling values, rejected before generation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("temperature must be in (0, 1], got {0}")]
    Temperature(f64),
    #[error("top_p must be in (0, 1], got {0}")]
    TopP(f64),
    #[error("top_k must be at least 1")]
    TopK,
    #[error("seed must be an integer, got {0}")]
    Seed(String),
}

/// Outcome shown next to the form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SynthesisStatus {
    Success,
    EmptyInput,
    InvalidParameters(String),
    Failed(String),
}

impl SynthesisStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for SynthesisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "✅ Audio generated successfully!"),
            Self::EmptyInput => write!(f, "Please enter some text to synthesize."),
            Self::InvalidParameters(reason) => write!(f, "❌ Invalid parameters: {reason}"),
            Self::Failed(reason) => write!(f, "❌ Error generating audio: {reason}"),
        }
    }
}

/// Waveform (when generated), where it was written, and the status.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub audio: Option<AudioBuffer>,
    pub path: Option<PathBuf>,
    pub status: SynthesisStatus,
}

impl SynthesisResult {
    pub(crate) fn without_audio(status: SynthesisStatus) -> Self {
        Self {
            audio: None,
            path: None,
            status,
        }
    }
}

/// Shared model, prepared voice and output directory.
pub struct Synthesizer<M: SpeechModel> {
    model: Arc<M>,
    voice: M::Voice,
    output_dir: PathBuf,
    /// 0 keeps every file
    max_outputs: usize,
    /// WAVs in `output_dir`, oldest first
    outputs: Mutex<VecDeque<PathBuf>>,
}

impl<M: SpeechModel> Synthesizer<M> {
    /// Prepare `reference` as the voice for every request.
    pub fn new(model: Arc<M>, reference: &AudioBuffer, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let started = Instant::now();
        let voice = model
            .prepare_voice(reference)
            .context("failed to prepare the reference voice")?;
        tracing::info!(
            reference_secs = reference.duration(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reference voice prepared"
        );
        Self::from_voice(model, voice, output_dir)
    }

    pub fn from_voice(model: Arc<M>, voice: M::Voice, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

        // Files left by earlier runs count towards the limit, oldest first.
        let mut existing = find_all(&output_dir, ".wav");
        existing.sort_by_key(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok());
        Ok(Self {
            model,
            voice,
            output_dir,
            max_outputs: 0,
            outputs: Mutex::new(existing.into()),
        })
    }

    /// Keep only the newest `limit` WAVs in the output directory (0 keeps all).
    pub fn with_max_outputs(mut self, limit: usize) -> Self {
        self.max_outputs = limit;
        self
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Generate speech for one request. Never fails: problems come back as a
    /// non-success status with no audio.
    pub fn synthesize(&self, request: &SynthesisRequest) -> SynthesisResult {
        let text = request.text.trim();
        if text.is_empty() {
            return SynthesisResult::without_audio(SynthesisStatus::EmptyInput);
        }
        if let Err(e) = request.validate() {
            tracing::warn!(error = %e, "rejected synthesis request");
            return SynthesisResult::without_audio(SynthesisStatus::InvalidParameters(e.to_string()));
        }

        let config = GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            ..self.model.generation_defaults()
        };
        let mut ctx = SamplingContext::new(Some(request.seed));

        let started = Instant::now();
        match self.generate_to_file(text, &config, &mut ctx) {
            Ok((audio, path)) => {
                tracing::info!(
                    chars = text.chars().count(),
                    seed = request.seed,
                    audio_secs = audio.duration(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    path = %path.display(),
                    "synthesized"
                );
                SynthesisResult {
                    audio: Some(audio),
                    path: Some(path),
                    status: SynthesisStatus::Success,
                }
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), seed = request.seed, "synthesis failed");
                SynthesisResult::without_audio(SynthesisStatus::Failed(format!("{e:#}")))
            }
        }
    }

    fn generate_to_file(
        &self,
        text: &str,
        config: &GenerationConfig,
        ctx: &mut SamplingContext,
    ) -> Result<(AudioBuffer, PathBuf)> {
        let audio = self.model.generate(text, &self.voice, config, ctx)?;
        if audio.is_empty() {
            anyhow::bail!("model produced no audio");
        }
        let path = self.output_dir.join(format!("{}.wav", Uuid::new_v4()));
        audio.save(&path)?;
        self.record_output(path.clone());
        Ok((audio, path))
    }

    fn record_output(&self, path: PathBuf) {
        let mut outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        outputs.push_back(path);
        if self.max_outputs == 0 {
            return;
        }
        while outputs.len() > self.max_outputs {
            let Some(old) = outputs.pop_front() else {
                break;
            };
            if let Err(e) = std::fs::remove_file(&old) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %old.display(), error = %e, "failed to remove old output");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Noise whose length and content depend on the text and the sampler.
    struct NoiseModel {
        calls: AtomicUsize,
    }

    impl SpeechModel for NoiseModel {
        type Voice = f32;

        fn sample_rate(&self) -> u32 {
            24000
        }

        fn prepare_voice(&self, reference: &AudioBuffer) -> Result<f32> {
            Ok(reference.samples.iter().map(|s| s.abs()).fold(0.0, f32::max))
        }

        fn generate(
            &self,
            text: &str,
            voice: &f32,
            config: &GenerationConfig,
            ctx: &mut SamplingContext,
        ) -> Result<AudioBuffer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("boom") {
                anyhow::bail!("decoder exploded");
            }
            let len = text.len() * 100 + config.top_k;
            let samples = (0..len)
                .map(|_| (ctx.rand_f32() - 0.5) * voice * config.temperature as f32)
                .collect();
            Ok(AudioBuffer::new(samples, 24000))
        }
    }

    fn synthesizer(dir: &Path) -> Synthesizer<NoiseModel> {
        let model = Arc::new(NoiseModel {
            calls: AtomicUsize::new(0),
        });
        let reference = AudioBuffer::new(vec![0.0, 0.8, -0.5], 22050);
        Synthesizer::new(model, &reference, dir).unwrap()
    }

    #[test]
    fn test_blank_text_yields_empty_input_status() {
        let dir = tempfile::tempdir().unwrap();
        let synth = synthesizer(dir.path());

        let result = synth.synthesize(&SynthesisRequest::new("   ", 0.5, 0.9, 40, 42));
        assert!(result.audio.is_none());
        assert!(result.path.is_none());
        assert_eq!(result.status, SynthesisStatus::EmptyInput);
        assert_eq!(result.status.to_string(), "Please enter some text to synthesize.");
        assert_eq!(synth.model().calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_same_inputs_give_identical_waveforms() {
        let dir = tempfile::tempdir().unwrap();
        let synth = synthesizer(dir.path());
        let request = SynthesisRequest::new("Hola, soy Pedro.", 0.7, 0.85, 50, 67);

        let a = synth.synthesize(&request);
        let b = synth.synthesize(&request);
        assert!(a.status.is_success());
        assert_eq!(a.status.to_string(), "✅ Audio generated successfully!");

        let (pa, pb) = (a.path.unwrap(), b.path.unwrap());
        assert_ne!(pa, pb);
        assert_eq!(std::fs::read(&pa).unwrap(), std::fs::read(&pb).unwrap());
        assert_eq!(a.audio.unwrap().sample_rate, 24000);

        let other = synth.synthesize(&SynthesisRequest { seed: 68, ..request });
        assert_ne!(std::fs::read(&pa).unwrap(), std::fs::read(other.path.unwrap()).unwrap());
    }

    #[test]
    fn test_generation_error_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let synth = synthesizer(dir.path());

        let result = synth.synthesize(&SynthesisRequest::new("boom", 0.7, 0.85, 50, 1));
        assert!(result.audio.is_none());
        assert_eq!(
            result.status.to_string(),
            "❌ Error generating audio: decoder exploded"
        );

        // Still usable afterwards
        let ok = synth.synthesize(&SynthesisRequest::new("fine", 0.7, 0.85, 50, 1));
        assert!(ok.status.is_success());
    }

    #[test]
    fn test_out_of_range_parameters_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let synth = synthesizer(dir.path());

        for request in [
            SynthesisRequest::new("hola", 0.0, 0.85, 50, 1),
            SynthesisRequest::new("hola", 1.5, 0.85, 50, 1),
            SynthesisRequest::new("hola", 0.7, 0.0, 50, 1),
            SynthesisRequest::new("hola", 0.7, 0.85, 0, 1),
        ] {
            let result = synth.synthesize(&request);
            assert!(matches!(result.status, SynthesisStatus::InvalidParameters(_)));
            assert!(result.audio.is_none());
        }
        assert_eq!(synth.model().calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_output_directory_keeps_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("left-over.wav"), b"").unwrap();
        let synth = synthesizer(dir.path()).with_max_outputs(2);

        let paths: Vec<PathBuf> = (0..3)
            .map(|seed| {
                synth
                    .synthesize(&SynthesisRequest::new("hola", 0.7, 0.85, 50, seed))
                    .path
                    .unwrap()
            })
            .collect();

        assert!(!dir.path().join("left-over.wav").exists());
        assert!(!paths[0].exists());
        assert!(paths[1].exists() && paths[2].exists());
        assert_eq!(find_all(dir.path(), ".wav").len(), 2);
    }

    #[test]
    fn test_output_limit_zero_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let synth = synthesizer(dir.path());
        for seed in 0..3 {
            synth.synthesize(&SynthesisRequest::new("hola", 0.7, 0.85, 50, seed));
        }
        assert_eq!(find_all(dir.path(), ".wav").len(), 3);
    }

    #[test]
    fn test_status_serializes_with_kind() {
        let json = serde_json::to_value(SynthesisStatus::Failed("x".into())).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["detail"], "x");
        let json = serde_json::to_value(SynthesisStatus::Success).unwrap();
        assert_eq!(json["kind"], "success");
    }
}
