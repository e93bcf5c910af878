//! XTTS voice-cloning text-to-speech.
//!
//! ```text
//! reference wav ─┬─ 22.05 kHz log-mel ─ conditioning encoder ─ perceiver ─┐
//!                └─ 16 kHz ─ ResNet speaker encoder ───────────────┐       │
//! text ─ BPE ─────────────────────────── GPT-2 (codes, latents) ◄──┼───────┘
//!                                                 │                │
//!                                                 └── HiFi-GAN ◄───┘ ─ 24 kHz wav
//! ```
//!
//! Long inputs are split at sentence boundaries to stay under the per-language
//! character limit; the pieces are generated in order and concatenated.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::config::XttsConfig;
use super::gpt::XttsGpt;
use super::hifigan::HifiganDecoder;
use super::speaker::SpeakerEncoder;
use crate::audio::{resample, AudioBuffer, MelConfig, MelSpectrogram, CONDITIONING_SAMPLE_RATE};
use crate::generation::{GenerationConfig, SamplingContext};
use crate::synthesis::SpeechModel;
use crate::tokenizer::{char_limit, normalize_language, split_sentences, TextTokenizer};

/// Reference chunks shorter than this are skipped when conditioning.
const MIN_CHUNK_SECONDS: f32 = 0.33;
/// Peak level references are normalized to when `sound_norm_refs` is set.
const REFERENCE_PEAK: f32 = 0.75;
const MEL_FLOOR: f32 = 1e-5;
const FALLBACK_START_TEXT_TOKEN: u32 = 261;
const FALLBACK_STOP_TEXT_TOKEN: u32 = 0;

/// Conditioning derived from one reference recording.
#[derive(Debug, Clone)]
pub struct XttsVoice {
    /// `[1, num_latents, hidden]` GPT prompt prefix
    pub cond_latents: Tensor,
    /// `[1, d_vector, 1]` unit-norm vocoder conditioning
    pub speaker_embedding: Tensor,
}

/// Loaded XTTS model.
pub struct Xtts {
    config: XttsConfig,
    tokenizer: TextTokenizer,
    gpt: XttsGpt,
    decoder: HifiganDecoder,
    speaker_encoder: SpeakerEncoder,
    cloning_mel: MelSpectrogram,
    /// Per-band mel normalization, `[80, 1]`
    mel_stats: Tensor,
    language: String,
    gpt_cond_len: f32,
    device: Device,
}

impl Xtts {
    /// Build the model from `config`, reading weights through `vb`.
    ///
    /// `mel_stats` holds the 80 per-band divisors applied to the cloning mel.
    pub fn new(
        config: XttsConfig,
        tokenizer: TextTokenizer,
        mel_stats: Tensor,
        vb: VarBuilder,
    ) -> Result<Self> {
        let device = vb.device().clone();
        let a = &config.model_args;

        let start_text = a
            .gpt_start_text_token
            .or_else(|| tokenizer.token_to_id("[START]"))
            .unwrap_or(FALLBACK_START_TEXT_TOKEN);
        let stop_text = a
            .gpt_stop_text_token
            .or_else(|| tokenizer.token_to_id("[STOP]"))
            .unwrap_or(FALLBACK_STOP_TEXT_TOKEN);

        let gpt = XttsGpt::new(&config, start_text, stop_text, vb.pp("gpt"))
            .context("failed to build GPT")?;
        let decoder = HifiganDecoder::new(&config, vb.pp("hifigan_decoder"))
            .context("failed to build HiFi-GAN decoder")?;
        let speaker_encoder = SpeakerEncoder::new(
            &a.speaker_encoder,
            a.d_vector_dim,
            vb.pp("hifigan_decoder.speaker_encoder"),
        )
        .context("failed to build speaker encoder")?;

        let cloning = MelConfig::cloning();
        let n_mels = cloning.n_mels;
        let mel_stats = mel_stats
            .to_dtype(DType::F32)?
            .to_device(&device)?
            .flatten_all()?;
        if mel_stats.dim(0)? != n_mels {
            anyhow::bail!(
                "mel normalization stats have {} bands, expected {n_mels}",
                mel_stats.dim(0)?
            );
        }

        let language = config
            .languages
            .first()
            .cloned()
            .unwrap_or_else(|| "en".to_string());
        let gpt_cond_len = config.gpt_cond_len;

        Ok(Self {
            tokenizer,
            gpt,
            decoder,
            speaker_encoder,
            cloning_mel: MelSpectrogram::new(cloning),
            mel_stats: mel_stats.reshape((n_mels, 1))?,
            language,
            gpt_cond_len,
            device,
            config,
        })
    }

    /// Speak `language` (an XTTS language tag) from now on.
    pub fn with_language(mut self, language: &str) -> Result<Self> {
        let language = normalize_language(language).to_string();
        if !self.config.languages.is_empty() && !self.config.languages.contains(&language) {
            anyhow::bail!(
                "language '{language}' is not supported (expected one of: {})",
                self.config.languages.join(", ")
            );
        }
        self.language = language;
        Ok(self)
    }

    /// Seconds of reference audio used for GPT conditioning.
    pub fn with_gpt_cond_len(mut self, seconds: f32) -> Self {
        self.gpt_cond_len = seconds;
        self
    }

    pub fn config(&self) -> &XttsConfig {
        &self.config
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// GPT prompt latents averaged over the reference chunks.
    pub fn conditioning_latents(&self, reference: &AudioBuffer) -> Result<Tensor> {
        let rate = CONDITIONING_SAMPLE_RATE as f32;
        let total = reference
            .len()
            .min((self.gpt_cond_len * rate) as usize);
        let chunk = ((self.config.gpt_cond_chunk_len * rate) as usize).max(1);
        let min_len = (MIN_CHUNK_SECONDS * rate) as usize;

        let mut styles = Vec::new();
        for start in (0..total).step_by(chunk) {
            let piece = &reference.samples[start..(start + chunk).min(total)];
            if piece.len() < min_len {
                continue;
            }
            let mel = self
                .cloning_mel
                .compute_log_tensor(piece, MEL_FLOOR, &self.device)?
                .broadcast_div(&self.mel_stats)?
                .unsqueeze(0)?;
            styles.push(self.gpt.style_embedding(&mel)?);
        }

        if styles.is_empty() {
            anyhow::bail!(
                "reference audio is too short to condition on ({:.2} s)",
                reference.duration()
            );
        }
        Ok(Tensor::cat(&styles, 0)?.mean_keepdim(0)?)
    }

    fn decode_piece(
        &self,
        text: &str,
        voice: &XttsVoice,
        config: &GenerationConfig,
        ctx: &mut SamplingContext,
    ) -> Result<Vec<f32>> {
        let ids = self.tokenizer.encode(text, &self.language)?;
        let max_tokens = self.config.model_args.gpt_max_text_tokens;
        if ids.len() >= max_tokens {
            anyhow::bail!("text is too long: {} tokens, at most {max_tokens} allowed", ids.len());
        }

        let generated = self.gpt.generate(&voice.cond_latents, &ids, config, ctx)?;
        tracing::debug!(
            text_tokens = ids.len(),
            audio_codes = generated.codes.len(),
            stopped = generated.stopped,
            "decoded sentence"
        );
        self.decoder.decode(&generated.latents, &voice.speaker_embedding)
    }
}

impl SpeechModel for Xtts {
    type Voice = XttsVoice;

    fn sample_rate(&self) -> u32 {
        self.config.model_args.output_sample_rate
    }

    fn prepare_voice(&self, reference: &AudioBuffer) -> Result<XttsVoice> {
        let mut audio = if reference.sample_rate == CONDITIONING_SAMPLE_RATE {
            reference.clone()
        } else {
            resample(reference, CONDITIONING_SAMPLE_RATE)?
        };
        audio.truncate_seconds(self.config.max_ref_len);
        if self.config.sound_norm_refs {
            audio.normalize_peak(REFERENCE_PEAK);
        }

        let cond_latents = self.conditioning_latents(&audio)?;
        let speaker_embedding = self.speaker_encoder.embed(&audio)?;
        Ok(XttsVoice {
            cond_latents,
            speaker_embedding,
        })
    }

    fn generate(
        &self,
        text: &str,
        voice: &XttsVoice,
        config: &GenerationConfig,
        ctx: &mut SamplingContext,
    ) -> Result<AudioBuffer> {
        let config = GenerationConfig {
            stop_token_id: config
                .stop_token_id
                .or(Some(self.config.model_args.gpt_stop_audio_token)),
            ..config.clone()
        };

        let limit = char_limit(&self.language);
        let pieces = if text.chars().count() > limit {
            split_sentences(text, limit)
        } else {
            vec![text.trim().to_string()]
        };

        let mut audio = AudioBuffer::new(Vec::new(), self.sample_rate());
        for piece in &pieces {
            let samples = self.decode_piece(piece, voice, &config, ctx)?;
            audio.append(&AudioBuffer::new(samples, self.sample_rate()))?;
        }
        Ok(audio)
    }

    fn generation_defaults(&self) -> GenerationConfig {
        self.config.generation_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::tiny_config;
    use crate::models::test_support::random_vb;
    use crate::tokenizer::create_mock_tokenizer;

    fn tiny_model() -> Xtts {
        let build = |vb: VarBuilder<'static>| -> Result<Xtts> {
            let mel_stats = Tensor::ones(80, DType::F32, &Device::Cpu)?;
            Xtts::new(
                tiny_config(),
                TextTokenizer::from_tokenizer(create_mock_tokenizer()),
                mel_stats,
                vb,
            )
        };
        let (_varmap, vb) = random_vb(21, |vb| build(vb).map(|_| ()));
        build(vb).unwrap()
    }

    fn reference(seconds: f32) -> AudioBuffer {
        let len = (seconds * 22050.0) as usize;
        let samples = (0..len)
            .map(|i| {
                let t = i as f32 / 22050.0;
                0.4 * (2.0 * std::f32::consts::PI * 180.0 * t).sin()
                    + 0.2 * (2.0 * std::f32::consts::PI * 530.0 * t).sin()
            })
            .collect();
        AudioBuffer::new(samples, 22050)
    }

    #[test]
    fn test_voice_shapes() {
        let model = tiny_model();
        let voice = model.prepare_voice(&reference(1.0)).unwrap();
        assert_eq!(voice.cond_latents.dims(), &[1, 4, 32]);
        assert_eq!(voice.speaker_embedding.dims(), &[1, 8, 1]);
    }

    #[test]
    fn test_short_reference_is_rejected() {
        let model = tiny_model();
        let err = model.prepare_voice(&reference(0.2)).unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let model = tiny_model();
        let voice = model.prepare_voice(&reference(1.0)).unwrap();
        let config = GenerationConfig {
            max_new_tokens: 5,
            ..model.generation_defaults()
        };

        let run = |seed| {
            let mut ctx = SamplingContext::new(Some(seed));
            model.generate("hola, soy pedro.", &voice, &config, &mut ctx).unwrap()
        };
        let a = run(67);
        let b = run(67);
        assert_eq!(a.sample_rate, 24000);
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn test_language_must_be_listed() {
        let model = tiny_model().with_language("en").unwrap();
        assert_eq!(model.language(), "en");
        assert!(model.with_language("xx").is_err());
    }
}
