//! Audio processing: WAV I/O, resampling and mel spectrograms.

mod io;
mod mel;
pub mod resample;

pub use io::{load_wav, save_wav, AudioBuffer};
pub use mel::{MelConfig, MelScale, MelSpectrogram, WindowKind};
pub use resample::{resample, ResampleQuality, Resampler};

/// Rate of every synthesized waveform written to disk
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Rate the reference voice is conditioned at
pub const CONDITIONING_SAMPLE_RATE: u32 = 22050;

/// Rate the speaker encoder consumes
pub const SPEAKER_ENCODER_SAMPLE_RATE: u32 = 16000;
