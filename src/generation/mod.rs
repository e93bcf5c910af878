//! Sampling primitives shared by the audio-code generator.
//!
//! - Temperature, top-k and top-p filtering
//! - Repetition penalty and stop-code suppression
//! - Per-request RNG via [`SamplingContext`] for reproducible generation

mod sampling;

pub use sampling::{
    apply_repetition_penalty, greedy_sample, sample, suppress_token, GenerationConfig,
    SamplingContext,
};
