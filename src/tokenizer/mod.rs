//! Text tokenization, built on HuggingFace's `tokenizers` crate.

mod text;

pub use text::{char_limit, normalize_language, split_sentences, TextTokenizer, SUPPORTED_LANGUAGES};

#[cfg(test)]
pub(crate) use text::create_mock_tokenizer;
