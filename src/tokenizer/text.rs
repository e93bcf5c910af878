//! BPE text tokenizer over the model's `vocab.json`.
//!
//! The vocabulary file is a serialized `tokenizers` pipeline. Input is cleaned
//! (lowercased, symbols rewritten, whitespace collapsed), prefixed with a
//! `[lang]` tag, and spaces become explicit `[SPACE]` tokens before encoding.

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tokenizers::Tokenizer;

static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static AUX_SYMBOLS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>()\[\]"«»]+"#).expect("valid regex"));
static SENTENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^.!?…]+(?:[.!?…]+|$)").expect("valid regex"));

/// Languages the tokenizer knows a `[lang]` tag for.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "en", "es", "fr", "de", "it", "pt", "pl", "tr", "ru", "nl", "cs", "ar", "zh-cn", "hu", "ko",
    "ja", "hi",
];

/// Characters per generation pass before the model starts to degrade.
pub fn char_limit(language: &str) -> usize {
    match language {
        "en" => 250,
        "de" => 253,
        "fr" => 273,
        "es" => 239,
        "it" => 213,
        "pt" => 203,
        "pl" => 224,
        "zh" | "zh-cn" => 82,
        "ar" => 166,
        "cs" => 186,
        "ru" => 182,
        "nl" => 251,
        "tr" => 226,
        "ja" => 71,
        "hu" => 224,
        "ko" => 95,
        _ => 250,
    }
}

/// Tokenizer plus the text normalization that precedes it.
#[derive(Debug)]
pub struct TextTokenizer {
    tokenizer: Tokenizer,
}

impl TextTokenizer {
    /// Load the serialized tokenizer stored as `vocab.json`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    pub fn from_tokenizer(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }

    /// Normalize `text` for `language`: lowercase, rewrite symbols, drop
    /// bracketing punctuation, collapse whitespace.
    pub fn clean(text: &str, language: &str) -> String {
        let and = match language {
            "es" => " y ",
            "fr" => " et ",
            "de" => " und ",
            "pt" | "it" => " e ",
            "nl" => " en ",
            "pl" => " i ",
            _ => " and ",
        };
        let lowered = text
            .to_lowercase()
            .replace('&', and)
            .replace(';', ",")
            .replace(':', ",")
            .replace('-', " ");
        let stripped = AUX_SYMBOLS_RE.replace_all(&lowered, "");
        SPACES_RE.replace_all(stripped.trim(), " ").into_owned()
    }

    /// The exact string handed to the BPE model.
    pub fn preprocess(text: &str, language: &str) -> String {
        let cleaned = Self::clean(text, language);
        format!("[{language}]{cleaned}").replace(' ', "[SPACE]")
    }

    /// Encode `text` in `language` to token ids.
    pub fn encode(&self, text: &str, language: &str) -> Result<Vec<u32>> {
        let language = normalize_language(language);
        let prepared = Self::preprocess(text, language);
        let encoding = self
            .tokenizer
            .encode(prepared.as_str(), false)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }
}

/// Map aliases onto the tag the vocabulary uses.
pub fn normalize_language(language: &str) -> &str {
    match language {
        "zh" => "zh-cn",
        other => other,
    }
}

/// Split `text` into pieces of at most `limit` characters, preferring
/// sentence boundaries and falling back to word boundaries. Consecutive short
/// sentences are packed together.
pub fn split_sentences(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut pieces: Vec<String> = Vec::new();

    for m in SENTENCE_RE.find_iter(text) {
        let sentence = m.as_str().trim();
        if sentence.is_empty() {
            continue;
        }
        if sentence.chars().count() <= limit {
            pieces.push(sentence.to_string());
            continue;
        }
        let mut current = String::new();
        for word in sentence.split_whitespace() {
            let needed = if current.is_empty() { 0 } else { 1 } + word.chars().count();
            if !current.is_empty() && current.chars().count() + needed > limit {
                pieces.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            pieces.push(current);
        }
    }

    let mut packed: Vec<String> = Vec::new();
    for piece in pieces {
        match packed.last_mut() {
            Some(last) if last.chars().count() + 1 + piece.chars().count() <= limit => {
                last.push(' ');
                last.push_str(&piece);
            }
            _ => packed.push(piece),
        }
    }
    packed
}

#[cfg(test)]
pub(crate) fn create_mock_tokenizer() -> Tokenizer {
    use tokenizers::models::bpe::BPE;
    use tokenizers::AddedToken;

    const SPECIAL: [&str; 5] = ["[STOP]", "[UNK]", "[SPACE]", "[es]", "[en]"];
    let letters: Vec<char> = "abcdefghijklmnopqrstuvwxyzáéíóúñü¿?¡!.,'".chars().collect();
    let vocab: [(String, u32); 45] = std::array::from_fn(|i| {
        let token = if i < SPECIAL.len() {
            SPECIAL[i].to_string()
        } else {
            letters[i - SPECIAL.len()].to_string()
        };
        (token, i as u32)
    });

    let merges: Vec<(String, String)> = vec![];
    let bpe = BPE::builder()
        .vocab_and_merges(vocab, merges)
        .unk_token("[UNK]".to_string())
        .build()
        .unwrap();

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.add_special_tokens(&[
        AddedToken::from("[STOP]", true),
        AddedToken::from("[UNK]", true),
        AddedToken::from("[SPACE]", true),
        AddedToken::from("[es]", true),
        AddedToken::from("[en]", true),
    ]);
    tokenizer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(
            TextTokenizer::clean("  Hola,   Mundo!  ", "es"),
            "hola, mundo!"
        );
        assert_eq!(TextTokenizer::clean("Tú & yo", "es"), "tú y yo");
        assert_eq!(TextTokenizer::clean("(Rock) & roll", "en"), "rock and roll");
        assert_eq!(TextTokenizer::clean("a-b: c; d", "en"), "a b, c, d");
    }

    #[test]
    fn test_preprocess_marks_language_and_spaces() {
        assert_eq!(
            TextTokenizer::preprocess("Hola Pedro", "es"),
            "[es]hola[SPACE]pedro"
        );
    }

    #[test]
    fn test_encode_with_mock() {
        let tok = TextTokenizer::from_tokenizer(create_mock_tokenizer());
        let ids = tok.encode("Hola yo", "es").unwrap();
        assert_eq!(ids[0], tok.token_to_id("[es]").unwrap());
        assert!(ids.contains(&tok.token_to_id("[SPACE]").unwrap()));
        // [es] + 4 letters + [SPACE] + 2 letters
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn test_char_limits() {
        assert_eq!(char_limit("es"), 239);
        assert_eq!(char_limit("en"), 250);
        assert_eq!(char_limit("zh"), 82);
        assert_eq!(char_limit("xx"), 250);
        assert_eq!(normalize_language("zh"), "zh-cn");
        assert!(SUPPORTED_LANGUAGES.contains(&"es"));
    }

    #[test]
    fn test_split_short_text_is_single_piece() {
        let pieces = split_sentences("Hola, soy Pedro. ¿Cómo estás?", 239);
        assert_eq!(pieces, vec!["Hola, soy Pedro. ¿Cómo estás?"]);
    }

    #[test]
    fn test_split_respects_limit() {
        let text = "Primera frase larga aquí. Segunda frase también larga. Tercera.";
        let pieces = split_sentences(text, 30);
        assert_eq!(
            pieces,
            vec![
                "Primera frase larga aquí.",
                "Segunda frase también larga.",
                "Tercera."
            ]
        );
        assert!(pieces.iter().all(|p| p.chars().count() <= 30));
    }

    #[test]
    fn test_split_overlong_sentence_on_words() {
        let pieces = split_sentences("uno dos tres cuatro cinco seis", 10);
        assert_eq!(pieces, vec!["uno dos", "tres", "cuatro", "cinco seis"]);
    }

    #[test]
    fn test_split_text_without_terminal_punctuation() {
        let pieces = split_sentences("Sin punto final", 100);
        assert_eq!(pieces, vec!["Sin punto final"]);
        assert!(split_sentences("   ", 100).is_empty());
    }
}
