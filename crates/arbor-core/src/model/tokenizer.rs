//! Tokenizer capability and the HuggingFace-backed implementation.
//!
//! Wraps the HuggingFace tokenizers library the same way the model backend
//! is wrapped: behind a small trait so tests can substitute a scripted
//! vocabulary.

use crate::error::{ArborError, Result};
use std::path::Path;
use tokenizers::Tokenizer as InnerTokenizer;

/// Text/token conversion capability required by the engine.
pub trait Tokenizer: Send + Sync {
    /// Encode text to token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode a single token id to its surface text.
    fn decode_token(&self, id: u32) -> Result<String>;

    /// End-of-sequence token id, also used as batch padding.
    fn eos_token_id(&self) -> u32;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;
}

/// Tokenizer backed by a HuggingFace `tokenizer.json`.
#[derive(Clone)]
pub struct HfTokenizer {
    inner: InnerTokenizer,
    eos_token_id: u32,
}

impl HfTokenizer {
    /// Load from a tokenizer.json file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = InnerTokenizer::from_file(path.as_ref())
            .map_err(|e| ArborError::Tokenizer(format!("failed to load tokenizer: {e}")))?;

        let eos_token_id = ["</s>", "<|end_of_text|>", "<|eot_id|>", "<|im_end|>", "[|endofturn|]"]
            .iter()
            .find_map(|t| inner.token_to_id(t))
            .ok_or_else(|| {
                ArborError::Tokenizer("tokenizer has no recognizable eos token".to_string())
            })?;

        Ok(Self {
            inner,
            eos_token_id,
        })
    }

    /// Load from a model directory containing `tokenizer.json`.
    pub fn from_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let tokenizer_path = model_dir.as_ref().join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(ArborError::Tokenizer(format!(
                "tokenizer.json not found in {}",
                model_dir.as_ref().display()
            )));
        }
        Self::from_file(tokenizer_path)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ArborError::Tokenizer(format!("failed to encode text: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode_token(&self, id: u32) -> Result<String> {
        self.inner
            .decode(&[id], false)
            .map_err(|e| ArborError::Tokenizer(format!("failed to decode token {id}: {e}")))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("eos_token_id", &self.eos_token_id)
            .finish()
    }
}

/// Minimal tokenizer over single lowercase letters.
///
/// Id `i` decodes to the letter `a + (i % 26)` with a numeric suffix past
/// `z`, and the last id of the vocabulary is the eos token `"</s>"`. Encoding
/// maps lowercase letters back to their ids and skips everything else.
/// Useful for tests, benches, and offline demos where a real vocabulary
/// would only get in the way.
#[derive(Debug, Clone)]
pub struct AsciiTokenizer {
    vocab_size: usize,
}

impl AsciiTokenizer {
    /// Create a tokenizer with `vocab_size` ids; the last id is eos.
    pub fn new(vocab_size: usize) -> Self {
        assert!(vocab_size >= 2, "need at least one letter and an eos");
        Self { vocab_size }
    }
}

impl Tokenizer for AsciiTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .chars()
            .filter(|c| c.is_ascii_lowercase())
            .map(|c| (c as u32 - 'a' as u32) % self.vocab_size as u32)
            .collect())
    }

    fn decode_token(&self, id: u32) -> Result<String> {
        if id as usize >= self.vocab_size {
            return Err(ArborError::Tokenizer(format!(
                "token {id} out of range for vocab of {}",
                self.vocab_size
            )));
        }
        if id == self.eos_token_id() {
            return Ok("</s>".to_string());
        }
        let letter = (b'a' + (id % 26) as u8) as char;
        if id < 26 {
            Ok(letter.to_string())
        } else {
            Ok(format!("{letter}{}", id / 26))
        }
    }

    fn eos_token_id(&self) -> u32 {
        self.vocab_size as u32 - 1
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
