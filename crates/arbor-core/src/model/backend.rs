//! Model backend abstraction.
//!
//! The core engine never touches model weights; it sees a single batched
//! forward capability. Implementations live behind this trait so the
//! scheduler and the search procedures can run against anything from a GPU
//! runtime to a scripted test double.

use crate::error::{ArborError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Logits produced by one batched forward pass, shaped
/// `[batch, seq_len, vocab]`.
#[derive(Debug, Clone)]
pub struct BatchLogits {
    data: Vec<f32>,
    batch: usize,
    seq_len: usize,
    vocab: usize,
}

impl BatchLogits {
    /// Wrap a flat buffer, checking that it matches the declared shape.
    pub fn new(data: Vec<f32>, batch: usize, seq_len: usize, vocab: usize) -> Result<Self> {
        if data.len() != batch * seq_len * vocab {
            return Err(ArborError::ShapeMismatch(format!(
                "expected {} x {} x {} = {} values, got {}",
                batch,
                seq_len,
                vocab,
                batch * seq_len * vocab,
                data.len()
            )));
        }
        Ok(Self {
            data,
            batch,
            seq_len,
            vocab,
        })
    }

    /// Logits for one position of one row, or `None` if out of range.
    pub fn at(&self, row: usize, pos: usize) -> Option<&[f32]> {
        if row >= self.batch || pos >= self.seq_len {
            return None;
        }
        let start = (row * self.seq_len + pos) * self.vocab;
        Some(&self.data[start..start + self.vocab])
    }

    /// Number of rows.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Padded sequence length.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Vocabulary size.
    pub fn vocab(&self) -> usize {
        self.vocab
    }
}

/// A loaded causal language model, reduced to its forward capability.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Run one forward pass over `rows` (already padded to a common length),
    /// returning logits for every position of every row.
    ///
    /// Errors carry a human-readable message; the lifecycle guard classifies
    /// failures by matching against it.
    async fn forward(&self, rows: &[Vec<u32>]) -> Result<BatchLogits>;

    /// Size of the logit dimension.
    fn vocab_size(&self) -> usize;
}

/// Backend returning canned logits per token prefix.
///
/// Useful for tests and predetermined generation flows: each known prefix
/// maps to a fixed logit vector, and unknown prefixes fall back to the
/// default vector. Position `p` of a row answers for the prefix
/// `row[..=p]`, so right-padded rows still resolve their true prefixes.
#[derive(Debug)]
pub struct ScriptedBackend {
    responses: HashMap<Vec<u32>, Vec<f32>>,
    default: Vec<f32>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    /// Create a backend over `vocab_size` logits, defaulting to all zeros
    /// (a uniform distribution after the softmax).
    pub fn new(vocab_size: usize) -> Self {
        Self {
            responses: HashMap::new(),
            default: vec![0.0; vocab_size],
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer `prefix` with `logits`.
    pub fn respond(mut self, prefix: Vec<u32>, logits: Vec<f32>) -> Self {
        self.responses.insert(prefix, logits);
        self
    }

    /// Replace the fallback logits for unknown prefixes.
    pub fn with_default(mut self, logits: Vec<f32>) -> Self {
        self.default = logits;
        self
    }

    /// Number of forward passes run so far.
    pub fn forward_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn forward(&self, rows: &[Vec<u32>]) -> Result<BatchLogits> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let vocab = self.default.len();
        let seq_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * seq_len * vocab);
        for row in rows {
            if row.len() != seq_len {
                return Err(ArborError::Backend(format!(
                    "unpadded batch: row of length {} in a batch of length {}",
                    row.len(),
                    seq_len
                )));
            }
            for pos in 0..seq_len {
                let logits = self
                    .responses
                    .get(&row[..=pos])
                    .unwrap_or(&self.default);
                data.extend_from_slice(logits);
            }
        }
        BatchLogits::new(data, rows.len(), seq_len, vocab)
    }

    fn vocab_size(&self) -> usize {
        self.default.len()
    }
}
