//! Error types for Arbor Core.

use thiserror::Error;

/// Result type alias for Arbor operations.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in Arbor operations.
///
/// Every variant carries an owned message so a single failure can be
/// delivered to all callers waiting on the same batch.
#[derive(Error, Debug, Clone)]
pub enum ArborError {
    /// Model backend failure during a forward pass.
    #[error("backend error: {0}")]
    Backend(String),

    /// Tokenizer encode/decode failure.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// A request referenced a node that is not in the tree.
    #[error("unknown node id: {0}")]
    UnknownNode(String),

    /// The batching worker is gone and can no longer serve requests.
    #[error("scheduler stopped")]
    SchedulerStopped,

    /// A load is already in progress; the caller should retry shortly.
    #[error("model is loading")]
    ModelLoading,

    /// Model loading or lifecycle failure.
    #[error("model error: {0}")]
    Model(String),

    /// Categorical sampling over an unusable weight set.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// Logits with an unexpected shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}
