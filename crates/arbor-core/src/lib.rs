//! # Arbor Core
//!
//! Core engine for interactive token-level exploration of autoregressive
//! language models.
//!
//! This crate provides:
//! - **Token trees** with text-keyed, lazily materialized children
//! - **Request batching** coalescing concurrent forward passes into few
//!   backend calls
//! - **Probability filtering** (temperature, min-p, nucleus)
//! - **Tree exploration** to a bounded depth with a greedy-path extension
//! - **Sequential Monte Carlo generation** with weight-based resampling
//! - **Model lifecycle management** with inactivity unload and failure
//!   recovery
//!
//! The model itself stays external: the engine sees a
//! [`ModelBackend`](model::ModelBackend) forward capability and a
//! [`Tokenizer`](model::Tokenizer), nothing more.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod model;
pub mod sampling;
pub mod scheduler;
pub mod search;
pub mod tree;

pub use error::{ArborError, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::config::{
        GuardConfig, SamplingOptions, SchedulerConfig, SmcOptions, GREEDY_EXTENSION_DEPTH,
    };
    pub use crate::error::{ArborError, Result};
    pub use crate::event::{Event, EventSink};
    pub use crate::lifecycle::{
        ActivityGuard, FailureKind, LoadedModel, ModelHandles, ModelLoader, ModelState, Recovery,
        ResourceGuard, StaticLoader,
    };
    pub use crate::model::{
        AsciiTokenizer, BatchLogits, HfTokenizer, ModelBackend, ModelFamily, ScriptedBackend,
        Tokenizer,
    };
    pub use crate::scheduler::BatchScheduler;
    pub use crate::search::{SmcGenerator, TreeExplorer};
    pub use crate::tree::{NodeId, TokenNode, TokenTree, TreeSnapshot, ROOT_TOKEN_ID};
}
