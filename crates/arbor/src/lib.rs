//! # Arbor
//!
//! Interactive token-level inference over a branching generation tree.
//!
//! Arbor turns one loaded autoregressive model into an explorable search
//! space:
//! - **Token trees**: every continuation the engine touches is recorded as
//!   a shared, text-keyed tree node
//! - **Batched scheduling**: concurrent next-token requests coalesce into
//!   few backend forward passes
//! - **Tree exploration**: bounded-depth branching with a greedy-path
//!   extension along the most likely continuation
//! - **SMC generation**: weighted particles with effective-sample-size
//!   resampling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use arbor::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let loader = Arc::new(StaticLoader::new(backend, tokenizer));
//!     let engine = Engine::builder()
//!         .family(ModelFamily::Llama)
//!         .loader(loader)
//!         .build()?;
//!
//!     let tree = engine.generate("req-1", "Tell me a story", None).await?;
//!     println!("{}", serde_json::to_string_pretty(&tree)?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export the core crate.
pub use arbor_core::*;

mod engine;

pub use engine::{Engine, EngineBuilder, EngineConfig};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{Engine, EngineBuilder, EngineConfig};
    pub use arbor_core::{
        config::{GuardConfig, SamplingOptions, SchedulerConfig, SmcOptions},
        error::{ArborError, Result},
        event::{Event, EventSink},
        lifecycle::{LoadedModel, ModelLoader, ModelState, ResourceGuard, StaticLoader},
        model::{AsciiTokenizer, HfTokenizer, ModelBackend, ModelFamily, Tokenizer},
        scheduler::BatchScheduler,
        search::{SmcGenerator, TreeExplorer},
        tree::{NodeId, TokenTree, TreeSnapshot},
    };

    // Re-export useful external types.
    pub use anyhow;
    pub use tokio;
    pub use tracing;
}
