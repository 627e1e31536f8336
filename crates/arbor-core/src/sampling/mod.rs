//! Probability filtering and candidate selection.
//!
//! Everything in this module is deterministic and side-effect-free; random
//! draws live with their callers so they can be seeded per run.

mod filter;

pub use filter::{argmax, filter_logits, top_candidates};
