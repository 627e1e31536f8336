//! Tunables consumed by the core engine.

use std::time::Duration;

/// Number of tokens appended linearly past the greedy child when an
/// exploration reaches its depth limit on the greedy path.
pub const GREEDY_EXTENSION_DEPTH: usize = 12;

/// Probability-shaping and branching parameters shared by exploration and
/// generation.
#[derive(Debug, Clone, Copy)]
pub struct SamplingOptions {
    /// Branch width: number of top candidates materialized per step.
    pub k: usize,
    /// Temperature applied to logits before the softmax. `1.0` disables.
    pub temperature: f32,
    /// Nucleus threshold. `1.0` disables.
    pub top_p: f32,
    /// Absolute minimum probability per token. `0.0` disables.
    pub min_p: f32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            k: 5,
            temperature: 0.7,
            top_p: 0.9,
            min_p: 0.05,
        }
    }
}

/// Configuration for the batching scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum requests coalesced into one forward pass.
    pub batch_size: usize,
    /// How long the worker waits for additional requests, measured from the
    /// arrival of the first request in the batch.
    pub batch_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

/// Configuration for Sequential Monte Carlo generation.
#[derive(Debug, Clone)]
pub struct SmcOptions {
    /// Number of particles advanced in lockstep.
    pub particle_count: usize,
    /// Maximum generation steps before the run stops.
    pub max_tokens: usize,
    /// Probability shaping applied at every step.
    pub sampling: SamplingOptions,
}

impl Default for SmcOptions {
    fn default() -> Self {
        Self {
            particle_count: 20,
            max_tokens: 15,
            sampling: SamplingOptions::default(),
        }
    }
}

/// Configuration for the model lifecycle guard.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Inactivity window after which the model is released.
    pub unload_timeout: Duration,
    /// Grace delay between a fatal fault and the shutdown signal, giving
    /// in-flight clients time to observe the final status message.
    pub restart_grace: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            unload_timeout: Duration::from_secs(600),
            restart_grace: Duration::from_secs(5),
        }
    }
}
