//! Sequential Monte Carlo generation over the token tree.
//!
//! # Algorithm
//!
//! A fixed population of particles advances one token per step:
//! 1. Every active particle submits its sequence for a forward pass; a
//!    barrier holds until all of them have their logits, so particles stay
//!    generation-synchronous.
//! 2. Each particle filters its distribution, materializes (or reuses) the
//!    top candidates as tree children, and samples one of them. Candidate
//!    nodes are keyed by decoded text, so particles walking the same
//!    continuation share nodes.
//! 3. When the effective sample size of the active population collapses
//!    below half its size, particles are resampled with replacement
//!    proportional to weight and all active weights reset to zero.
//!
//! Particles terminate on end-of-sequence or on a filtered distribution
//! with no viable entries; terminated particles are left untouched by
//! resampling.

use crate::config::SmcOptions;
use crate::error::{ArborError, Result};
use crate::model::Tokenizer;
use crate::sampling::{filter_logits, top_candidates};
use crate::scheduler::BatchScheduler;
use crate::tree::{NodeId, TokenTree};
use futures::future::try_join_all;
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::debug;

/// Floor added to probabilities before taking logs.
const LOG_EPS: f64 = 1e-12;

/// One weighted trajectory in an SMC run.
#[derive(Debug, Clone)]
struct Particle {
    /// Owned token sequence, templated prompt included.
    sequence: Vec<u32>,
    /// Position in the shared tree.
    node: NodeId,
    /// Accumulated log-probability since the last resample.
    log_weight: f64,
    /// Whether this particle stopped generating.
    terminated: bool,
}

/// Particle-filter generator with weight-based resampling.
pub struct SmcGenerator {
    scheduler: BatchScheduler,
    tokenizer: Arc<dyn Tokenizer>,
    rng: Mutex<StdRng>,
}

impl SmcGenerator {
    /// Create a generator seeded from entropy.
    pub fn new(scheduler: BatchScheduler, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            scheduler,
            tokenizer,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a generator with a fixed seed for reproducible runs.
    pub fn with_seed(
        scheduler: BatchScheduler,
        tokenizer: Arc<dyn Tokenizer>,
        seed: u64,
    ) -> Self {
        Self {
            scheduler,
            tokenizer,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Run SMC from `node`, materializing every visited candidate into the
    /// tree. Returns once all particles terminate or `opts.max_tokens` steps
    /// complete.
    pub async fn generate(
        &self,
        tree: &TokenTree,
        node: NodeId,
        opts: &SmcOptions,
    ) -> Result<()> {
        let initial = tree.prefix_ids(node)?;
        let eos = self.tokenizer.eos_token_id();
        let mut particles: Vec<Particle> = (0..opts.particle_count)
            .map(|_| Particle {
                sequence: initial.clone(),
                node,
                log_weight: 0.0,
                terminated: false,
            })
            .collect();

        for step in 0..opts.max_tokens {
            let active: Vec<usize> = particles
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.terminated)
                .map(|(i, _)| i)
                .collect();
            if active.is_empty() {
                break;
            }

            // Step barrier: every active particle gets its logits before any
            // of them advances.
            let submissions: Vec<_> = active
                .iter()
                .map(|&i| self.scheduler.submit(particles[i].sequence.clone()))
                .collect();
            let logits_list = try_join_all(submissions).await?;

            for (slot, &i) in active.iter().enumerate() {
                self.advance_particle(tree, &mut particles[i], &logits_list[slot], eos, opts)?;
            }

            self.maybe_resample(&mut particles);
            debug!(
                step,
                active = particles.iter().filter(|p| !p.terminated).count(),
                nodes = tree.node_count(),
                "smc step complete"
            );
        }
        Ok(())
    }

    /// Advance one particle by a single sampled token.
    fn advance_particle(
        &self,
        tree: &TokenTree,
        particle: &mut Particle,
        logits: &[f32],
        eos: u32,
        opts: &SmcOptions,
    ) -> Result<()> {
        let probs = filter_logits(logits, &opts.sampling);
        let candidates = top_candidates(&probs, opts.sampling.k);
        if candidates.is_empty() {
            particle.terminated = true;
            return Ok(());
        }

        // Materialize or reuse every candidate, not just the sampled one,
        // so the tree records the alternatives each particle saw.
        let mut candidate_nodes = Vec::with_capacity(candidates.len());
        for (token_id, prob) in &candidates {
            let text = self.tokenizer.decode_token(*token_id)?;
            let child = tree.child_or_insert(particle.node, *token_id, &text, *prob)?;
            candidate_nodes.push(child);
        }

        let weights: Vec<f32> = candidates.iter().map(|(_, p)| *p).collect();
        let choice = {
            let dist = WeightedIndex::new(&weights)
                .map_err(|e| ArborError::Sampling(e.to_string()))?;
            dist.sample(&mut *self.rng.lock())
        };

        let (token, _) = candidates[choice];
        // Weight by the filtered full-distribution probability, not the
        // renormalized candidate-subset one.
        let selected_prob = probs[token as usize] as f64;
        particle.log_weight += (selected_prob + LOG_EPS).ln();
        particle.sequence.push(token);
        particle.node = candidate_nodes[choice];
        if token == eos {
            particle.terminated = true;
        }
        Ok(())
    }

    /// Resample the active population when its effective sample size drops
    /// below half the active count.
    fn maybe_resample(&self, particles: &mut [Particle]) {
        let active: Vec<usize> = particles
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.terminated)
            .map(|(i, _)| i)
            .collect();
        if active.is_empty() {
            return;
        }

        let weights: Vec<f64> = active
            .iter()
            .map(|&i| particles[i].log_weight.exp())
            .collect();
        let total: f64 = weights.iter().sum();
        let normalized: Vec<f64> = weights.iter().map(|w| w / (total + LOG_EPS)).collect();
        let ess = 1.0 / normalized.iter().map(|w| w * w).sum::<f64>();
        if !ess.is_finite() || ess >= active.len() as f64 / 2.0 {
            return;
        }

        debug!(ess, active = active.len(), "resampling particles");
        let Ok(dist) = WeightedIndex::new(&normalized) else {
            return;
        };
        let drawn: Vec<(Vec<u32>, NodeId)> = {
            let mut rng = self.rng.lock();
            (0..active.len())
                .map(|_| {
                    let source = active[dist.sample(&mut *rng)];
                    (particles[source].sequence.clone(), particles[source].node)
                })
                .collect()
        };

        // Replace every active particle's state and reset the whole active
        // set's weights, selected or not. Terminated particles keep theirs.
        for (slot, &i) in active.iter().enumerate() {
            particles[i].sequence = drawn[slot].0.clone();
            particles[i].node = drawn[slot].1;
            particles[i].log_weight = 0.0;
        }
    }
}

/// Effective sample size of a normalized weight set.
#[cfg(test)]
fn effective_sample_size(normalized: &[f64]) -> f64 {
    1.0 / normalized.iter().map(|w| w * w).sum::<f64>()
}
