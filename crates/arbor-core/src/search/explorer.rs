//! Bounded-depth tree exploration with greedy-path extension.
//!
//! # Algorithm
//!
//! Exploration recurses from a starting node:
//! 1. A childless node gets up to `k` children, materialized from the
//!    filtered next-token distribution over its full prefix.
//! 2. Every child subtree is then explored concurrently, one level
//!    shallower. The call returns only once all of them finish.
//! 3. A single logical path, formed by always taking the maximum-probability
//!    child, is the *greedy path*. When the recursion reaches its last
//!    level on that path, branching stops and a fixed-length linear
//!    extension continues from the greedy child instead. This bounds tree
//!    growth while still following the most likely continuation further
//!    than everything else.
//!
//! Recursion stops early at end-of-sequence nodes and at nodes whose
//! filtered distribution has no viable entries.

use crate::config::{SamplingOptions, GREEDY_EXTENSION_DEPTH};
use crate::error::Result;
use crate::event::{Event, EventSink};
use crate::model::Tokenizer;
use crate::sampling::{argmax, filter_logits, top_candidates};
use crate::scheduler::BatchScheduler;
use crate::tree::{NodeId, TokenTree};
use futures::future::{try_join_all, BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::debug;

/// Expands a token tree by querying the model for top-k continuations.
pub struct TreeExplorer {
    scheduler: BatchScheduler,
    tokenizer: Arc<dyn Tokenizer>,
    events: EventSink,
}

impl TreeExplorer {
    /// Create an explorer over a scheduler/tokenizer pair.
    pub fn new(
        scheduler: BatchScheduler,
        tokenizer: Arc<dyn Tokenizer>,
        events: EventSink,
    ) -> Self {
        Self {
            scheduler,
            tokenizer,
            events,
        }
    }

    /// Explore `depth` levels below `node`, branching up to `opts.k` ways
    /// per level, then emit one update event carrying the expanded subtree.
    pub async fn explore(
        &self,
        tree: &TokenTree,
        node: NodeId,
        depth: usize,
        opts: &SamplingOptions,
        extend_greedy: bool,
    ) -> Result<()> {
        self.explore_recursive(tree, node, depth, true, extend_greedy, opts)
            .await?;
        self.events.send(Event::Update {
            tree: tree.snapshot(node)?,
        });
        Ok(())
    }

    fn explore_recursive<'a>(
        &'a self,
        tree: &'a TokenTree,
        node: NodeId,
        depth: usize,
        on_greedy_path: bool,
        extend_greedy: bool,
        opts: &'a SamplingOptions,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if depth == 0 || self.is_eos(tree, node)? {
                return Ok(());
            }

            if !tree.has_children(node) {
                self.expand_node(tree, node, opts).await?;
            }

            if depth == 1 && extend_greedy && on_greedy_path {
                if let Some(greedy) = tree.greedy_child(node) {
                    self.extend(tree, greedy, GREEDY_EXTENSION_DEPTH, opts)
                        .await?;
                }
                return Ok(());
            }

            let greedy = tree.greedy_child(node);
            let tasks: Vec<_> = tree
                .children(node)
                .into_iter()
                .map(|child| {
                    self.explore_recursive(
                        tree,
                        child,
                        depth - 1,
                        on_greedy_path && Some(child) == greedy,
                        extend_greedy,
                        opts,
                    )
                })
                .collect();
            try_join_all(tasks).await?;
            Ok(())
        }
        .boxed()
    }

    /// Materialize up to `k` children of a childless node from the filtered
    /// next-token distribution. A zeroed distribution leaves the node as a
    /// leaf, which ends that branch.
    async fn expand_node(
        &self,
        tree: &TokenTree,
        node: NodeId,
        opts: &SamplingOptions,
    ) -> Result<()> {
        let prefix = tree.prefix_ids(node)?;
        let logits = self.scheduler.submit(prefix).await?;
        let probs = filter_logits(&logits, opts);
        let candidates = top_candidates(&probs, opts.k);
        debug!(node = %node, count = candidates.len(), "materializing children");
        for (token_id, prob) in candidates {
            let text = self.tokenizer.decode_token(token_id)?;
            tree.add_child(node, token_id, &text, prob)?;
        }
        Ok(())
    }

    /// Linear extension: follow (or materialize) the most likely
    /// continuation for up to `greedy_depth` steps.
    ///
    /// Strictly sequential. Existing children are advanced through without a
    /// backend call; a childless step materializes up to `k` children and
    /// advances to the best one. Stops early on end-of-sequence or a zeroed
    /// distribution.
    pub async fn extend(
        &self,
        tree: &TokenTree,
        node: NodeId,
        greedy_depth: usize,
        opts: &SamplingOptions,
    ) -> Result<()> {
        let mut current = node;
        for _ in 0..greedy_depth {
            if self.is_eos(tree, current)? {
                break;
            }
            if let Some(next) = tree.greedy_child(current) {
                current = next;
                continue;
            }

            let prefix = tree.prefix_ids(current)?;
            let logits = self.scheduler.submit(prefix).await?;
            let probs = filter_logits(&logits, opts);
            let candidates = top_candidates(&probs, opts.k);
            if candidates.is_empty() {
                break;
            }
            for (token_id, prob) in &candidates {
                let text = self.tokenizer.decode_token(*token_id)?;
                tree.add_child(current, *token_id, &text, *prob)?;
            }
            match tree.greedy_child(current) {
                Some(best) => current = best,
                None => break,
            }
        }
        Ok(())
    }

    /// Greedy top-k generation: at each step materialize the top candidates
    /// as children and follow the argmax token, up to `max_tokens` steps.
    pub async fn generate_topk(
        &self,
        tree: &TokenTree,
        node: NodeId,
        max_tokens: usize,
        opts: &SamplingOptions,
    ) -> Result<()> {
        let mut inputs = tree.prefix_ids(node)?;
        let mut current = node;
        let eos = self.tokenizer.eos_token_id();

        for _ in 0..max_tokens {
            let logits = self.scheduler.submit(inputs.clone()).await?;
            let probs = filter_logits(&logits, opts);
            let candidates = top_candidates(&probs, opts.k);
            if candidates.is_empty() {
                break;
            }

            for (token_id, prob) in &candidates {
                let text = self.tokenizer.decode_token(*token_id)?;
                tree.child_or_insert(current, *token_id, &text, *prob)?;
            }

            let Some(next_token) = argmax(&probs) else {
                break;
            };
            let next_text = self.tokenizer.decode_token(next_token)?;
            current = match tree.child_by_text(current, &next_text) {
                Some(child) => child,
                None => match tree.children(current).first() {
                    Some(first) => *first,
                    None => break,
                },
            };
            inputs.push(next_token);
            if next_token == eos {
                break;
            }
        }
        Ok(())
    }

    fn is_eos(&self, tree: &TokenTree, node: NodeId) -> Result<bool> {
        let token_id = tree.try_get(node)?.token_id;
        Ok(token_id == self.tokenizer.eos_token_id() as i32)
    }
}
