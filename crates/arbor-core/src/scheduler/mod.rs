//! Request batching for the model backend.
//!
//! A single worker task owns the only path into the backend, so at most one
//! forward pass is ever in flight. Callers submit token sequences and
//! suspend on a one-shot channel; the worker coalesces whatever arrives
//! within one batching window into a padded batch, runs it, and fans the
//! per-request logits back out.
//!
//! ```text
//!   submit() ──┐
//!   submit() ──┼──> queue ──> worker ──> backend.forward(padded batch)
//!   submit() ──┘                │
//!      ▲                        └──> one-shot reply per request
//!      └── awaits its own logits
//! ```
//!
//! The batching window is measured from the arrival of the *first* request
//! in a batch and is not extended by later arrivals.

use crate::config::SchedulerConfig;
use crate::error::{ArborError, Result};
use crate::model::ModelBackend;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error};

/// A forward-pass request waiting to be batched.
struct BatchRequest {
    input_ids: Vec<u32>,
    reply: oneshot::Sender<Result<Vec<f32>>>,
}

/// Coalesces concurrent forward requests into batched backend calls.
///
/// Cloning is cheap; every clone feeds the same worker.
#[derive(Clone)]
pub struct BatchScheduler {
    tx: mpsc::UnboundedSender<BatchRequest>,
}

impl BatchScheduler {
    /// Spawn the batching worker over `backend`, right-padding batches with
    /// `pad_id` (the tokenizer's eos id).
    pub fn spawn(
        backend: Arc<dyn ModelBackend>,
        pad_id: u32,
        config: SchedulerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(backend, pad_id, config, rx));
        Self { tx }
    }

    /// Submit one sequence; resolves with the logits at its last position.
    ///
    /// Every submission is answered exactly once, with either logits or the
    /// failure of the batch it rode in.
    pub async fn submit(&self, input_ids: Vec<u32>) -> Result<Vec<f32>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BatchRequest { input_ids, reply })
            .map_err(|_| ArborError::SchedulerStopped)?;
        rx.await.map_err(|_| ArborError::SchedulerStopped)?
    }
}

async fn run_worker(
    backend: Arc<dyn ModelBackend>,
    pad_id: u32,
    config: SchedulerConfig,
    mut rx: mpsc::UnboundedReceiver<BatchRequest>,
) {
    while let Some(first) = rx.recv().await {
        let deadline = Instant::now() + config.batch_timeout;
        let mut batch = Vec::with_capacity(config.batch_size);
        // A request whose caller has already gone away would waste a batch
        // slot; skip it here instead of running it.
        if !first.reply.is_closed() {
            batch.push(first);
        }

        while batch.len() < config.batch_size {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(request)) => {
                    if !request.reply.is_closed() {
                        batch.push(request);
                    }
                }
                // Queue closed; run what we have and let the outer loop end.
                Ok(None) => break,
                // Batching window elapsed.
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            run_batch(backend.as_ref(), pad_id, batch).await;
        }
    }
}

/// Run one padded batch and deliver each caller its last-position logits.
async fn run_batch(backend: &dyn ModelBackend, pad_id: u32, batch: Vec<BatchRequest>) {
    let lengths: Vec<usize> = batch.iter().map(|r| r.input_ids.len()).collect();
    let max_len = lengths.iter().copied().max().unwrap_or(0).max(1);

    let rows: Vec<Vec<u32>> = batch
        .iter()
        .map(|r| {
            let mut row = r.input_ids.clone();
            row.resize(max_len, pad_id);
            row
        })
        .collect();

    debug!(requests = batch.len(), seq_len = max_len, "running batched forward");

    match backend.forward(&rows).await {
        Ok(logits) => {
            for (i, request) in batch.into_iter().enumerate() {
                let pos = lengths[i].saturating_sub(1);
                let result = logits
                    .at(i, pos)
                    .map(<[f32]>::to_vec)
                    .ok_or_else(|| {
                        ArborError::Backend(format!(
                            "backend returned no logits for row {i} position {pos}"
                        ))
                    });
                let _ = request.reply.send(result);
            }
        }
        Err(e) => {
            error!(error = %e, "batched forward failed");
            for request in batch {
                let _ = request.reply.send(Err(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchLogits, ScriptedBackend};
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::time::Duration;

    fn config(batch_size: usize) -> SchedulerConfig {
        SchedulerConfig {
            batch_size,
            batch_timeout: Duration::from_millis(100),
        }
    }

    /// Backend whose every forward pass fails with a fixed message.
    struct FailingBackend;

    #[async_trait]
    impl ModelBackend for FailingBackend {
        async fn forward(&self, _rows: &[Vec<u32>]) -> Result<BatchLogits> {
            Err(ArborError::Backend("CUDA error: boom".to_string()))
        }

        fn vocab_size(&self) -> usize {
            4
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submits_coalesce_into_ceil_n_over_b_batches() {
        let backend = Arc::new(ScriptedBackend::new(4));
        let scheduler = BatchScheduler::spawn(backend.clone(), 3, config(4));

        // 10 requests with batch size 4 -> exactly ceil(10/4) = 3 forwards.
        let futures: Vec<_> = (0..10u32)
            .map(|i| scheduler.submit(vec![i]))
            .collect();
        let results = join_all(futures).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(backend.forward_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_size_one_means_one_forward_per_request() {
        let backend = Arc::new(ScriptedBackend::new(4));
        let scheduler = BatchScheduler::spawn(backend.clone(), 3, config(1));

        let futures: Vec<_> = (0..5u32).map(|i| scheduler.submit(vec![i])).collect();
        join_all(futures).await;

        assert_eq!(backend.forward_calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn each_caller_gets_its_own_last_position_logits() {
        // Sequences of different lengths share one batch; each caller must
        // see the logits for its own true last position, not the padding.
        let backend = Arc::new(
            ScriptedBackend::new(3)
                .respond(vec![1], vec![1.0, 0.0, 0.0])
                .respond(vec![2, 2], vec![0.0, 2.0, 0.0])
                .respond(vec![3, 3, 3], vec![0.0, 0.0, 3.0]),
        );
        let scheduler = BatchScheduler::spawn(backend, 0, config(8));

        let (a, b, c) = tokio::join!(
            scheduler.submit(vec![1]),
            scheduler.submit(vec![2, 2]),
            scheduler.submit(vec![3, 3, 3]),
        );

        assert_eq!(a.unwrap(), vec![1.0, 0.0, 0.0]);
        assert_eq!(b.unwrap(), vec![0.0, 2.0, 0.0]);
        assert_eq!(c.unwrap(), vec![0.0, 0.0, 3.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_reaches_every_caller() {
        let scheduler = BatchScheduler::spawn(Arc::new(FailingBackend), 0, config(4));

        let futures: Vec<_> = (0..3u32).map(|i| scheduler.submit(vec![i])).collect();
        let results = join_all(futures).await;

        assert_eq!(results.len(), 3);
        for result in results {
            assert!(matches!(result, Err(ArborError::Backend(_))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_callers_do_not_occupy_batch_slots() {
        let backend = Arc::new(ScriptedBackend::new(4));
        let scheduler = BatchScheduler::spawn(backend.clone(), 3, config(1));

        // Queue a request whose caller is already gone.
        let (reply, receiver) = oneshot::channel();
        drop(receiver);
        scheduler
            .tx
            .send(BatchRequest {
                input_ids: vec![7],
                reply,
            })
            .unwrap();

        // With batch size 1, a dead request occupying a slot would force a
        // second forward pass; skipping it means exactly one.
        let live = scheduler.submit(vec![1]).await;

        assert!(live.is_ok());
        assert_eq!(backend.forward_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_is_padded_and_answered() {
        let backend = Arc::new(ScriptedBackend::new(2).respond(vec![9], vec![5.0, 6.0]));
        let scheduler = BatchScheduler::spawn(backend, 9, config(1));

        // An empty sequence is padded to length one with the pad id and
        // answered with position-zero logits.
        let logits = scheduler.submit(Vec::new()).await.unwrap();
        assert_eq!(logits, vec![5.0, 6.0]);
    }
}
