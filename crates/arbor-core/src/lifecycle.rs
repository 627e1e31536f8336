//! Model lifecycle: loading, inactivity unload, failure recovery.
//!
//! A [`ResourceGuard`] owns the single loaded model. Loading is exclusive
//! and idempotent, an inactivity timer releases the model when nothing has
//! touched it for a configured window, and inference failures are
//! classified into out-of-memory (release and reload), fatal GPU faults
//! (signal the supervisor and stop), and everything else (report to the
//! caller, no retry).
//!
//! A fatal fault never restarts the process from within; it flips an
//! observable shutdown signal so an external process manager performs the
//! restart.

use crate::config::{GuardConfig, SchedulerConfig};
use crate::error::{ArborError, Result};
use crate::event::{Event, EventSink};
use crate::model::{ModelBackend, Tokenizer};
use crate::scheduler::BatchScheduler;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Substrings identifying unrecoverable GPU faults.
const FATAL_PATTERNS: &[&str] = &["illegal memory access", "device-side assert", "CUDA error"];

/// Kind of backend failure, classified from the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// GPU-level corruption; the process must be restarted by its
    /// supervisor.
    Fatal,
    /// Out of memory; the model is released and reloaded.
    OutOfMemory,
    /// Anything else; reported to the caller without retry.
    Recoverable,
}

impl FailureKind {
    /// Classify a backend error message.
    ///
    /// Out-of-memory is checked first so a CUDA OOM reloads instead of
    /// escalating to a restart.
    pub fn classify(message: &str) -> FailureKind {
        if message.to_lowercase().contains("out of memory") {
            return FailureKind::OutOfMemory;
        }
        if FATAL_PATTERNS.iter().any(|p| message.contains(p)) {
            return FailureKind::Fatal;
        }
        FailureKind::Recoverable
    }
}

/// Action taken in response to an inference failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Fatal fault; the shutdown signal has been raised.
    Restarting,
    /// The model was released and reloaded.
    Reloaded,
    /// The error was reported to the caller; nothing else happened.
    Reported,
}

/// Lifecycle state of the managed model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    /// No model resident.
    Unloaded,
    /// A load is in progress.
    Loading,
    /// Model resident and serving.
    Loaded,
    /// A failure is being handled.
    Error,
}

impl ModelState {
    /// Wire form used in status events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Loaded => "loaded",
            ModelState::Error => "error",
        }
    }
}

/// A loaded backend/tokenizer pair, as produced by a [`ModelLoader`].
pub struct LoadedModel {
    /// Forward-pass capability.
    pub backend: Arc<dyn ModelBackend>,
    /// Token/text conversion capability.
    pub tokenizer: Arc<dyn Tokenizer>,
}

/// Loads the model capabilities on demand.
///
/// Weight loading mechanics live behind this trait; the guard only cares
/// that a load eventually yields a backend and a tokenizer.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Perform one load attempt.
    async fn load(&self) -> Result<LoadedModel>;
}

/// Loader returning pre-built capabilities.
///
/// Useful for tests and offline demos where the backend and tokenizer are
/// constructed up front.
pub struct StaticLoader {
    backend: Arc<dyn ModelBackend>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl StaticLoader {
    /// Wrap an existing backend/tokenizer pair.
    pub fn new(backend: Arc<dyn ModelBackend>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { backend, tokenizer }
    }
}

#[async_trait]
impl ModelLoader for StaticLoader {
    async fn load(&self) -> Result<LoadedModel> {
        Ok(LoadedModel {
            backend: self.backend.clone(),
            tokenizer: self.tokenizer.clone(),
        })
    }
}

/// Live handles to a loaded model.
#[derive(Clone)]
pub struct ModelHandles {
    /// Token/text conversion capability.
    pub tokenizer: Arc<dyn Tokenizer>,
    /// The only path to the backend.
    pub scheduler: BatchScheduler,
}

struct GuardInner {
    state: ModelState,
    handles: Option<ModelHandles>,
    deadline: Instant,
}

/// Serializes load/unload of the single model and recovers from failures.
pub struct ResourceGuard {
    loader: Arc<dyn ModelLoader>,
    config: GuardConfig,
    scheduler_config: SchedulerConfig,
    events: EventSink,
    inner: Mutex<GuardInner>,
    /// Serializes load against unload and concurrent loads.
    load_lock: tokio::sync::Mutex<()>,
    /// In-flight inference sessions; unload is deferred while nonzero.
    active: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ResourceGuard {
    /// Create a guard and start its inactivity timer.
    pub fn spawn(
        loader: Arc<dyn ModelLoader>,
        config: GuardConfig,
        scheduler_config: SchedulerConfig,
        events: EventSink,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let guard = Arc::new(Self {
            loader,
            config: config.clone(),
            scheduler_config,
            events,
            inner: Mutex::new(GuardInner {
                state: ModelState::Unloaded,
                handles: None,
                deadline: Instant::now() + config.unload_timeout,
            }),
            load_lock: tokio::sync::Mutex::new(()),
            active: AtomicUsize::new(0),
            shutdown_tx,
            shutdown_rx,
        });
        tokio::spawn(run_unload_timer(Arc::downgrade(&guard), config));
        guard
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModelState {
        self.inner.lock().state
    }

    /// Receiver that flips to `true` when a fatal fault requests a restart.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Reset the inactivity deadline.
    pub fn touch(&self) {
        self.inner.lock().deadline = Instant::now() + self.config.unload_timeout;
    }

    /// Mark the start of an inference session; unload is deferred while the
    /// returned guard is alive.
    pub fn begin_session(self: &Arc<Self>) -> ActivityGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            guard: self.clone(),
        }
    }

    fn handles_if_loaded(&self) -> Option<ModelHandles> {
        let inner = self.inner.lock();
        match inner.state {
            ModelState::Loaded => inner.handles.clone(),
            _ => None,
        }
    }

    fn set_state(&self, state: ModelState) {
        self.inner.lock().state = state;
    }

    /// Ensure the model is loaded and ready, loading it if necessary.
    ///
    /// While another caller is mid-load this returns
    /// [`ArborError::ModelLoading`] without blocking; the sink has already
    /// carried the corresponding status.
    pub async fn ensure_ready(&self, request_id: &str) -> Result<ModelHandles> {
        if let Some(handles) = self.handles_if_loaded() {
            self.touch();
            return Ok(handles);
        }
        if self.state() == ModelState::Loading {
            self.events.send(Event::ModelStatus {
                request_id: request_id.to_string(),
                status: ModelState::Loading.as_str().to_string(),
                message: "Model is already being loaded".to_string(),
                progress: None,
            });
            return Err(ArborError::ModelLoading);
        }
        self.load(request_id).await
    }

    /// Load the model if it is not resident. Idempotent: a call while loaded
    /// only resets the inactivity deadline.
    pub async fn load(&self, request_id: &str) -> Result<ModelHandles> {
        let _permit = self.load_lock.lock().await;

        if let Some(handles) = self.handles_if_loaded() {
            self.events.send(Event::ModelStatus {
                request_id: request_id.to_string(),
                status: ModelState::Loaded.as_str().to_string(),
                message: "Model already loaded".to_string(),
                progress: None,
            });
            self.touch();
            return Ok(handles);
        }

        self.set_state(ModelState::Loading);
        self.events.send(Event::LoadingStatus {
            request_id: request_id.to_string(),
            progress: 0,
            message: "Loading model...".to_string(),
        });
        info!("loading model");

        match self.loader.load().await {
            Ok(loaded) => {
                self.events.send(Event::LoadingStatus {
                    request_id: request_id.to_string(),
                    progress: 90,
                    message: "Initializing inference engine...".to_string(),
                });
                let scheduler = BatchScheduler::spawn(
                    loaded.backend,
                    loaded.tokenizer.eos_token_id(),
                    self.scheduler_config.clone(),
                );
                let handles = ModelHandles {
                    tokenizer: loaded.tokenizer,
                    scheduler,
                };
                {
                    let mut inner = self.inner.lock();
                    inner.state = ModelState::Loaded;
                    inner.handles = Some(handles.clone());
                    inner.deadline = Instant::now() + self.config.unload_timeout;
                }
                self.events.send(Event::ModelStatus {
                    request_id: request_id.to_string(),
                    status: ModelState::Loaded.as_str().to_string(),
                    message: "Model loaded successfully".to_string(),
                    progress: Some(100),
                });
                info!("model loaded");
                Ok(handles)
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock();
                    inner.state = ModelState::Unloaded;
                    inner.handles = None;
                }
                error!(error = %e, "model load failed");
                self.events.send(Event::ModelStatus {
                    request_id: request_id.to_string(),
                    status: ModelState::Error.as_str().to_string(),
                    message: format!("Failed to load model: {e}"),
                    progress: None,
                });
                Err(e)
            }
        }
    }

    /// Release the model unless inference is in flight, in which case the
    /// inactivity deadline is pushed instead. Unload and active inference
    /// are mutually exclusive.
    pub async fn unload(&self) {
        let _permit = self.load_lock.lock().await;
        if self.active.load(Ordering::SeqCst) > 0 {
            self.touch();
            return;
        }
        self.release();
    }

    /// Drop the model handles unconditionally. The scheduler worker drains
    /// its remaining queue and exits once the last clone goes away.
    fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.handles.take().is_some() {
            info!("model released");
        }
        inner.state = ModelState::Unloaded;
    }

    /// Classify `err` and run the matching recovery.
    pub async fn handle_failure(&self, request_id: &str, err: &ArborError) -> Recovery {
        let message = err.to_string();
        match FailureKind::classify(&message) {
            FailureKind::Fatal => {
                error!(error = %message, "fatal backend fault, requesting restart");
                self.set_state(ModelState::Error);
                self.events.send(Event::ModelStatus {
                    request_id: request_id.to_string(),
                    status: "critical_error".to_string(),
                    message: format!(
                        "Critical error detected. System will restart in {} seconds...",
                        self.config.restart_grace.as_secs()
                    ),
                    progress: None,
                });
                self.release();
                // Let in-flight clients observe the final status first.
                tokio::time::sleep(self.config.restart_grace).await;
                let _ = self.shutdown_tx.send(true);
                Recovery::Restarting
            }
            FailureKind::OutOfMemory => {
                warn!(error = %message, "out of memory, reloading model");
                self.events.send(Event::ModelStatus {
                    request_id: request_id.to_string(),
                    status: ModelState::Error.as_str().to_string(),
                    message: "Memory error detected, cleaning up and reloading model..."
                        .to_string(),
                    progress: None,
                });
                self.release();
                match self.load(request_id).await {
                    Ok(_) => Recovery::Reloaded,
                    Err(_) => Recovery::Reported,
                }
            }
            FailureKind::Recoverable => {
                self.events.send(Event::ModelStatus {
                    request_id: request_id.to_string(),
                    status: ModelState::Error.as_str().to_string(),
                    message: format!("Inference error: {message}"),
                    progress: None,
                });
                Recovery::Reported
            }
        }
    }
}

/// RAII marker for an in-flight inference session.
pub struct ActivityGuard {
    guard: Arc<ResourceGuard>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.guard.active.fetch_sub(1, Ordering::SeqCst);
        self.guard.touch();
    }
}

async fn run_unload_timer(guard: Weak<ResourceGuard>, config: GuardConfig) {
    loop {
        let (state, deadline) = match guard.upgrade() {
            Some(g) => {
                let inner = g.inner.lock();
                (inner.state, inner.deadline)
            }
            None => return,
        };

        match state {
            ModelState::Loaded if Instant::now() >= deadline => {
                let Some(g) = guard.upgrade() else { return };
                if g.active.load(Ordering::SeqCst) == 0 {
                    info!("unloading model after inactivity");
                    g.unload().await;
                } else {
                    g.touch();
                }
            }
            ModelState::Loaded => tokio::time::sleep_until(deadline).await,
            _ => tokio::time::sleep(config.unload_timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AsciiTokenizer, ScriptedBackend};
    use std::time::Duration;

    /// Loader that counts calls and optionally delays.
    struct CountingLoader {
        inner: StaticLoader,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl CountingLoader {
        fn new(delay: Duration) -> Self {
            Self {
                inner: StaticLoader::new(
                    Arc::new(ScriptedBackend::new(8)),
                    Arc::new(AsciiTokenizer::new(8)),
                ),
                delay,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self) -> Result<LoadedModel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.load().await
        }
    }

    fn guard_config() -> GuardConfig {
        GuardConfig {
            unload_timeout: Duration::from_secs(600),
            restart_grace: Duration::from_secs(5),
        }
    }

    fn spawn_guard(loader: Arc<CountingLoader>) -> Arc<ResourceGuard> {
        ResourceGuard::spawn(
            loader,
            guard_config(),
            SchedulerConfig::default(),
            EventSink::null(),
        )
    }

    #[test]
    fn classification_matches_known_patterns() {
        assert_eq!(
            FailureKind::classify("CUDA error: an illegal memory access was encountered"),
            FailureKind::Fatal
        );
        assert_eq!(
            FailureKind::classify("device-side assert triggered"),
            FailureKind::Fatal
        );
        assert_eq!(
            FailureKind::classify("CUDA out of memory. Tried to allocate 2.00 GiB"),
            FailureKind::OutOfMemory
        );
        assert_eq!(
            FailureKind::classify("Out of memory on host"),
            FailureKind::OutOfMemory
        );
        assert_eq!(
            FailureKind::classify("tensor shape mismatch"),
            FailureKind::Recoverable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn load_is_idempotent_while_loaded() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let guard = spawn_guard(loader.clone());

        guard.load("r1").await.unwrap();
        guard.load("r2").await.unwrap();

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.state(), ModelState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_ready_reports_loading_without_blocking() {
        let loader = Arc::new(CountingLoader::new(Duration::from_secs(30)));
        let guard = spawn_guard(loader.clone());

        let loading_guard = guard.clone();
        let load_task = tokio::spawn(async move { loading_guard.load("r1").await });
        tokio::task::yield_now().await;

        assert_eq!(guard.state(), ModelState::Loading);
        let result = guard.ensure_ready("r2").await;
        assert!(matches!(result, Err(ArborError::ModelLoading)));

        load_task.await.unwrap().unwrap();
        assert_eq!(guard.state(), ModelState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_unloads_the_model() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let guard = spawn_guard(loader);

        guard.load("r1").await.unwrap();
        assert_eq!(guard.state(), ModelState::Loaded);

        tokio::time::sleep(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;

        assert_eq!(guard.state(), ModelState::Unloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn active_sessions_defer_the_unload() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let guard = spawn_guard(loader);

        guard.load("r1").await.unwrap();
        let session = guard.begin_session();

        tokio::time::sleep(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;
        assert_eq!(guard.state(), ModelState::Loaded);

        drop(session);
        tokio::time::sleep(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;
        assert_eq!(guard.state(), ModelState::Unloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_ready_resets_the_deadline() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let guard = spawn_guard(loader.clone());

        guard.load("r1").await.unwrap();

        // Keep touching before the deadline; the model must stay loaded.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(500)).await;
            guard.ensure_ready("r1").await.unwrap();
        }
        assert_eq!(guard.state(), ModelState::Loaded);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oom_failure_reloads_the_model() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let guard = spawn_guard(loader.clone());
        guard.load("r1").await.unwrap();

        let err = ArborError::Backend("CUDA out of memory".to_string());
        let recovery = guard.handle_failure("r1", &err).await;

        assert_eq!(recovery, Recovery::Reloaded);
        assert_eq!(guard.state(), ModelState::Loaded);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_signals_shutdown() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let guard = spawn_guard(loader);
        guard.load("r1").await.unwrap();

        let mut shutdown = guard.shutdown_signal();
        assert!(!*shutdown.borrow());

        let err = ArborError::Backend("CUDA error: device-side assert triggered".to_string());
        let recovery = guard.handle_failure("r1", &err).await;

        assert_eq!(recovery, Recovery::Restarting);
        shutdown.changed().await.unwrap();
        assert!(*shutdown.borrow());
        assert_eq!(guard.state(), ModelState::Unloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_failure_only_reports() {
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let guard = spawn_guard(loader.clone());
        guard.load("r1").await.unwrap();

        let err = ArborError::Backend("tensor shape mismatch".to_string());
        let recovery = guard.handle_failure("r1", &err).await;

        assert_eq!(recovery, Recovery::Reported);
        assert_eq!(guard.state(), ModelState::Loaded);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_events_reach_the_sink() {
        let (sink, mut rx) = EventSink::channel();
        let loader = Arc::new(CountingLoader::new(Duration::ZERO));
        let guard = ResourceGuard::spawn(
            loader,
            guard_config(),
            SchedulerConfig::default(),
            sink,
        );
        guard.load("r1").await.unwrap();

        // Drain the load events.
        while rx.try_recv().is_ok() {}

        let err = ArborError::Backend("something odd".to_string());
        guard.handle_failure("r1", &err).await;

        let event = rx.try_recv().unwrap();
        match event {
            Event::ModelStatus {
                request_id,
                status,
                message,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(status, "error");
                assert!(message.contains("something odd"));
            }
            other => panic!("expected model status event, got {other:?}"),
        }
    }
}
