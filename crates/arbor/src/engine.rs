//! High-level inference engine.

use anyhow::{anyhow, Result};
use arbor_core::config::{GuardConfig, SamplingOptions, SchedulerConfig, SmcOptions};
use arbor_core::event::{Event, EventSink};
use arbor_core::lifecycle::{ModelHandles, ModelLoader, ModelState, ResourceGuard};
use arbor_core::model::ModelFamily;
use arbor_core::search::{SmcGenerator, TreeExplorer};
use arbor_core::tree::{NodeId, TokenTree, TreeSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Configuration for the inference engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model family determining the prompt template.
    pub family: ModelFamily,
    /// Levels explored below the requested node.
    pub explore_depth: usize,
    /// Whether exploration appends the linear greedy extension.
    pub extend_greedy: bool,
    /// Probability shaping shared by exploration and generation.
    pub sampling: SamplingOptions,
    /// SMC settings for generation requests.
    pub smc: SmcOptions,
    /// Batching settings.
    pub scheduler: SchedulerConfig,
    /// Lifecycle settings.
    pub guard: GuardConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            family: ModelFamily::Llama,
            explore_depth: 3,
            extend_greedy: true,
            sampling: SamplingOptions::default(),
            smc: SmcOptions {
                // Request-facing default; the library-level default is
                // shorter.
                max_tokens: 50,
                ..SmcOptions::default()
            },
            scheduler: SchedulerConfig::default(),
            guard: GuardConfig::default(),
        }
    }
}

/// Builder for creating an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    loader: Option<Arc<dyn ModelLoader>>,
    events: EventSink,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            loader: None,
            events: EventSink::null(),
        }
    }

    /// Set the model family.
    pub fn family(mut self, family: ModelFamily) -> Self {
        self.config.family = family;
        self
    }

    /// Set the exploration depth.
    pub fn explore_depth(mut self, depth: usize) -> Self {
        self.config.explore_depth = depth;
        self
    }

    /// Set the sampling options.
    pub fn sampling(mut self, sampling: SamplingOptions) -> Self {
        self.config.sampling = sampling;
        self
    }

    /// Set the SMC options.
    pub fn smc(mut self, smc: SmcOptions) -> Self {
        self.config.smc = smc;
        self
    }

    /// Set the scheduler configuration.
    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.scheduler = scheduler;
        self
    }

    /// Set the lifecycle configuration.
    pub fn guard(mut self, guard: GuardConfig) -> Self {
        self.config.guard = guard;
        self
    }

    /// Set the model loader.
    pub fn loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Set the progress event sink.
    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let loader = self
            .loader
            .ok_or_else(|| anyhow!("engine requires a model loader"))?;
        let guard = ResourceGuard::spawn(
            loader,
            self.config.guard.clone(),
            self.config.scheduler.clone(),
            self.events.clone(),
        );
        info!(
            family = ?self.config.family,
            batch_size = self.config.scheduler.batch_size,
            "engine ready"
        );
        Ok(Engine {
            config: self.config,
            guard,
            events: self.events,
            trees: RwLock::new(HashMap::new()),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// High-level engine tying the lifecycle guard, the search procedures, and
/// a per-request tree store together.
pub struct Engine {
    config: EngineConfig,
    guard: Arc<ResourceGuard>,
    events: EventSink,
    trees: RwLock<HashMap<String, Arc<TokenTree>>>,
}

impl Engine {
    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Load the model eagerly.
    pub async fn load(&self, request_id: &str) -> Result<()> {
        self.guard.load(request_id).await?;
        Ok(())
    }

    /// Release the model.
    pub async fn unload(&self) {
        self.guard.unload().await;
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ModelState {
        self.guard.state()
    }

    /// Receiver that flips to `true` when a fatal fault requests a restart.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.guard.shutdown_signal()
    }

    /// The tree held for `request_id`, if any.
    pub fn tree(&self, request_id: &str) -> Option<Arc<TokenTree>> {
        self.trees.read().get(request_id).cloned()
    }

    /// Create (or return) the tree for a request, rooting it at `input_text`.
    pub async fn create_tree(&self, request_id: &str, input_text: &str) -> Result<Arc<TokenTree>> {
        let handles = self.guard.ensure_ready(request_id).await?;
        self.tree_for(request_id, input_text, &handles)
    }

    fn tree_for(
        &self,
        request_id: &str,
        input_text: &str,
        handles: &ModelHandles,
    ) -> Result<Arc<TokenTree>> {
        if let Some(tree) = self.tree(request_id) {
            return Ok(tree);
        }
        let prompt = self.config.family.render_prompt(input_text);
        let prompt_ids = handles.tokenizer.encode(&prompt)?;
        let tree = Arc::new(TokenTree::new(input_text, prompt_ids));
        self.trees
            .write()
            .insert(request_id.to_string(), tree.clone());
        Ok(tree)
    }

    fn resolve_node(&self, tree: &TokenTree, node_id: Option<&str>) -> Result<NodeId> {
        let Some(raw) = node_id else {
            return Ok(NodeId::ROOT);
        };
        let id = NodeId::parse(raw)
            .filter(|id| tree.contains(*id))
            .ok_or_else(|| anyhow!("unknown node id: {raw}"))?;
        Ok(id)
    }

    /// Explore around a node of an existing request tree.
    ///
    /// Progress is pushed to the event sink as an update carrying the
    /// expanded subtree.
    pub async fn explore(&self, request_id: &str, node_id: Option<&str>) -> Result<()> {
        let handles = self.guard.ensure_ready(request_id).await?;
        let _session = self.guard.begin_session();
        let tree = self
            .tree(request_id)
            .ok_or_else(|| anyhow!("no tree for request {request_id}"))?;
        let node = self.resolve_node(&tree, node_id)?;

        let explorer = TreeExplorer::new(
            handles.scheduler.clone(),
            handles.tokenizer.clone(),
            self.events.clone(),
        );
        if let Err(e) = explorer
            .explore(
                &tree,
                node,
                self.config.explore_depth,
                &self.config.sampling,
                self.config.extend_greedy,
            )
            .await
        {
            self.guard.handle_failure(request_id, &e).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Run SMC generation for a request, creating its tree when absent.
    ///
    /// Returns the serialized result tree, which is also pushed to the event
    /// sink as a `tree_result`.
    pub async fn generate(
        &self,
        request_id: &str,
        input_text: &str,
        node_id: Option<&str>,
    ) -> Result<TreeSnapshot> {
        let handles = self.guard.ensure_ready(request_id).await?;
        let _session = self.guard.begin_session();
        let tree = self.tree_for(request_id, input_text, &handles)?;
        let node = self.resolve_node(&tree, node_id)?;

        self.events.send(Event::GenerationStatus {
            request_id: request_id.to_string(),
            status: "started".to_string(),
            message: "Starting token generation...".to_string(),
        });

        let generator = SmcGenerator::new(handles.scheduler.clone(), handles.tokenizer.clone());
        if let Err(e) = generator.generate(&tree, node, &self.config.smc).await {
            self.guard.handle_failure(request_id, &e).await;
            return Err(e.into());
        }

        let snapshot = tree.snapshot(NodeId::ROOT)?;
        self.events.send(Event::TreeResult {
            request_id: request_id.to_string(),
            tree: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Greedy top-k generation for a request, creating its tree when absent.
    pub async fn generate_topk(
        &self,
        request_id: &str,
        input_text: &str,
        node_id: Option<&str>,
    ) -> Result<TreeSnapshot> {
        let handles = self.guard.ensure_ready(request_id).await?;
        let _session = self.guard.begin_session();
        let tree = self.tree_for(request_id, input_text, &handles)?;
        let node = self.resolve_node(&tree, node_id)?;

        let explorer = TreeExplorer::new(
            handles.scheduler.clone(),
            handles.tokenizer.clone(),
            self.events.clone(),
        );
        if let Err(e) = explorer
            .generate_topk(&tree, node, self.config.smc.max_tokens, &self.config.sampling)
            .await
        {
            self.guard.handle_failure(request_id, &e).await;
            return Err(e.into());
        }

        let snapshot = tree.snapshot(NodeId::ROOT)?;
        self.events.send(Event::TreeResult {
            request_id: request_id.to_string(),
            tree: snapshot.clone(),
        });
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::lifecycle::StaticLoader;
    use arbor_core::model::{AsciiTokenizer, ScriptedBackend};

    const VOCAB: usize = 27;

    fn peaked(entries: &[(usize, f32)]) -> Vec<f32> {
        let mut logits = vec![-30.0; VOCAB];
        for &(i, v) in entries {
            logits[i] = v;
        }
        logits
    }

    fn test_engine(backend: ScriptedBackend, events: EventSink) -> Engine {
        let loader = Arc::new(StaticLoader::new(
            Arc::new(backend),
            Arc::new(AsciiTokenizer::new(VOCAB)),
        ));
        let options = SamplingOptions {
            k: 2,
            temperature: 1.0,
            top_p: 1.0,
            min_p: 0.0,
        };
        Engine::builder()
            .loader(loader)
            .events(events)
            .explore_depth(2)
            .sampling(options)
            .smc(SmcOptions {
                particle_count: 4,
                max_tokens: 3,
                sampling: options,
            })
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn builder_requires_a_loader() {
        assert!(Engine::builder().build().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn explore_requires_an_existing_tree() {
        let engine = test_engine(ScriptedBackend::new(VOCAB), EventSink::null());
        let result = engine.explore("nope", None).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn generate_creates_the_tree_and_reports_results() {
        let backend = ScriptedBackend::new(VOCAB).with_default(peaked(&[(0, 6.0), (1, 5.0)]));
        let (sink, mut rx) = EventSink::channel();
        let engine = test_engine(backend, sink);

        let snapshot = engine.generate("req1", "hello", None).await.unwrap();
        assert_eq!(snapshot.id, "root");
        assert_eq!(snapshot.text, "hello");
        assert!(!snapshot.children.is_empty());
        assert!(engine.tree("req1").is_some());

        // Load events first, then the generation notice, then the result.
        let mut saw_started = false;
        let mut saw_result = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::GenerationStatus { status, .. } if status == "started" => {
                    saw_started = true;
                }
                Event::TreeResult { request_id, tree } => {
                    assert_eq!(request_id, "req1");
                    assert_eq!(tree.id, "root");
                    saw_result = true;
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_result);
    }

    #[tokio::test(start_paused = true)]
    async fn explore_after_generate_reuses_the_tree() {
        let backend = ScriptedBackend::new(VOCAB).with_default(peaked(&[(0, 6.0), (1, 5.0)]));
        let engine = test_engine(backend, EventSink::null());

        engine.generate("req1", "hi", None).await.unwrap();
        let before = engine.tree("req1").unwrap().node_count();

        engine.explore("req1", None).await.unwrap();
        let after = engine.tree("req1").unwrap().node_count();
        assert!(after >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_node_id_is_rejected() {
        let backend = ScriptedBackend::new(VOCAB).with_default(peaked(&[(0, 6.0)]));
        let engine = test_engine(backend, EventSink::null());

        engine.generate("req1", "hi", None).await.unwrap();
        let result = engine.explore("req1", Some("ffffffff")).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn root_resolution_accepts_the_sentinel() {
        let backend = ScriptedBackend::new(VOCAB).with_default(peaked(&[(0, 6.0), (1, 5.0)]));
        let engine = test_engine(backend, EventSink::null());

        engine.generate("req1", "hi", None).await.unwrap();
        engine.explore("req1", Some("root")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn topk_generation_returns_a_greedy_chain() {
        let backend = ScriptedBackend::new(VOCAB).with_default(peaked(&[(2, 6.0), (3, 5.0)]));
        let engine = test_engine(backend, EventSink::null());

        let snapshot = engine.generate_topk("req1", "go", None).await.unwrap();
        // Three steps of k=2 candidates along the argmax path.
        assert_eq!(snapshot.children.len(), 2);
        let greedy = &snapshot.children[0];
        assert_eq!(greedy.text, "c");
        assert!(!greedy.children.is_empty());
    }
}
