//! Build engine for producing images from recipes.
//!
//! Drives each step through the layer cache: the step's cache key is
//! derived from its parent layer, its expanded instruction and its inputs;
//! a hit reuses the stored layer, a miss runs the executor once (even under
//! concurrent builds) and stores the result. The finished chain is handed to
//! the assembler, pinned in the cache and recorded in the image store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Semaphore;

use strata_core::config::EngineConfig;
use strata_core::error::{Result, StrataError};
use strata_core::event::{events, EventEmitter, StrataEvent};

use crate::build::assembler::finalize;
use crate::build::context::BuildContext;
use crate::build::executor::{LayerExecutor, StepContext};
use crate::build::layer::{derive_cache_key, Layer};
use crate::build::recipe::{Instruction, Recipe, Step};
use crate::cache::{LayerCache, LayerStore};
use crate::digest::{ImageId, LayerId};
use crate::fs::Snapshot;
use crate::image::{ChainRegistry, Image, ImageConfig, ImageRegistry, ImageStore, StoreRegistry};
use crate::metrics::MetricsCollector;
use crate::sandbox::Sandbox;

/// Builds allowed to run at once when not configured.
const DEFAULT_PARALLEL_BUILDS: usize = 4;

/// Per-build options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Tag to point at the built image (e.g. "search:8").
    pub tag: Option<String>,
    /// Build argument overrides (`ARG` values).
    pub build_args: HashMap<String, String>,
}

impl BuildOptions {
    pub fn tagged(tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            ..Self::default()
        }
    }

    pub fn with_arg(mut self, name: &str, value: &str) -> Self {
        self.build_args.insert(name.to_string(), value.to_string());
        self
    }
}

/// Outcome of one layer-producing step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub index: usize,
    pub line: usize,
    pub created_by: String,
    pub layer: LayerId,
    pub cache_hit: bool,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub image: Image,
    pub tag: Option<String>,
    /// Layer-producing steps in order (ARG steps are not listed).
    pub steps: Vec<StepRecord>,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// RUN commands actually handed to the sandbox.
    pub run_executions: usize,
}

/// Pins the chain of a running build so concurrent admissions cannot
/// evict it. Released when dropped.
struct BuildPin {
    cache: Arc<LayerCache>,
    id: ImageId,
}

impl BuildPin {
    fn new(cache: Arc<LayerCache>) -> Self {
        let id = ImageId::from_hex(format!("build-{}", uuid::Uuid::new_v4().simple()));
        Self { cache, id }
    }

    fn hold(&self, chain: &[Arc<Layer>]) {
        self.cache
            .pin(&self.id, chain.iter().map(|l| l.id.clone()).collect());
    }
}

impl Drop for BuildPin {
    fn drop(&mut self) {
        self.cache.unpin(&self.id);
    }
}

/// Mutable state accumulated during a build.
struct BuildState {
    pin: BuildPin,
    snapshot: Snapshot,
    config: ImageConfig,
    chain: Vec<Arc<Layer>>,
    /// Declared build arguments and their values.
    args: BTreeMap<String, String>,
    declared: HashSet<String>,
    records: Vec<StepRecord>,
    cache_hits: usize,
    cache_misses: usize,
    run_executions: usize,
}

impl BuildState {
    fn new(pin: BuildPin) -> Self {
        Self {
            pin,
            snapshot: Snapshot::new(),
            config: ImageConfig::default(),
            chain: Vec::new(),
            args: BTreeMap::new(),
            declared: HashSet::new(),
            records: Vec::new(),
            cache_hits: 0,
            cache_misses: 0,
            run_executions: 0,
        }
    }

    fn parent(&self) -> Option<&LayerId> {
        self.chain.last().map(|l| &l.id)
    }

    fn commit(&mut self, step: &Step, layer: Arc<Layer>, cache_hit: bool) {
        self.snapshot.apply(&layer.diff);
        self.config = layer.config.clone();
        self.records.push(StepRecord {
            index: step.index,
            line: step.line,
            created_by: step.text.clone(),
            layer: layer.id.clone(),
            cache_hit,
        });
        if cache_hit {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
        self.chain.push(layer);
        self.pin.hold(&self.chain);
    }

    /// A FROM starts a fresh chain.
    fn reset(&mut self) {
        self.snapshot = Snapshot::new();
        self.config = ImageConfig::default();
        self.chain.clear();
    }
}

/// Image build engine. Cheap to clone; clones share cache, store and
/// build slots.
#[derive(Clone)]
pub struct BuildEngine {
    cache: Arc<LayerCache>,
    images: Arc<ImageStore>,
    executor: LayerExecutor,
    events: EventEmitter,
    metrics: MetricsCollector,
    permits: Arc<Semaphore>,
}

impl BuildEngine {
    pub fn new(cache: Arc<LayerCache>, images: Arc<ImageStore>, executor: LayerExecutor) -> Self {
        Self {
            cache,
            images,
            executor,
            events: EventEmitter::default(),
            metrics: MetricsCollector::new(),
            permits: Arc::new(Semaphore::new(DEFAULT_PARALLEL_BUILDS)),
        }
    }

    /// Bound the number of builds running at once.
    pub fn with_max_parallel_builds(mut self, builds: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(builds.max(1)));
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Open an engine over the persistent state described by `config`.
    ///
    /// FROM resolves previously built images first, then `base`. Images
    /// already in the store are pinned so their layers survive eviction.
    pub async fn open(
        config: &EngineConfig,
        base: Arc<dyn ImageRegistry>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(LayerStore::open(&config.layers_dir())?);
        let cache = Arc::new(LayerCache::with_store(config.cache.capacity, store));
        let images = Arc::new(ImageStore::open(&config.images_dir())?);

        for image in images.list().await {
            cache.pin(&image.id, image.layers.clone());
        }

        let registry = ChainRegistry::new()
            .with(Arc::new(StoreRegistry::new(images.clone(), cache.clone())))
            .with(base);
        let executor = LayerExecutor::new(Arc::new(registry), sandbox)
            .with_run_timeout(config.build.run_timeout());

        tracing::info!(
            state_dir = %config.state_dir.display(),
            capacity = config.cache.capacity,
            images = images.len().await,
            "Opened build engine"
        );

        Ok(Self::new(cache, images, executor)
            .with_max_parallel_builds(config.build.max_parallel_builds))
    }

    pub fn cache(&self) -> &Arc<LayerCache> {
        &self.cache
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.images
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Build one image.
    ///
    /// Aborts at the first failing step; layers committed before it stay
    /// cached.
    pub async fn build(&self, context: &BuildContext, options: &BuildOptions) -> Result<BuildReport> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| StrataError::Other(format!("build slots closed: {}", e)))?;

        self.metrics.build_started().await;
        self.events.emit(StrataEvent::with_fields(
            events::BUILD_STARTED,
            [("tag", json!(options.tag))],
        ));

        let result = self.run_build(context, options).await;

        self.metrics.build_finished(result.is_ok()).await;
        self.metrics
            .set_cache_state(self.cache.len(), self.cache.evictions())
            .await;

        match &result {
            Ok(report) => {
                tracing::info!(
                    image = %report.image.id.short(),
                    tag = ?report.tag,
                    cache_hits = report.cache_hits,
                    cache_misses = report.cache_misses,
                    runs = report.run_executions,
                    "Build completed"
                );
                self.events.emit(StrataEvent::with_fields(
                    events::BUILD_COMPLETED,
                    [
                        ("image", json!(report.image.id.as_str())),
                        ("tag", json!(report.tag)),
                        ("cache_hits", json!(report.cache_hits)),
                    ],
                ));
            }
            Err(e) => {
                tracing::warn!(step = ?e.step(), error = %e, "Build failed");
                self.events.emit(StrataEvent::with_fields(
                    events::BUILD_FAILED,
                    [("step", json!(e.step())), ("error", json!(e.to_string()))],
                ));
            }
        }
        result
    }

    /// Run independent builds concurrently. Results are in job order.
    pub async fn build_all(&self, jobs: Vec<(BuildContext, BuildOptions)>) -> Vec<Result<BuildReport>> {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|(context, options)| {
                let engine = self.clone();
                tokio::spawn(async move { engine.build(&context, &options).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|e| {
                Err(StrataError::Other(format!("build task failed: {}", e)))
            }));
        }
        results
    }

    /// Remove an image by tag or id and release its pin.
    ///
    /// Returns the image whose record was deleted; `None` when only a tag
    /// was dropped and the image is still tagged elsewhere.
    pub async fn remove_image(&self, reference: &str) -> Result<Option<Image>> {
        let removed = self.images.remove(reference).await?;
        if let Some(image) = &removed {
            self.cache.unpin(&image.id);
            tracing::info!(image = %image.id.short(), reference, "Removed image");
        }
        Ok(removed)
    }

    /// Drop layers no stored image references.
    pub fn collect_garbage(&self) -> Result<usize> {
        self.cache.collect_garbage()
    }

    async fn run_build(&self, context: &BuildContext, options: &BuildOptions) -> Result<BuildReport> {
        let recipe = Recipe::parse(&context.recipe)?;
        let mut state = BuildState::new(BuildPin::new(self.cache.clone()));
        let total = recipe.len();

        for step in &recipe.steps {
            let vars: HashMap<String, String> = state
                .args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let instruction = step.instruction.expand(&vars);

            if let Instruction::Arg { name, default } = &instruction {
                state.declared.insert(name.clone());
                match options.build_args.get(name).or(default.as_ref()) {
                    Some(value) => {
                        state.args.insert(name.clone(), value.clone());
                    }
                    None => {
                        state.args.remove(name);
                    }
                }
                continue;
            }

            tracing::info!(step = step.index, total, instruction = %step.text, "Step");
            self.events.emit(StrataEvent::with_fields(
                events::BUILD_STEP_STARTED,
                [("step", json!(step.index)), ("instruction", json!(step.text))],
            ));

            if matches!(instruction, Instruction::From { .. }) {
                state.reset();
            }
            self.build_step(step, &instruction, context, &mut state).await?;
        }

        for name in options.build_args.keys() {
            if !state.declared.contains(name) {
                tracing::warn!(arg = %name, "Build argument was not declared by any ARG");
            }
        }

        // The image pin takes over from the build pin when `state` drops.
        let image = finalize(&state.chain, &state.config, &state.snapshot)?;
        self.cache.pin(&image.id, image.layers.clone());
        self.images.put(&image, options.tag.as_deref()).await?;

        Ok(BuildReport {
            image,
            tag: options.tag.clone(),
            steps: state.records,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            run_executions: state.run_executions,
        })
    }

    async fn build_step(
        &self,
        step: &Step,
        instruction: &Instruction,
        context: &BuildContext,
        state: &mut BuildState,
    ) -> Result<()> {
        let cx = StepContext {
            step,
            instruction,
            context,
            args: &state.args,
        };
        let inputs = self.executor.prepare(&cx).await?;
        let parent = state.parent().cloned();
        let key = derive_cache_key(parent.as_ref(), instruction, &inputs.digests)?;
        let is_run = matches!(instruction, Instruction::Run { .. });
        let no_cache = matches!(instruction, Instruction::Run { no_cache: true, .. });

        let (layer, cache_hit) = if no_cache {
            let output = self
                .executor
                .apply(&state.snapshot, &state.config, &cx, inputs)
                .await?;
            let layer = Layer::new(
                parent,
                key,
                step.text.clone(),
                output.diff,
                output.config,
                false,
                output.from_base,
            );
            (self.cache.store(layer)?, false)
        } else {
            let executor = &self.executor;
            let (snapshot, config, cx) = (&state.snapshot, &state.config, &cx);
            let fill_key = key.clone();
            let created_by = step.text.clone();
            self.cache
                .get_or_execute(&key, || async move {
                    let output = executor.apply(snapshot, config, cx, inputs).await?;
                    Ok(Layer::new(
                        parent,
                        fill_key,
                        created_by,
                        output.diff,
                        output.config,
                        true,
                        output.from_base,
                    ))
                })
                .await?
        };

        if is_run && !cache_hit {
            state.run_executions += 1;
            self.metrics.add_run_execution().await;
        }
        self.metrics.record_step(cache_hit).await;

        if cache_hit {
            tracing::debug!(step = step.index, layer = %layer.id.short(), "Using cache");
            self.events.emit(StrataEvent::with_fields(
                events::BUILD_CACHE_HIT,
                [("step", json!(step.index)), ("layer", json!(layer.id.as_str()))],
            ));
        } else {
            self.events.emit(StrataEvent::with_fields(
                events::BUILD_CACHE_MISS,
                [("step", json!(step.index))],
            ));
            self.events.emit(StrataEvent::with_fields(
                events::BUILD_LAYER_COMMITTED,
                [
                    ("step", json!(step.index)),
                    ("layer", json!(layer.id.as_str())),
                    ("changes", json!(layer.diff.len())),
                ],
            ));
        }

        state.commit(step, layer, cache_hit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Node;
    use crate::image::MemoryRegistry;
    use crate::sandbox::{ExecOutcome, RunRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Appends each command to `/log`; `fail` exits 1.
    #[derive(Default)]
    struct LogSandbox {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Sandbox for LogSandbox {
        async fn execute(&self, request: &RunRequest, snapshot: &Snapshot) -> Result<ExecOutcome> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if request.command == "fail" {
                return Ok(ExecOutcome {
                    exit_code: 1,
                    ..ExecOutcome::default()
                });
            }
            let mut after = snapshot.clone();
            let mut log = snapshot.read_file("/log").unwrap_or_default().to_vec();
            log.extend_from_slice(format!("{} {}\n", request.command, run).as_bytes());
            if let Some(v) = request.env_value("VERSION") {
                log.extend_from_slice(format!("VERSION={}\n", v).as_bytes());
            }
            after.insert("/log", Node::file(log));
            Ok(ExecOutcome {
                diff: snapshot.diff(&after),
                ..ExecOutcome::default()
            })
        }
    }

    fn engine() -> (BuildEngine, Arc<LogSandbox>) {
        let registry = Arc::new(MemoryRegistry::new());
        registry.insert("base", "1", Snapshot::new(), ImageConfig::default());
        registry.insert("base", "2", Snapshot::new(), ImageConfig::default());
        let sandbox = Arc::new(LogSandbox::default());
        let executor = LayerExecutor::new(registry, sandbox.clone());
        let engine = BuildEngine::new(
            Arc::new(LayerCache::new(64)),
            Arc::new(ImageStore::in_memory()),
            executor,
        );
        (engine, sandbox)
    }

    #[tokio::test]
    async fn test_rebuild_hits_cache() {
        let (engine, sandbox) = engine();
        let context = BuildContext::new("FROM base:1\nRUN a\nENV X=1\n");

        let first = engine.build(&context, &BuildOptions::tagged("t:1")).await.unwrap();
        assert_eq!(first.cache_misses, 3);
        assert_eq!(first.run_executions, 1);

        let second = engine.build(&context, &BuildOptions::tagged("t:1")).await.unwrap();
        assert_eq!(second.cache_hits, 3);
        assert_eq!(second.run_executions, 0);
        assert_eq!(first.image.id, second.image.id);
        assert_eq!(sandbox.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_args() {
        let (engine, _) = engine();
        let context = BuildContext::new("ARG TAG=1\nFROM base:${TAG}\nARG VERSION=7\nRUN show\n");

        let report = engine.build(&context, &BuildOptions::default()).await.unwrap();
        assert_eq!(report.steps.len(), 2);
        let rootfs = engine.cache().materialize(report.image.top_layer().unwrap()).unwrap();
        assert!(String::from_utf8_lossy(rootfs.read_file("/log").unwrap()).contains("VERSION=7"));

        // A different value is a different cache key.
        let options = BuildOptions::default().with_arg("VERSION", "8").with_arg("TAG", "2");
        let other = engine.build(&context, &options).await.unwrap();
        assert_eq!(other.cache_hits, 0);
        assert_ne!(report.image.id, other.image.id);
    }

    #[tokio::test]
    async fn test_failure_keeps_earlier_layers() {
        let (engine, _) = engine();
        let failing = BuildContext::new("FROM base:1\nRUN a\nRUN fail\n");
        let err = engine.build(&failing, &BuildOptions::default()).await.unwrap_err();
        assert_eq!(err.step(), Some(3));

        let fixed = BuildContext::new("FROM base:1\nRUN a\nRUN b\n");
        let report = engine.build(&fixed, &BuildOptions::default()).await.unwrap();
        assert_eq!(report.cache_hits, 2);
        assert_eq!(report.run_executions, 1);
    }

    #[tokio::test]
    async fn test_no_cache_run_always_executes() {
        let (engine, sandbox) = engine();
        let context = BuildContext::new("FROM base:1\nRUN --no-cache stamp\nENV X=1\n");
        let first = engine.build(&context, &BuildOptions::default()).await.unwrap();
        let second = engine.build(&context, &BuildOptions::default()).await.unwrap();
        assert_eq!(sandbox.runs.load(Ordering::SeqCst), 2);
        assert_eq!(second.run_executions, 1);
        // The sandbox output differs per run, so descendants differ too.
        assert_ne!(first.image.id, second.image.id);
    }

    #[tokio::test]
    async fn test_remove_image_unpins() {
        let (engine, _) = engine();
        let report = engine
            .build(&BuildContext::new("FROM base:1\nRUN a\n"), &BuildOptions::tagged("t:1"))
            .await
            .unwrap();
        let top = report.image.top_layer().unwrap().clone();
        assert!(engine.cache().is_pinned(&top));

        let removed = engine.remove_image("t:1").await.unwrap().unwrap();
        assert_eq!(removed.id, report.image.id);
        assert!(!engine.cache().is_pinned(&top));
        assert_eq!(engine.collect_garbage().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_small_cache_keeps_running_chain() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.insert("base", "1", Snapshot::new(), ImageConfig::default());
        registry.insert("base", "2", Snapshot::new(), ImageConfig::default());
        let cache = Arc::new(LayerCache::new(2));
        let executor = LayerExecutor::new(registry, Arc::new(LogSandbox::default()));
        let engine = BuildEngine::new(cache.clone(), Arc::new(ImageStore::in_memory()), executor);

        let report = engine
            .build(
                &BuildContext::new("FROM base:1\nRUN a\nRUN b\nENV X=1\n"),
                &BuildOptions::tagged("t:1"),
            )
            .await
            .unwrap();
        let rootfs = cache.materialize(report.image.top_layer().unwrap()).unwrap();
        assert_eq!(rootfs.read_file("/log").unwrap(), b"a 0\nb 1\n");

        // A failed build leaves nothing pinned behind.
        let failing = BuildContext::new("FROM base:2\nRUN c\nRUN fail\n");
        engine.build(&failing, &BuildOptions::default()).await.unwrap_err();
        assert_eq!(engine.collect_garbage().unwrap(), 2);
        assert!(cache.materialize(report.image.top_layer().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let (engine, _) = engine();
        let mut rx = engine.events().subscribe();
        engine
            .build(&BuildContext::new("FROM base:1\n"), &BuildOptions::default())
            .await
            .unwrap();

        let mut keys = Vec::new();
        while let Ok(event) = rx.try_recv() {
            keys.push(event.key);
        }
        assert_eq!(keys.first().map(String::as_str), Some(events::BUILD_STARTED));
        assert!(keys.iter().any(|k| k == events::BUILD_CACHE_MISS));
        assert_eq!(keys.last().map(String::as_str), Some(events::BUILD_COMPLETED));
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let (engine, _) = engine();
        let context = BuildContext::new("FROM base:1\nRUN a\n");
        engine.build(&context, &BuildOptions::default()).await.unwrap();
        engine.build(&context, &BuildOptions::default()).await.unwrap();

        let metrics = engine.metrics().get_metrics().await;
        assert_eq!(metrics.builds_completed, 2);
        assert_eq!(metrics.cache_hits, 2);
        assert_eq!(metrics.cache_misses, 2);
        assert_eq!(metrics.run_executions, 1);
    }

    #[tokio::test]
    async fn test_open_persists_across_restart() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.state_dir = tmp.path().to_path_buf();

        let registry = Arc::new(MemoryRegistry::new());
        registry.insert("base", "1", Snapshot::new(), ImageConfig::default());
        let context = BuildContext::new("FROM base:1\nRUN a\n");

        let sandbox = Arc::new(LogSandbox::default());
        let engine = BuildEngine::open(&config, registry.clone(), sandbox.clone()).await.unwrap();
        let first = engine.build(&context, &BuildOptions::tagged("t:1")).await.unwrap();
        drop(engine);

        let engine = BuildEngine::open(&config, registry, sandbox.clone()).await.unwrap();
        let second = engine.build(&context, &BuildOptions::default()).await.unwrap();
        assert_eq!(second.run_executions, 0);
        assert_eq!(first.image.id, second.image.id);
        assert!(engine.cache().is_pinned(first.image.top_layer().unwrap()));

        // Built images are valid bases.
        let derived = engine
            .build(&BuildContext::new("FROM t:1\nENV Y=2\n"), &BuildOptions::default())
            .await
            .unwrap();
        let rootfs = engine.cache().materialize(derived.image.top_layer().unwrap()).unwrap();
        assert!(rootfs.contains("/log"));
        assert_eq!(sandbox.runs.load(Ordering::SeqCst), 1);
    }
}
