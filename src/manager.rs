//! Source manager: owns every source, the union view, the plugin pipeline
//! and the refresh scheduler.
//!
//! - Sources start concurrently, and the scheduler runs while they do. Layer
//!   precedence follows the order sources were requested in, not the order
//!   they finished starting.
//! - A source's layer is mounted only after the source started successfully.
//! - Each source gets a supervisor task that forwards its errors and detaches
//!   its layer when it exits.
//! - Layer watch streams of all sources are fanned into one update channel,
//!   starting once the layer is mounted.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::Registry;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigValidationError, SourceDefinition};
use crate::layer::{ChangeKind, FileChange, UnionView};
use crate::metrics::EngineMetrics;
use crate::page::{Page, PageError, PageReader, PageRules};
use crate::plugin::{PluginEntry, PluginPipeline, builtin_entries};
use crate::registry::{ModuleRegistry, RegistryError};
use crate::scheduler::{Scheduler, SchedulerHandle, SourceList};
use crate::serialiser::{JSON_FILTER, JsonSerialiser, SerialiserError, SerialiserSet};
use crate::source::{Source, SourceContext, SourceError, SourceEvent, SourceId};

const UPDATE_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Serialiser(#[from] SerialiserError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("No live source named '{0}'")]
    UnknownSource(String),

    #[error("No source provides workflow '{0}'")]
    WorkflowNotFound(String),

    #[error("{} source(s) failed to stop: {}", failures.len(), failures.join("; "))]
    Shutdown { failures: Vec<String> },
}

impl ManagerError {
    /// True for an unknown workflow, whether routed or broadcast.
    pub fn is_workflow_not_found(&self) -> bool {
        matches!(
            self,
            Self::WorkflowNotFound(_) | Self::Source(SourceError::WorkflowNotFound { .. })
        )
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// A file change in any mounted layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUpdate {
    pub source_id: SourceId,
    pub source: String,
    pub path: String,
    pub kind: ChangeKind,
}

/// Callback subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// State shared with supervisor tasks.
#[derive(Debug, Clone)]
struct Mounts {
    filesystem: Arc<UnionView>,
    sources: SourceList,
    events: broadcast::Sender<SourceEvent>,
    metrics: Arc<EngineMetrics>,
}

impl Mounts {
    /// Forget a source and unmount its layer. Returns false if it was not
    /// mounted.
    async fn detach(&self, source: &Source) -> bool {
        self.sources.write().await.retain(|live| live.id() != source.id());
        let removed = self.filesystem.remove_layer(source.layer().id()).await;
        let remaining = self.filesystem.layer_count().await;
        self.metrics.set_layers(remaining);

        if removed {
            info!(source = %source.name(), source_id = %source.id(), "Source layer detached");
            if remaining == 0 {
                debug!("No layers remain mounted, the aggregated filesystem is empty");
            }
        }
        removed
    }
}

/// Everything needed to start and mount one source, detached from the manager
/// so launches can run as tasks.
#[derive(Debug, Clone)]
struct Launcher {
    registry: Arc<ModuleRegistry>,
    context: SourceContext,
    mounts: Mounts,
    updates: broadcast::Sender<SourceUpdate>,
    ranks: Arc<AtomicU64>,
}

impl Launcher {
    /// Reserve `count` consecutive layer ranks.
    fn reserve(&self, count: usize) -> u64 {
        self.ranks.fetch_add(count as u64, Ordering::SeqCst)
    }

    async fn launch(
        self,
        definition: SourceDefinition,
        options: Value,
        rank: u64,
    ) -> ManagerResult<Arc<Source>> {
        if definition.disabled {
            return Err(SourceError::Disabled(definition.name).into());
        }

        let options = merge_options(&definition.options, options);
        let producer = self.registry.source(&definition.module, &definition.name, &options)?;
        let source = Arc::new(Source::new(definition.name.clone(), producer, self.context));

        let events = source.subscribe();
        let changes = source.layer().watch();
        source.start().await?;

        self.mounts.sources.write().await.push(Arc::clone(&source));
        self.mounts.filesystem.add_layer_ranked(source.layer(), rank).await;
        self.mounts.metrics.set_layers(self.mounts.filesystem.layer_count().await);
        tokio::spawn(forward_updates(
            source.id(),
            source.name().to_string(),
            changes,
            self.updates,
        ));
        tokio::spawn(supervise(Arc::clone(&source), events, self.mounts));

        info!(
            source = %source.name(),
            source_id = %source.id(),
            module = %definition.module,
            "Source added"
        );
        Ok(source)
    }
}

/// Object keys of `overrides` replace those of `base`. A null override keeps
/// `base`; any other non-object replaces it outright.
fn merge_options(base: &Value, overrides: Value) -> Value {
    match (base, overrides) {
        (_, Value::Null) => base.clone(),
        (Value::Object(base), Value::Object(overrides)) => {
            let mut merged = base.clone();
            merged.extend(overrides);
            Value::Object(merged)
        }
        (_, overrides) => overrides,
    }
}

/// Top-level orchestrator.
pub struct SourceManager {
    config: Config,
    registry: Arc<ModuleRegistry>,
    pipeline: Arc<PluginPipeline>,
    context: SourceContext,
    mounts: Mounts,
    updates: broadcast::Sender<SourceUpdate>,
    ranks: Arc<AtomicU64>,
    scheduler: Scheduler,
    running: Mutex<Option<SchedulerHandle>>,
    prometheus: Arc<Registry>,
}

impl SourceManager {
    /// Validate `config` and build every component. Nothing is started.
    pub fn from_config(config: Config, registry: ModuleRegistry) -> ManagerResult<Self> {
        config.validate()?;

        let mut serialisers = SerialiserSet::new();
        serialisers.register(JSON_FILTER, Arc::new(JsonSerialiser))?;
        for definition in &config.serialisers {
            let serialiser = registry.serialiser(&definition.module, &definition.options)?;
            serialisers.register(&definition.filter, serialiser)?;
        }

        let mut plugins = Vec::with_capacity(config.plugins.len());
        for definition in &config.plugins {
            let plugin = registry.plugin(&definition.module, &definition.options)?;
            let mut entry = PluginEntry::new(&definition.module, definition.priority, plugin);
            entry.disabled = definition.disabled;
            plugins.push(entry);
        }
        let pipeline = Arc::new(PluginPipeline::with_plugins(plugins, builtin_entries()));

        let prometheus = Arc::new(Registry::new());
        let metrics = Arc::new(EngineMetrics::new(Arc::clone(&prometheus))?);
        let filesystem = Arc::new(UnionView::new());
        let rules = PageRules::new(&config.page_extensions, &config.ignore_pages);
        let reader =
            PageReader::new(Arc::clone(&filesystem), Arc::new(serialisers), Arc::new(rules));

        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            sources = config.sources.len(),
            plugins = config.plugins.len(),
            serialisers = config.serialisers.len() + 1,
            "Source manager configured"
        );

        Ok(Self {
            scheduler: Scheduler::from_schedule(&config.schedule),
            context: SourceContext {
                pipeline: Arc::clone(&pipeline),
                reader,
                metrics: Arc::clone(&metrics),
            },
            mounts: Mounts { filesystem, sources: Arc::default(), events, metrics },
            config,
            registry: Arc::new(registry),
            pipeline,
            updates,
            ranks: Arc::default(),
            running: Mutex::new(None),
            prometheus,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The aggregated, read-only filesystem.
    pub fn filesystem(&self) -> &Arc<UnionView> {
        &self.mounts.filesystem
    }

    pub fn pipeline(&self) -> &Arc<PluginPipeline> {
        &self.pipeline
    }

    /// Plugin ids in dispatch order.
    pub async fn compiled_plugins(&self) -> Vec<String> {
        self.pipeline.order().await
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.mounts.metrics
    }

    pub fn metrics_registry(&self) -> &Arc<Registry> {
        &self.prometheus
    }

    pub fn is_page(&self, path: &str) -> bool {
        self.context.reader.rules().is_page(path)
    }

    /// Decode a page through the union view. Ignored and non-page paths are
    /// rejected.
    pub async fn read_page(&self, path: &str) -> ManagerResult<Page> {
        Ok(self.context.reader.read_page(path).await?)
    }

    pub async fn sources(&self) -> Vec<Arc<Source>> {
        self.mounts.sources.read().await.clone()
    }

    pub async fn source(&self, id: SourceId) -> Option<Arc<Source>> {
        self.mounts.sources.read().await.iter().find(|source| source.id() == id).cloned()
    }

    /// Spawn the scheduler, then start every enabled source concurrently. A
    /// source that fails to start is logged and skipped, and a slow one does
    /// not hold up the others. Returns the number of sources started.
    pub async fn start(&self) -> ManagerResult<usize> {
        {
            let mut running = self.running.lock().await;
            if running.is_some() {
                debug!("Source manager already started");
                return Ok(0);
            }
            *running = Some(self.scheduler.spawn(Arc::clone(&self.mounts.sources)));
        }

        let launcher = self.launcher();
        let definitions: Vec<&SourceDefinition> = self.config.enabled_sources().collect();
        let first_rank = launcher.reserve(definitions.len());

        let mut launches = JoinSet::new();
        for (rank, definition) in (first_rank..).zip(definitions) {
            let name = definition.name.clone();
            let launch = launcher.clone().launch(definition.clone(), Value::Null, rank);
            launches.spawn(async move { (name, launch.await) });
        }

        let mut started = 0;
        while let Some(joined) = launches.join_next().await {
            match joined {
                Ok((_, Ok(_))) => started += 1,
                Ok((name, Err(e))) => error!(source = %name, error = %e, "Source not started"),
                Err(e) => error!(error = %e, "Source launch task failed"),
            }
        }
        if started == 0 {
            warn!("No sources started");
        }

        info!(started, "Source manager started");
        Ok(started)
    }

    /// Cancel the scheduler, then stop every source.
    pub async fn stop(&self) -> ManagerResult<()> {
        if let Some(handle) = self.running.lock().await.take() {
            handle.cancel();
        }
        self.destroy_all().await?;
        info!("Source manager stopped");
        Ok(())
    }

    /// Start a source and mount its layer.
    pub async fn add_source(&self, definition: &SourceDefinition) -> ManagerResult<Arc<Source>> {
        self.add_source_with_options(definition, Value::Null).await
    }

    /// Like [`add_source`](Self::add_source), with `options` merged over the
    /// definition's own options.
    pub async fn add_source_with_options(
        &self,
        definition: &SourceDefinition,
        options: Value,
    ) -> ManagerResult<Arc<Source>> {
        let launcher = self.launcher();
        let rank = launcher.reserve(1);
        launcher.launch(definition.clone(), options, rank).await
    }

    /// Stop a source and unmount its layer. Unknown handles are ignored.
    pub async fn stop_source(&self, id: SourceId) -> ManagerResult<()> {
        let Some(source) = self.source(id).await else {
            debug!(source_id = %id, "Stop requested for unknown source");
            return Ok(());
        };

        let result = source.stop().await;
        self.mounts.detach(&source).await;
        Ok(result?)
    }

    /// Stop every source concurrently and wait for all of them.
    pub async fn destroy_all(&self) -> ManagerResult<()> {
        let sources = std::mem::take(&mut *self.mounts.sources.write().await);
        let count = sources.len();

        let mut tasks = JoinSet::new();
        for source in sources {
            let mounts = self.mounts.clone();
            tasks.spawn(async move {
                let result = source.stop().await;
                mounts.detach(&source).await;
                result
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(e) => failures.push(e.to_string()),
            }
        }

        if failures.is_empty() {
            debug!(count, "All sources destroyed");
            Ok(())
        } else {
            warn!(count, failed = failures.len(), "Some sources failed to stop");
            Err(ManagerError::Shutdown { failures })
        }
    }

    fn launcher(&self) -> Launcher {
        Launcher {
            registry: Arc::clone(&self.registry),
            context: self.context.clone(),
            mounts: self.mounts.clone(),
            updates: self.updates.clone(),
            ranks: Arc::clone(&self.ranks),
        }
    }

    /// Run a workflow on the configured target, or on every source that
    /// provides it.
    pub async fn trigger_workflow(
        &self,
        workflow: &str,
        path: &str,
        data: Value,
    ) -> ManagerResult<()> {
        let sources = self.sources().await;

        if let Some(target) = &self.config.workflow_target {
            let source = sources
                .iter()
                .find(|source| source.name() == target)
                .ok_or_else(|| ManagerError::UnknownSource(target.clone()))?;
            return Ok(source.trigger_workflow(workflow, path, data).await?);
        }

        let providers: Vec<Arc<Source>> =
            sources.into_iter().filter(|source| source.has_workflow(workflow)).collect();
        if providers.is_empty() {
            return Err(ManagerError::WorkflowNotFound(workflow.to_string()));
        }

        let mut first_error = None;
        for source in providers {
            if let Err(e) = source.trigger_workflow(workflow, path, data.clone()).await {
                warn!(source = %source.name(), workflow = %workflow, error = %e, "Workflow failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Receive every file change of every mounted layer.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<SourceUpdate> {
        self.updates.subscribe()
    }

    pub fn on_source_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(SourceUpdate) + Send + Sync + 'static,
    {
        subscribe(self.updates.subscribe(), callback)
    }

    /// Errors and exits of every source, in the order each source emitted
    /// them.
    pub fn on_source_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(SourceEvent) + Send + Sync + 'static,
    {
        subscribe(self.mounts.events.subscribe(), callback)
    }

    pub fn on_source_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(SourceEvent) + Send + Sync + 'static,
    {
        subscribe(self.mounts.events.subscribe(), move |event| {
            if matches!(event, SourceEvent::Error { .. }) {
                callback(event);
            }
        })
    }
}

impl fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceManager")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("filesystem", &self.mounts.filesystem)
            .finish_non_exhaustive()
    }
}

fn subscribe<T, F>(mut receiver: broadcast::Receiver<T>, callback: F) -> Subscription
where
    T: Clone + Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let task = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(item) => callback(item),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    Subscription { task }
}

async fn forward_updates(
    source_id: SourceId,
    source: String,
    mut changes: broadcast::Receiver<FileChange>,
    updates: broadcast::Sender<SourceUpdate>,
) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                let _ = updates.send(SourceUpdate {
                    source_id,
                    source: source.clone(),
                    path: change.path,
                    kind: change.kind,
                });
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(source = %source, skipped, "Layer watch lagged, updates dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn supervise(
    source: Arc<Source>,
    mut events: broadcast::Receiver<SourceEvent>,
    mounts: Mounts,
) {
    loop {
        match events.recv().await {
            Ok(SourceEvent::Error { source_id, name, message }) => {
                warn!(source = %name, error = %message, "Source error");
                let _ = mounts.events.send(SourceEvent::Error { source_id, name, message });
            }
            Ok(event @ SourceEvent::Exit { .. }) => {
                mounts.detach(&source).await;
                let _ = mounts.events.send(event);
                break;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(source = %source.name(), skipped, "Source events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
