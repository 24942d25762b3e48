//! Lifecycle wrapper around one content producer.
//!
//! - One ingest task per source drains the producer channel in order, so
//!   batches reach the pipeline and the layer in production order.
//! - Stop lets the batch in progress finish before the task ends.
//! - Refresh is skip-if-busy: a second refresh while one is in flight is
//!   reported as [`RefreshOutcome::Skipped`].
//! - Pages derived by plugins are tracked per page and removed once the page
//!   is removed or stops deriving them.
//! - If the ingest task dies, the source exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    ContentSource, SourceError, SourceEvent, SourceFile, SourceId, SourceMessage, SourceResult,
    SourceSender, SourceState,
};
use crate::fs::path::normalize_path;
use crate::layer::FileLayer;
use crate::metrics::EngineMetrics;
use crate::page::{Page, PageReader};
use crate::plugin::{HookPoint, PageContext, PluginPipeline};

const CHANNEL_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;

/// Shared collaborators every source needs for ingest.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub pipeline: Arc<PluginPipeline>,
    pub reader: PageReader,
    pub metrics: Arc<EngineMetrics>,
}

/// Result of a refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// A refresh was already in flight.
    Skipped,
    /// The source stopped while the refresh ran; its result was dropped.
    Discarded,
}

/// A live content source and the layer it owns.
#[derive(Debug)]
pub struct Source {
    id: SourceId,
    name: String,
    layer: Arc<FileLayer>,
    producer: Arc<dyn ContentSource>,
    ctx: SourceContext,
    state: RwLock<SourceState>,
    events: broadcast::Sender<SourceEvent>,
    sender: SourceSender,
    receiver: Mutex<Option<mpsc::Receiver<SourceMessage>>>,
    shutdown: watch::Sender<bool>,
    ingest: Mutex<Option<JoinHandle<()>>>,
    refreshing: AtomicBool,
    /// Page path to the paths its last ingest derived.
    derived: Mutex<HashMap<String, Vec<String>>>,
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        producer: Arc<dyn ContentSource>,
        ctx: SourceContext,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            id: Uuid::new_v4(),
            layer: Arc::new(FileLayer::new(name.clone())),
            name,
            producer,
            ctx,
            state: RwLock::new(SourceState::Pending),
            events,
            sender: SourceSender::new(tx),
            receiver: Mutex::new(Some(rx)),
            shutdown,
            ingest: Mutex::new(None),
            refreshing: AtomicBool::new(false),
            derived: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer(&self) -> &Arc<FileLayer> {
        &self.layer
    }

    pub async fn state(&self) -> SourceState {
        *self.state.read().await
    }

    /// Subscribe to error and exit events.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    /// Start the producer and the ingest task.
    ///
    /// On failure the source ends up `exited` without emitting an exit event.
    pub async fn start(self: &Arc<Self>) -> SourceResult<()> {
        let state = self.state().await;
        if state != SourceState::Pending {
            return Err(self.invalid_state("start", state));
        }
        let Some(receiver) = self.receiver.lock().await.take() else {
            return Err(self.invalid_state("start", state));
        };

        let task = tokio::spawn(Arc::clone(self).run_ingest(receiver, self.shutdown.subscribe()));
        *self.ingest.lock().await = Some(task);

        if let Err(e) = self.producer.start(self.sender.clone()).await {
            self.halt_ingest().await;
            *self.state.write().await = SourceState::Exited;
            warn!(source = %self.name, error = %e, "Source failed to start");
            return Err(SourceError::Init { name: self.name.clone(), reason: format!("{:#}", e) });
        }

        let mut state = self.state.write().await;
        if *state == SourceState::Pending {
            *state = SourceState::Running;
        }
        info!(source = %self.name, source_id = %self.id, "Source started");
        Ok(())
    }

    /// Stop the producer, let the current batch finish, then exit.
    /// Idempotent.
    pub async fn stop(&self) -> SourceResult<()> {
        let was = {
            let mut state = self.state.write().await;
            let was = *state;
            if matches!(was, SourceState::Stopped | SourceState::Exited) {
                return Ok(());
            }
            *state = SourceState::Stopped;
            was
        };

        let result = if was == SourceState::Pending { Ok(()) } else { self.producer.stop().await };
        self.halt_ingest().await;
        self.finish(None).await;

        result.map_err(|e| SourceError::Stop {
            name: self.name.clone(),
            reason: format!("{:#}", e),
        })
    }

    /// Ask the producer to re-pull.
    pub async fn refresh(&self) -> SourceResult<RefreshOutcome> {
        let state = self.state().await;
        if !state.is_live() {
            return Err(self.invalid_state("refresh", state));
        }
        if self.refreshing.swap(true, Ordering::AcqRel) {
            debug!(source = %self.name, "Refresh skipped, previous refresh still running");
            self.ctx.metrics.record_refresh_skipped(&self.name);
            return Ok(RefreshOutcome::Skipped);
        }

        let result = self.producer.refresh(&self.sender).await;
        self.refreshing.store(false, Ordering::Release);

        if !self.state().await.is_live() {
            debug!(source = %self.name, "Refresh finished after stop, result discarded");
            return Ok(RefreshOutcome::Discarded);
        }

        match result {
            Ok(()) => Ok(RefreshOutcome::Refreshed),
            Err(e) => {
                let reason = format!("{:#}", e);
                self.report_error(reason.clone()).await;
                Err(SourceError::Refresh { name: self.name.clone(), reason })
            }
        }
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Run a named workflow. Lifecycle state is never changed.
    pub async fn trigger_workflow(
        &self,
        workflow: &str,
        path: &str,
        data: Value,
    ) -> SourceResult<()> {
        if !self.has_workflow(workflow) {
            return Err(SourceError::WorkflowNotFound {
                source_name: self.name.clone(),
                workflow: workflow.to_string(),
            });
        }

        debug!(source = %self.name, workflow = %workflow, path = %path, "Running workflow");
        self.producer.run_workflow(workflow, path, data, &self.sender).await.map_err(|e| {
            SourceError::Workflow {
                source_name: self.name.clone(),
                workflow: workflow.to_string(),
                reason: format!("{:#}", e),
            }
        })
    }

    pub fn has_workflow(&self, workflow: &str) -> bool {
        self.producer.workflows().iter().any(|name| name == workflow)
    }

    fn invalid_state(&self, action: &'static str, state: SourceState) -> SourceError {
        SourceError::InvalidState { name: self.name.clone(), action, state }
    }

    async fn halt_ingest(&self) {
        let _ = self.shutdown.send(true);
        let task = self.ingest.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(source = %self.name, error = %e, "Ingest task ended abnormally");
            }
        }
    }

    /// Move to `exited` and emit the exit event, once.
    async fn finish(&self, reason: Option<String>) {
        {
            let mut state = self.state.write().await;
            if *state == SourceState::Exited {
                return;
            }
            *state = SourceState::Exited;
        }
        info!(source = %self.name, source_id = %self.id, reason = ?reason, "Source exited");
        let _ = self.events.send(SourceEvent::Exit {
            source_id: self.id,
            name: self.name.clone(),
            reason,
        });
    }

    async fn report_error(&self, message: String) {
        {
            let mut state = self.state.write().await;
            if *state == SourceState::Running {
                *state = SourceState::Errored;
            }
        }
        debug!(source = %self.name, error = %message, "Source reported an error");
        self.ctx.metrics.record_source_error(&self.name);
        let _ = self.events.send(SourceEvent::Error {
            source_id: self.id,
            name: self.name.clone(),
            message,
        });
    }

    async fn recover(&self) {
        let mut state = self.state.write().await;
        if *state == SourceState::Errored {
            *state = SourceState::Running;
            debug!(source = %self.name, "Source recovered");
        }
    }

    /// Run the ingest loop in its own task. A panic there ends the source.
    async fn run_ingest(
        self: Arc<Self>,
        receiver: mpsc::Receiver<SourceMessage>,
        shutdown: watch::Receiver<bool>,
    ) {
        let ingest = tokio::spawn(Arc::clone(&self).ingest_loop(receiver, shutdown));
        if let Err(e) = ingest.await {
            error!(source = %self.name, error = %e, "Ingest task died");
            self.finish(Some(format!("ingest task died: {}", e))).await;
        }
    }

    async fn ingest_loop(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<SourceMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                message = receiver.recv() => message,
            };

            match message {
                Some(SourceMessage::Files(files)) => {
                    self.ingest_files(files).await;
                    self.recover().await;
                }
                Some(SourceMessage::Removed(paths)) => {
                    self.remove_files(paths).await;
                    self.recover().await;
                }
                Some(SourceMessage::Error(message)) => self.report_error(message).await,
                Some(SourceMessage::Exit(reason)) => {
                    self.finish(reason).await;
                    break;
                }
                None => break,
            }
        }
        trace!(source = %self.name, "Ingest task finished");
    }

    async fn ingest_files(&self, files: Vec<SourceFile>) {
        for file in files {
            let path = match normalize_path(&file.path) {
                Ok(path) => path,
                Err(e) => {
                    warn!(source = %self.name, path = %file.path, error = %e, "Skipping file");
                    continue;
                }
            };

            if self.ctx.reader.rules().is_page(&path) {
                self.ingest_page(path, file.data).await;
            } else {
                self.write_raw(&path, file.data).await;
            }
        }
    }

    async fn ingest_page(&self, path: String, data: Vec<u8>) {
        let page = match self.ctx.reader.serialisers().decode(&path, &data) {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    source = %self.name,
                    path = %path,
                    error = %e,
                    "Page decode failed, writing raw content"
                );
                self.ctx.metrics.record_page_error(&self.name);
                self.write_raw(&path, data).await;
                self.replace_derived(&path, Vec::new()).await;
                return;
            }
        };

        let Some((page, derived)) = self.run_plugins(HookPoint::AfterSource, page).await else {
            return;
        };
        self.write_page(&page).await;
        for page in &derived {
            self.write_page(page).await;
        }
        let produced = derived.into_iter().map(|page| page.path).collect();
        self.replace_derived(&path, produced).await;
    }

    /// Record what `page` derived on this ingest and remove the paths it no
    /// longer derives.
    async fn replace_derived(&self, page: &str, produced: Vec<String>) {
        let previous = {
            let mut derived = self.derived.lock().await;
            if produced.is_empty() {
                derived.remove(page)
            } else {
                derived.insert(page.to_string(), produced.clone())
            }
        };

        for stale in previous.unwrap_or_default() {
            if !produced.contains(&stale) {
                debug!(source = %self.name, page = %page, path = %stale, "Dropping derived page");
                self.remove_path(&stale).await;
            }
        }
    }

    /// Run `hook` over `page`. None when a plugin halted the pipeline.
    async fn run_plugins(&self, hook: HookPoint, page: Page) -> Option<(Page, Vec<Page>)> {
        let path = page.path.clone();
        let mut page_ctx = PageContext::new(self.name.clone(), page, self.ctx.reader.clone());
        let result = self.ctx.pipeline.dispatch(hook, &mut page_ctx).await;
        for error in &result.errors {
            self.ctx.metrics.record_plugin_error(error.plugin());
        }
        if let Some((plugin, reason)) = &result.halted {
            debug!(
                source = %self.name,
                path = %path,
                hook = %hook,
                plugin = %plugin,
                reason = %reason,
                "Pipeline halted"
            );
            return None;
        }
        Some(page_ctx.into_parts())
    }

    async fn write_page(&self, page: &Page) {
        match self.ctx.reader.serialisers().encode(page) {
            Ok(bytes) => self.write_raw(&page.path, bytes).await,
            Err(e) => {
                warn!(source = %self.name, path = %page.path, error = %e, "Page encode failed");
                self.ctx.metrics.record_page_error(&self.name);
            }
        }
    }

    async fn write_raw(&self, path: &str, data: Vec<u8>) {
        match self.layer.write(path, data).await {
            Ok(_) => self.ctx.metrics.record_ingested(&self.name),
            Err(e) => warn!(source = %self.name, path = %path, error = %e, "Layer write failed"),
        }
    }

    async fn remove_files(&self, paths: Vec<String>) {
        for path in paths {
            let path = match normalize_path(&path) {
                Ok(path) => path,
                Err(e) => {
                    warn!(source = %self.name, path = %path, error = %e, "Skipping removal");
                    continue;
                }
            };

            if self.ctx.reader.rules().is_page(&path) {
                self.run_plugins(HookPoint::AfterRemove, Page::new(path.clone())).await;
            }
            self.remove_path(&path).await;
            self.replace_derived(&path, Vec::new()).await;
        }
    }

    async fn remove_path(&self, path: &str) {
        match self.layer.remove(path).await {
            Ok(()) => self.ctx.metrics.record_removed(&self.name),
            Err(e) if e.is_not_found() => {
                debug!(source = %self.name, path = %path, "Removal of unknown path ignored");
            }
            Err(e) => {
                warn!(source = %self.name, path = %path, error = %e, "Layer remove failed");
            }
        }
    }
}
