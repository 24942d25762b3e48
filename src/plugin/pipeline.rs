//! Plugin pipeline: priority ordering and dispatch.
//!
//! - Entries are compiled into a stable descending sort by priority; equal
//!   priorities keep insertion order, user plugins ahead of built-ins.
//! - The compiled list is swapped atomically; a dispatch keeps the list it
//!   started with.
//! - A failing, panicking or timed-out plugin is rolled back and reported,
//!   and the remaining plugins still run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::hooks::{HookAction, HookPoint, PageContext, Plugin};

const PLUGIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginDispatchError {
    #[error("Plugin '{plugin}' failed on {hook} for {path}: {reason}")]
    Failed { plugin: String, hook: HookPoint, path: String, reason: String },

    #[error("Plugin '{plugin}' panicked on {hook} for {path}: {message}")]
    Panicked { plugin: String, hook: HookPoint, path: String, message: String },

    #[error("Plugin '{plugin}' timed out on {hook} for {path}")]
    TimedOut { plugin: String, hook: HookPoint, path: String },
}

impl PluginDispatchError {
    pub fn plugin(&self) -> &str {
        match self {
            Self::Failed { plugin, .. }
            | Self::Panicked { plugin, .. }
            | Self::TimedOut { plugin, .. } => plugin,
        }
    }
}

/// A plugin together with its configuration.
#[derive(Debug, Clone)]
pub struct PluginEntry {
    pub id: String,
    pub priority: f64,
    pub disabled: bool,
    pub plugin: Arc<dyn Plugin>,
}

impl PluginEntry {
    pub fn new(id: impl Into<String>, priority: f64, plugin: Arc<dyn Plugin>) -> Self {
        Self { id: id.into(), priority, disabled: false, plugin }
    }
}

/// Outcome of dispatching one event through the compiled order.
#[derive(Debug, Default)]
pub struct DispatchResult {
    /// Ids of plugins that ran to completion, in order.
    pub ran: Vec<String>,
    /// Set when a plugin vetoed further processing: (plugin id, reason).
    pub halted: Option<(String, String)>,
    pub errors: Vec<PluginDispatchError>,
}

impl DispatchResult {
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }
}

#[derive(Debug, Default)]
struct Entries {
    user: Vec<PluginEntry>,
    builtin: Vec<PluginEntry>,
}

/// Ordered collection of plugins.
#[derive(Debug, Default)]
pub struct PluginPipeline {
    entries: RwLock<Entries>,
    compiled: RwLock<Arc<Vec<PluginEntry>>>,
}

impl PluginPipeline {
    /// Create a pipeline whose built-in entries are always appended after
    /// user entries before sorting.
    pub fn new(builtin: Vec<PluginEntry>) -> Self {
        Self::with_plugins(Vec::new(), builtin)
    }

    /// Create a pipeline with user entries already registered.
    pub fn with_plugins(user: Vec<PluginEntry>, builtin: Vec<PluginEntry>) -> Self {
        let compiled = compile_entries(&user, &builtin);
        let order: Vec<&str> = compiled.iter().map(|e| e.id.as_str()).collect();
        debug!(order = ?order, "Plugin order compiled");
        Self {
            entries: RwLock::new(Entries { user, builtin }),
            compiled: RwLock::new(Arc::new(compiled)),
        }
    }

    /// Add a user plugin and recompile.
    pub async fn register(&self, entry: PluginEntry) {
        let mut entries = self.entries.write().await;
        info!(
            plugin = %entry.id,
            priority = entry.priority,
            disabled = entry.disabled,
            "Plugin registered"
        );
        entries.user.push(entry);
        self.recompile(&entries).await;
    }

    /// Enable or disable every entry with `id`. Returns false if none matched.
    pub async fn set_disabled(&self, id: &str, disabled: bool) -> bool {
        let mut entries = self.entries.write().await;
        let Entries { user, builtin } = &mut *entries;
        let mut found = false;
        for entry in user.iter_mut().chain(builtin.iter_mut()).filter(|e| e.id == id) {
            entry.disabled = disabled;
            found = true;
        }
        if found {
            self.recompile(&entries).await;
        }
        found
    }

    /// The current compiled order.
    pub async fn compile(&self) -> Arc<Vec<PluginEntry>> {
        Arc::clone(&*self.compiled.read().await)
    }

    /// Ids of the compiled order.
    pub async fn order(&self) -> Vec<String> {
        self.compile().await.iter().map(|entry| entry.id.clone()).collect()
    }

    /// Run `hook` through every subscribed plugin in compiled order.
    pub async fn dispatch(&self, hook: HookPoint, ctx: &mut PageContext) -> DispatchResult {
        let compiled = self.compile().await;
        let mut result = DispatchResult::default();

        for entry in compiled.iter().filter(|entry| entry.plugin.hooks().contains(&hook)) {
            let snapshot = ctx.snapshot();
            let call = AssertUnwindSafe(entry.plugin.handle(hook, ctx)).catch_unwind();
            let outcome = tokio::time::timeout(PLUGIN_TIMEOUT, call).await;

            match outcome {
                Ok(Ok(Ok(HookAction::Continue))) => {
                    result.ran.push(entry.id.clone());
                }
                Ok(Ok(Ok(HookAction::Halt { reason }))) => {
                    debug!(
                        plugin = %entry.id,
                        hook = %hook,
                        path = %ctx.page.path,
                        reason = %reason,
                        "Plugin halted pipeline"
                    );
                    result.ran.push(entry.id.clone());
                    result.halted = Some((entry.id.clone(), reason));
                    break;
                }
                Ok(Ok(Err(e))) => {
                    ctx.restore(snapshot);
                    let error = PluginDispatchError::Failed {
                        plugin: entry.id.clone(),
                        hook,
                        path: ctx.page.path.clone(),
                        reason: format!("{:#}", e),
                    };
                    warn!(error = %error, "Plugin dispatch failed");
                    result.errors.push(error);
                }
                Ok(Err(payload)) => {
                    ctx.restore(snapshot);
                    let error = PluginDispatchError::Panicked {
                        plugin: entry.id.clone(),
                        hook,
                        path: ctx.page.path.clone(),
                        message: panic_message(&*payload),
                    };
                    warn!(error = %error, "Plugin panicked");
                    result.errors.push(error);
                }
                Err(_) => {
                    ctx.restore(snapshot);
                    let error = PluginDispatchError::TimedOut {
                        plugin: entry.id.clone(),
                        hook,
                        path: ctx.page.path.clone(),
                    };
                    warn!(error = %error, "Plugin dispatch timed out");
                    result.errors.push(error);
                }
            }
        }

        result
    }

    async fn recompile(&self, entries: &Entries) {
        let compiled = compile_entries(&entries.user, &entries.builtin);
        let order: Vec<&str> = compiled.iter().map(|e| e.id.as_str()).collect();
        debug!(order = ?order, "Plugin order compiled");
        *self.compiled.write().await = Arc::new(compiled);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Stable descending sort by priority over `user ++ builtin`, skipping
/// disabled entries.
fn compile_entries(user: &[PluginEntry], builtin: &[PluginEntry]) -> Vec<PluginEntry> {
    let mut compiled: Vec<PluginEntry> =
        user.iter().chain(builtin.iter()).filter(|entry| !entry.disabled).cloned().collect();
    compiled.sort_by(|a, b| b.priority.total_cmp(&a.priority));
    compiled
}
