//! Content sources and their lifecycle.
//!
//! A [`ContentSource`] is the producer side: it pulls files from somewhere and
//! pushes them through a [`SourceSender`]. A [`Source`] wraps one producer,
//! owns its [`FileLayer`](crate::layer::FileLayer), runs the ingest task that
//! feeds batches through the plugin pipeline, and tracks lifecycle state.

mod folder;
mod handle;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use folder::FolderSource;
pub use handle::{RefreshOutcome, Source, SourceContext};

/// Opaque handle identifying one live source.
pub type SourceId = Uuid;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source '{name}' failed to start: {reason}")]
    Init { name: String, reason: String },

    #[error("Source '{0}' is disabled")]
    Disabled(String),

    #[error("Source '{name}' cannot {action} while {state}")]
    InvalidState { name: String, action: &'static str, state: SourceState },

    #[error("Source '{source_name}' has no workflow '{workflow}'")]
    WorkflowNotFound { source_name: String, workflow: String },

    #[error("Workflow '{workflow}' on source '{source_name}' failed: {reason}")]
    Workflow { source_name: String, workflow: String, reason: String },

    #[error("Source '{name}' refresh failed: {reason}")]
    Refresh { name: String, reason: String },

    #[error("Source '{name}' failed to stop: {reason}")]
    Stop { name: String, reason: String },
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Lifecycle state of a [`Source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Pending,
    Running,
    /// Running, but the last report from the producer was an error.
    Errored,
    Stopped,
    Exited,
}

impl SourceState {
    /// Running or errored; refreshes and batches are accepted.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Errored)
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Errored => write!(f, "errored"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Lifecycle notifications published by a [`Source`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A non-fatal error reported by the producer.
    Error { source_id: SourceId, name: String, message: String },
    /// The source terminated. No further events follow.
    Exit { source_id: SourceId, name: String, reason: Option<String> },
}

impl SourceEvent {
    pub fn source_id(&self) -> SourceId {
        match self {
            Self::Error { source_id, .. } | Self::Exit { source_id, .. } => *source_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Error { name, .. } | Self::Exit { name, .. } => name,
        }
    }
}

/// One raw file produced by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub data: Vec<u8>,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self { path: path.into(), data: data.into() }
    }
}

/// Messages a producer sends to its wrapper. Processed strictly in order.
#[derive(Debug)]
pub enum SourceMessage {
    Files(Vec<SourceFile>),
    Removed(Vec<String>),
    Error(String),
    Exit(Option<String>),
}

/// Sending half handed to a [`ContentSource`].
#[derive(Debug, Clone)]
pub struct SourceSender {
    tx: mpsc::Sender<SourceMessage>,
}

impl SourceSender {
    pub(crate) fn new(tx: mpsc::Sender<SourceMessage>) -> Self {
        Self { tx }
    }

    /// Push a batch of files. Fails once the source has shut down.
    pub async fn files(&self, files: Vec<SourceFile>) -> anyhow::Result<()> {
        self.send(SourceMessage::Files(files)).await
    }

    pub async fn removed(&self, paths: Vec<String>) -> anyhow::Result<()> {
        self.send(SourceMessage::Removed(paths)).await
    }

    /// Report a non-fatal error. The source keeps running.
    pub async fn error(&self, message: impl Into<String>) -> anyhow::Result<()> {
        self.send(SourceMessage::Error(message.into())).await
    }

    /// Terminate the source. Its layer is detached from the union view.
    pub async fn exit(&self, reason: Option<String>) -> anyhow::Result<()> {
        self.send(SourceMessage::Exit(reason)).await
    }

    async fn send(&self, message: SourceMessage) -> anyhow::Result<()> {
        self.tx.send(message).await.map_err(|_| anyhow::anyhow!("source channel closed"))
    }
}

/// An external content producer.
#[async_trait]
pub trait ContentSource: Send + Sync + fmt::Debug {
    /// Begin producing. Initial files may be pushed before returning; an
    /// error here aborts the source before its layer is mounted.
    async fn start(&self, tx: SourceSender) -> anyhow::Result<()>;

    /// Re-pull content.
    async fn refresh(&self, _tx: &SourceSender) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Names of the workflows this source can run.
    fn workflows(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run a named workflow. Only called for names listed by [`workflows`].
    ///
    /// [`workflows`]: ContentSource::workflows
    async fn run_workflow(
        &self,
        name: &str,
        _path: &str,
        _data: Value,
        _tx: &SourceSender,
    ) -> anyhow::Result<()> {
        anyhow::bail!("workflow '{}' is not implemented", name)
    }
}
