//! In-memory file layer.
//!
//! Each source owns exactly one [`FileLayer`]. Every mutation is published on
//! the layer's watch channel while the write lock is still held, so watchers
//! observe changes in the same order they were applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::trace;
use uuid::Uuid;

use crate::fs::path::{is_within, normalize_path, normalize_prefix};
use crate::fs::{FsError, FsResult};

pub type LayerId = Uuid;

const WATCH_CAPACITY: usize = 1024;

/// Kind of change applied to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

/// A single change event emitted by a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub layer_id: LayerId,
    pub path: String,
    pub kind: ChangeKind,
}

/// Metadata kept alongside each file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMeta {
    pub size: u64,
    /// blake3 digest of the content, hex encoded.
    pub hash: String,
    pub modified: DateTime<Utc>,
}

impl FileMeta {
    fn for_content(data: &[u8]) -> Self {
        Self {
            size: data.len() as u64,
            hash: blake3::hash(data).to_hex().to_string(),
            modified: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct FileEntry {
    data: Arc<Vec<u8>>,
    meta: FileMeta,
}

/// A mutable in-memory file tree.
#[derive(Debug)]
pub struct FileLayer {
    id: LayerId,
    label: String,
    files: RwLock<BTreeMap<String, FileEntry>>,
    events: broadcast::Sender<FileChange>,
}

impl FileLayer {
    /// Create an empty layer. `label` is only used in logs.
    pub fn new(label: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            files: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write a file, creating or replacing it.
    pub async fn write(&self, path: &str, data: impl Into<Vec<u8>>) -> FsResult<ChangeKind> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(FsError::InvalidPath("Cannot write to root".to_string()));
        }

        let data = data.into();
        let meta = FileMeta::for_content(&data);
        let mut files = self.files.write().await;
        let kind = match files.insert(path.clone(), FileEntry { data: Arc::new(data), meta }) {
            Some(_) => ChangeKind::Changed,
            None => ChangeKind::Added,
        };

        trace!(layer = %self.label, path = %path, kind = ?kind, "Layer write");
        self.publish(path, kind);
        Ok(kind)
    }

    /// Read a file's content.
    pub async fn read(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = normalize_path(path)?;
        let files = self.files.read().await;
        files.get(&path).map(|entry| entry.data.as_ref().clone()).ok_or(FsError::NotFound(path))
    }

    /// Read a file's metadata.
    pub async fn stat(&self, path: &str) -> FsResult<FileMeta> {
        let path = normalize_path(path)?;
        let files = self.files.read().await;
        files.get(&path).map(|entry| entry.meta.clone()).ok_or(FsError::NotFound(path))
    }

    pub async fn contains(&self, path: &str) -> bool {
        match normalize_path(path) {
            Ok(path) => self.files.read().await.contains_key(&path),
            Err(_) => false,
        }
    }

    /// Remove a file. Removing a missing path is `NotFound` and emits nothing.
    pub async fn remove(&self, path: &str) -> FsResult<()> {
        let path = normalize_path(path)?;
        let mut files = self.files.write().await;
        if files.remove(&path).is_none() {
            return Err(FsError::NotFound(path));
        }

        trace!(layer = %self.label, path = %path, "Layer remove");
        self.publish(path, ChangeKind::Removed);
        Ok(())
    }

    /// List every file path under `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> FsResult<Vec<String>> {
        let prefix = normalize_prefix(prefix)?;
        let files = self.files.read().await;
        Ok(files.keys().filter(|path| is_within(path, &prefix)).cloned().collect())
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }

    /// Subscribe to changes made after this call.
    ///
    /// A receiver that falls more than the channel capacity behind gets
    /// `RecvError::Lagged` and should re-list the layer.
    pub fn watch(&self) -> broadcast::Receiver<FileChange> {
        self.events.subscribe()
    }

    fn publish(&self, path: String, kind: ChangeKind) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(FileChange { layer_id: self.id, path, kind });
    }
}
