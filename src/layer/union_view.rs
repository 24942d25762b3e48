//! Union view module.
//!
//! Provides a unified view of files across the layers of every live source,
//! implementing first-match-wins union semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::debug;

use crate::fs::path::{normalize_path, normalize_prefix};
use crate::fs::{FsError, FsResult};
use crate::layer::file_layer::{FileLayer, FileMeta, LayerId};

/// Represents the state of a path in the union view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    /// File exists, served by the given layer.
    Exists { layer_id: LayerId, meta: FileMeta },
    /// File does not exist in any layer.
    NotFound,
}

impl FileState {
    /// Returns true if the file exists.
    pub fn exists(&self) -> bool {
        matches!(self, FileState::Exists { .. })
    }

    /// Returns the layer that serves the file.
    pub fn layer_id(&self) -> Option<LayerId> {
        match self {
            FileState::Exists { layer_id, .. } => Some(*layer_id),
            FileState::NotFound => None,
        }
    }
}

/// A directory entry in the union view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub is_dir: bool,
    /// Layer serving the entry; for directories the first layer containing it.
    pub layer_id: LayerId,
}

/// A registered layer and its precedence rank. Lower ranks are consulted
/// first.
#[derive(Debug, Clone)]
struct Ranked {
    rank: u64,
    layer: Weak<FileLayer>,
}

type LayerList = Arc<Vec<Ranked>>;

/// Union view provides a merged, read-only view over registered layers.
///
/// The layer list is replaced wholesale on every add/remove. Readers clone
/// the current `Arc` and iterate that snapshot, so a concurrent removal never
/// tears a read in progress.
#[derive(Debug, Default)]
pub struct UnionView {
    layers: RwLock<LayerList>,
}

impl UnionView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer after every existing one. Returns false if it is
    /// already registered.
    pub async fn add_layer(&self, layer: &Arc<FileLayer>) -> bool {
        self.insert_layer(layer, None).await
    }

    /// Register a layer after every layer of rank `rank` or lower and before
    /// any of a higher rank. Returns false if it is already registered.
    pub async fn add_layer_ranked(&self, layer: &Arc<FileLayer>, rank: u64) -> bool {
        self.insert_layer(layer, Some(rank)).await
    }

    async fn insert_layer(&self, layer: &Arc<FileLayer>, rank: Option<u64>) -> bool {
        let mut layers = self.layers.write().await;
        if layers.iter().any(|entry| entry.layer.as_ptr() == Arc::as_ptr(layer)) {
            return false;
        }

        let mut next: Vec<Ranked> =
            layers.iter().filter(|entry| entry.layer.strong_count() > 0).cloned().collect();
        let last = next.last().map_or(0, |entry| entry.rank);
        let rank = rank.unwrap_or(last);
        let at = next.partition_point(|entry| entry.rank <= rank);
        next.insert(at, Ranked { rank, layer: Arc::downgrade(layer) });
        *layers = Arc::new(next);

        debug!(
            layer = %layer.label(),
            layer_id = %layer.id(),
            rank,
            position = at,
            count = layers.len(),
            "Layer added to union"
        );
        true
    }

    /// Deregister a layer. Returns false if it was not registered.
    pub async fn remove_layer(&self, layer_id: LayerId) -> bool {
        let mut layers = self.layers.write().await;
        let before = layers.len();
        let holds = |entry: &Ranked, id: LayerId| {
            entry.layer.upgrade().is_some_and(|layer| layer.id() == id)
        };
        let removed = layers.iter().any(|entry| holds(entry, layer_id));
        let next: Vec<Ranked> = layers
            .iter()
            .filter(|entry| entry.layer.strong_count() > 0 && !holds(entry, layer_id))
            .cloned()
            .collect();
        *layers = Arc::new(next);

        if removed {
            debug!(layer_id = %layer_id, before, after = layers.len(), "Layer removed from union");
        }
        removed
    }

    /// Number of live registered layers.
    pub async fn layer_count(&self) -> usize {
        self.snapshot().await.len()
    }

    /// Registered layer ids in precedence order.
    pub async fn layer_ids(&self) -> Vec<LayerId> {
        self.snapshot().await.iter().map(|layer| layer.id()).collect()
    }

    /// Read a file from the first layer that has it.
    pub async fn read(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = normalize_path(path)?;
        for layer in self.snapshot().await {
            match layer.read(&path).await {
                Ok(data) => return Ok(data),
                Err(FsError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FsError::NotFound(path))
    }

    /// Lookup a path, reporting which layer serves it.
    pub async fn lookup_file(&self, path: &str) -> FsResult<FileState> {
        let path = normalize_path(path)?;
        for layer in self.snapshot().await {
            match layer.stat(&path).await {
                Ok(meta) => return Ok(FileState::Exists { layer_id: layer.id(), meta }),
                Err(FsError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(FileState::NotFound)
    }

    /// Metadata of the file that would be returned by [`UnionView::read`].
    pub async fn stat(&self, path: &str) -> FsResult<FileMeta> {
        match self.lookup_file(path).await? {
            FileState::Exists { meta, .. } => Ok(meta),
            FileState::NotFound => Err(FsError::NotFound(normalize_path(path)?)),
        }
    }

    /// Check if the file exists in the union view.
    pub async fn file_exists(&self, path: &str) -> bool {
        self.lookup_file(path).await.map(|state| state.exists()).unwrap_or(false)
    }

    /// List every path under `prefix` across all layers, each path once.
    pub async fn list(&self, prefix: &str) -> FsResult<Vec<String>> {
        let mut seen = BTreeSet::new();
        for layer in self.snapshot().await {
            seen.extend(layer.list(prefix).await?);
        }
        Ok(seen.into_iter().collect())
    }

    /// List the immediate children of a directory across all layers.
    ///
    /// A name present in several layers is attributed to the earliest one.
    pub async fn list_directory(&self, dir_path: &str) -> FsResult<Vec<DirectoryEntry>> {
        let prefix = normalize_prefix(dir_path)?;
        let mut result_map: BTreeMap<String, DirectoryEntry> = BTreeMap::new();

        for layer in self.snapshot().await {
            for path in layer.list(&prefix).await? {
                let Some(rest) = path.strip_prefix(prefix.as_str()) else {
                    continue;
                };
                let (name, is_dir) = match rest.find('/') {
                    Some(pos) => (&rest[..pos], true),
                    None => (rest, false),
                };
                result_map.entry(name.to_string()).or_insert_with(|| DirectoryEntry {
                    name: name.to_string(),
                    is_dir,
                    layer_id: layer.id(),
                });
            }
        }

        Ok(result_map.into_values().collect())
    }

    async fn snapshot(&self) -> Vec<Arc<FileLayer>> {
        let layers = Arc::clone(&*self.layers.read().await);
        layers.iter().filter_map(|entry| entry.layer.upgrade()).collect()
    }
}
