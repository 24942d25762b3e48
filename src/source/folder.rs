use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ContentSource, SourceFile, SourceSender};
use crate::fs::path::normalize_path;

const WRITE_WORKFLOW: &str = "write";

#[derive(Debug, Deserialize)]
struct FolderOptions {
    path: PathBuf,
}

/// Serves the files of a local directory. Refresh re-reads the tree and
/// pushes only what changed since the last pull.
#[derive(Debug)]
pub struct FolderSource {
    root: PathBuf,
    /// Virtual path to blake3 digest of the last pushed content.
    seen: Mutex<HashMap<String, blake3::Hash>>,
}

impl FolderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), seen: Mutex::new(HashMap::new()) }
    }

    /// Build from `{ "path": "<dir>" }` options.
    pub fn from_options(options: &Value) -> anyhow::Result<Self> {
        let options = FolderOptions::deserialize(options)
            .context("folder source expects a `path` option")?;
        Ok(Self::new(options.path))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn pull(&self, tx: &SourceSender) -> anyhow::Result<()> {
        let files = read_tree(&self.root).await?;
        let mut seen = self.seen.lock().await;

        let mut changed = Vec::new();
        let mut current = HashMap::with_capacity(files.len());
        for file in files {
            let hash = blake3::hash(&file.data);
            if seen.get(&file.path) != Some(&hash) {
                changed.push(file.clone());
            }
            current.insert(file.path, hash);
        }
        let mut removed: Vec<String> =
            seen.keys().filter(|path| !current.contains_key(*path)).cloned().collect();
        removed.sort();

        debug!(
            root = %self.root.display(),
            changed = changed.len(),
            removed = removed.len(),
            "Folder pulled"
        );
        if !removed.is_empty() {
            tx.removed(removed).await?;
        }
        if !changed.is_empty() {
            tx.files(changed).await?;
        }
        *seen = current;
        Ok(())
    }
}

#[async_trait]
impl ContentSource for FolderSource {
    async fn start(&self, tx: SourceSender) -> anyhow::Result<()> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .with_context(|| format!("cannot open {}", self.root.display()))?;
        if !metadata.is_dir() {
            anyhow::bail!("{} is not a directory", self.root.display());
        }
        self.pull(&tx).await
    }

    async fn refresh(&self, tx: &SourceSender) -> anyhow::Result<()> {
        self.pull(tx).await
    }

    fn workflows(&self) -> Vec<String> {
        vec![WRITE_WORKFLOW.to_string()]
    }

    /// `write` stores `data` (a string) at `path` inside the folder and pushes it.
    async fn run_workflow(
        &self,
        name: &str,
        path: &str,
        data: Value,
        tx: &SourceSender,
    ) -> anyhow::Result<()> {
        if name != WRITE_WORKFLOW {
            anyhow::bail!("unknown workflow '{}'", name);
        }
        let Value::String(content) = data else {
            anyhow::bail!("write expects string data");
        };

        let virtual_path = normalize_path(path)?;
        let target = self.root.join(virtual_path.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content.as_bytes())
            .await
            .with_context(|| format!("cannot write {}", target.display()))?;

        self.seen.lock().await.insert(virtual_path.clone(), blake3::hash(content.as_bytes()));
        tx.files(vec![SourceFile::new(virtual_path, content)]).await
    }
}

/// Every regular file under `root`, keyed by its `/`-rooted relative path.
async fn read_tree(root: &Path) -> anyhow::Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("cannot read {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path.strip_prefix(root)?;
                let segments: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                let data = tokio::fs::read(&path).await?;
                files.push(SourceFile::new(format!("/{}", segments.join("/")), data));
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
