//! Page model and page-path rules.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::fs::FsError;
use crate::fs::path::{extension, file_name, normalize_path};
use crate::layer::UnionView;
use crate::serialiser::{SerialiserError, SerialiserSet};

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Not a page: {0}")]
    NotAPage(String),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Serialiser(#[from] SerialiserError),
}

/// The decoded form of a page file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub path: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub content: String,
}

impl Page {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// String value of a meta key, if present and a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }
}

/// Decides which paths are treated as pages.
#[derive(Debug, Clone)]
pub struct PageRules {
    extensions: Vec<String>,
    ignore: HashSet<String>,
}

impl PageRules {
    pub fn new(extensions: &[String], ignore: &[String]) -> Self {
        Self {
            extensions: extensions.iter().map(|ext| ext.to_ascii_lowercase()).collect(),
            ignore: ignore.iter().cloned().collect(),
        }
    }

    /// True if `path` has a page extension and its file name is not ignored.
    pub fn is_page(&self, path: &str) -> bool {
        if self.is_ignored(path) {
            return false;
        }
        extension(path)
            .map(|ext| self.extensions.iter().any(|page_ext| page_ext.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignore.contains(file_name(path))
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }
}

/// Decodes pages straight out of the union view.
#[derive(Debug, Clone)]
pub struct PageReader {
    filesystem: Arc<UnionView>,
    serialisers: Arc<SerialiserSet>,
    rules: Arc<PageRules>,
}

impl PageReader {
    pub fn new(
        filesystem: Arc<UnionView>,
        serialisers: Arc<SerialiserSet>,
        rules: Arc<PageRules>,
    ) -> Self {
        Self { filesystem, serialisers, rules }
    }

    /// Read and decode a page. Ignored and non-page paths are rejected even
    /// though they stay readable as raw files.
    pub async fn read_page(&self, path: &str) -> Result<Page, PageError> {
        let path = normalize_path(path)?;
        if !self.rules.is_page(&path) {
            return Err(PageError::NotAPage(path));
        }
        let data = self.filesystem.read(&path).await?;
        Ok(self.serialisers.decode(&path, &data)?)
    }

    pub fn filesystem(&self) -> &Arc<UnionView> {
        &self.filesystem
    }

    pub fn serialisers(&self) -> &Arc<SerialiserSet> {
        &self.serialisers
    }

    pub fn rules(&self) -> &Arc<PageRules> {
        &self.rules
    }
}
