//! Hook points, the plugin trait, and the per-page dispatch context.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::page::{Page, PageError, PageReader};

/// Lifecycle points a plugin can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// A page arrived from a source and is about to be written to its layer.
    AfterSource,
    /// A page was removed from a source's layer.
    AfterRemove,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AfterSource => write!(f, "after_source"),
            Self::AfterRemove => write!(f, "after_remove"),
        }
    }
}

/// What a plugin wants the pipeline to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// Continue with the next plugin. The page may or may not have been changed.
    Continue,
    /// Stop the pipeline; for `AfterSource` the page is not written.
    Halt { reason: String },
}

impl HookAction {
    pub fn halt(reason: impl Into<String>) -> Self {
        Self::Halt { reason: reason.into() }
    }
}

/// A transformation step in the pipeline.
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// The hook points this plugin handles. Others are never dispatched to it.
    fn hooks(&self) -> &[HookPoint];

    async fn handle(&self, hook: HookPoint, ctx: &mut PageContext) -> anyhow::Result<HookAction>;
}

/// Mutable state handed to each plugin for one page event.
#[derive(Debug)]
pub struct PageContext {
    pub source: String,
    pub page: Page,
    derived: Vec<Page>,
    reader: PageReader,
}

impl PageContext {
    pub fn new(source: impl Into<String>, page: Page, reader: PageReader) -> Self {
        Self { source: source.into(), page, derived: Vec::new(), reader }
    }

    /// Queue an extra page to be written next to the current one.
    pub fn derive(&mut self, page: Page) {
        self.derived.push(page);
    }

    pub fn derived(&self) -> &[Page] {
        &self.derived
    }

    pub fn into_parts(self) -> (Page, Vec<Page>) {
        (self.page, self.derived)
    }

    /// Read another page through the union view.
    pub async fn read_page(&self, path: &str) -> Result<Page, PageError> {
        self.reader.read_page(path).await
    }

    pub fn reader(&self) -> &PageReader {
        &self.reader
    }

    pub(crate) fn snapshot(&self) -> (Page, usize) {
        (self.page.clone(), self.derived.len())
    }

    pub(crate) fn restore(&mut self, snapshot: (Page, usize)) {
        let (page, derived) = snapshot;
        self.page = page;
        self.derived.truncate(derived);
    }
}
