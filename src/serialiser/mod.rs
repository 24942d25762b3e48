//! Serialisers convert raw layer bytes to and from [`Page`]s.
//!
//! Every page path must be matched by exactly one serialiser filter. Overlap
//! is reported as [`SerialiserError::Conflict`] instead of guessing.

mod frontmatter;
mod json;

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::page::Page;

pub use frontmatter::FrontmatterSerialiser;
pub use json::JsonSerialiser;

/// Filter of the serialiser that is always registered.
pub const JSON_FILTER: &str = r"\.json$";

#[derive(Error, Debug)]
pub enum SerialiserError {
    #[error("No serialiser matches {0}")]
    NoMatch(String),

    #[error("Serialisers {matches:?} all match {path}")]
    Conflict { path: String, matches: Vec<String> },

    #[error("Invalid serialiser filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("Failed to encode {path}: {reason}")]
    Encode { path: String, reason: String },
}

pub type SerialiserResult<T> = Result<T, SerialiserError>;

/// A codec between file bytes and pages.
pub trait Serialiser: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn decode(&self, path: &str, data: &[u8]) -> SerialiserResult<Page>;

    fn encode(&self, page: &Page) -> SerialiserResult<Vec<u8>>;
}

#[derive(Debug)]
struct Entry {
    filter: Regex,
    serialiser: Arc<dyn Serialiser>,
}

/// The set of configured serialisers, each guarded by a path filter.
#[derive(Debug, Default)]
pub struct SerialiserSet {
    entries: Vec<Entry>,
}

impl SerialiserSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        filter: &str,
        serialiser: Arc<dyn Serialiser>,
    ) -> SerialiserResult<()> {
        let filter = Regex::new(filter).map_err(|source| SerialiserError::InvalidFilter {
            filter: filter.to_string(),
            source,
        })?;
        self.entries.push(Entry { filter, serialiser });
        Ok(())
    }

    /// The single serialiser whose filter matches `path`.
    pub fn resolve(&self, path: &str) -> SerialiserResult<Arc<dyn Serialiser>> {
        let mut matches = self.entries.iter().filter(|entry| entry.filter.is_match(path));
        let first = matches.next().ok_or_else(|| SerialiserError::NoMatch(path.to_string()))?;

        let rest: Vec<&Entry> = matches.collect();
        if !rest.is_empty() {
            let mut names = vec![first.serialiser.name().to_string()];
            names.extend(rest.iter().map(|entry| entry.serialiser.name().to_string()));
            return Err(SerialiserError::Conflict { path: path.to_string(), matches: names });
        }

        Ok(Arc::clone(&first.serialiser))
    }

    pub fn decode(&self, path: &str, data: &[u8]) -> SerialiserResult<Page> {
        self.resolve(path)?.decode(path, data)
    }

    pub fn encode(&self, page: &Page) -> SerialiserResult<Vec<u8>> {
        self.resolve(&page.path)?.encode(page)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> SerialiserSet {
        let mut set = SerialiserSet::new();
        set.register(JSON_FILTER, Arc::new(JsonSerialiser)).unwrap();
        set.register(r"\.mdx?$", Arc::new(FrontmatterSerialiser)).unwrap();
        set
    }

    #[test]
    fn test_resolve_by_filter() {
        let set = set();
        assert_eq!(set.resolve("/a.json").unwrap().name(), "json");
        assert_eq!(set.resolve("/a.mdx").unwrap().name(), "frontmatter");
        assert_eq!(set.resolve("/a.md").unwrap().name(), "frontmatter");
    }

    #[test]
    fn test_no_match() {
        let err = set().resolve("/a.png").unwrap_err();
        assert!(matches!(err, SerialiserError::NoMatch(path) if path == "/a.png"));
    }

    #[test]
    fn test_overlap_is_conflict() {
        let mut set = set();
        set.register(r"\.(json|yaml)$", Arc::new(JsonSerialiser)).unwrap();
        match set.resolve("/data.json") {
            Err(SerialiserError::Conflict { matches, .. }) => assert_eq!(matches.len(), 2),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(set.resolve("/data.yaml").is_ok());
    }

    #[test]
    fn test_invalid_filter() {
        let mut set = SerialiserSet::new();
        assert!(matches!(
            set.register("(", Arc::new(JsonSerialiser)),
            Err(SerialiserError::InvalidFilter { .. })
        ));
    }
}
