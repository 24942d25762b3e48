//! Static lookup from module identifiers to factories.
//!
//! Configuration names plugins, serialisers and sources by a stable id; the
//! registry turns those ids into instances. Unknown ids are a startup error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::plugin::{
    ALIAS, AliasPlugin, CODEMOD, CodeModPlugin, Plugin, REF, RefPlugin, TAG, TagPlugin,
};
use crate::serialiser::{FrontmatterSerialiser, JsonSerialiser, Serialiser};
use crate::source::{ContentSource, FolderSource};

pub type PluginFactory = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync>;
pub type SerialiserFactory =
    Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn Serialiser>> + Send + Sync>;
/// Called with the source's configured name and options.
pub type SourceFactory =
    Arc<dyn Fn(&str, &Value) -> anyhow::Result<Arc<dyn ContentSource>> + Send + Sync>;

/// Module family, used in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Plugin,
    Serialiser,
    Source,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin => write!(f, "plugin"),
            Self::Serialiser => write!(f, "serialiser"),
            Self::Source => write!(f, "source"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown {kind} module '{id}'")]
    UnknownModule { kind: ModuleKind, id: String },

    #[error("Failed to build {kind} module '{id}': {reason}")]
    Factory { kind: ModuleKind, id: String, reason: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Clone, Default)]
pub struct ModuleRegistry {
    plugins: HashMap<String, PluginFactory>,
    serialisers: HashMap<String, SerialiserFactory>,
    sources: HashMap<String, SourceFactory>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every module shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_plugin(CODEMOD, |_| Ok(Arc::new(CodeModPlugin)));
        registry.register_plugin(TAG, |_| Ok(Arc::new(TagPlugin)));
        registry.register_plugin(ALIAS, |_| Ok(Arc::new(AliasPlugin)));
        registry.register_plugin(REF, |_| Ok(Arc::new(RefPlugin)));
        registry.register_serialiser("json", |_| Ok(Arc::new(JsonSerialiser)));
        registry.register_serialiser("frontmatter", |_| Ok(Arc::new(FrontmatterSerialiser)));
        registry.register_source("folder", |_, options| {
            Ok(Arc::new(FolderSource::from_options(options)?))
        });
        registry
    }

    pub fn register_plugin<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.plugins.insert(id.into(), Arc::new(factory));
    }

    pub fn register_serialiser<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn Serialiser>> + Send + Sync + 'static,
    {
        self.serialisers.insert(id.into(), Arc::new(factory));
    }

    pub fn register_source<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&str, &Value) -> anyhow::Result<Arc<dyn ContentSource>> + Send + Sync + 'static,
    {
        self.sources.insert(id.into(), Arc::new(factory));
    }

    pub fn plugin(&self, id: &str, options: &Value) -> RegistryResult<Arc<dyn Plugin>> {
        let factory = lookup(&self.plugins, ModuleKind::Plugin, id)?;
        factory(options).map_err(|e| factory_error(ModuleKind::Plugin, id, e))
    }

    pub fn serialiser(&self, id: &str, options: &Value) -> RegistryResult<Arc<dyn Serialiser>> {
        let factory = lookup(&self.serialisers, ModuleKind::Serialiser, id)?;
        factory(options).map_err(|e| factory_error(ModuleKind::Serialiser, id, e))
    }

    pub fn source(
        &self,
        id: &str,
        name: &str,
        options: &Value,
    ) -> RegistryResult<Arc<dyn ContentSource>> {
        let factory = lookup(&self.sources, ModuleKind::Source, id)?;
        factory(name, options).map_err(|e| factory_error(ModuleKind::Source, id, e))
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut plugins: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        let mut serialisers: Vec<&str> = self.serialisers.keys().map(String::as_str).collect();
        let mut sources: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        plugins.sort_unstable();
        serialisers.sort_unstable();
        sources.sort_unstable();
        f.debug_struct("ModuleRegistry")
            .field("plugins", &plugins)
            .field("serialisers", &serialisers)
            .field("sources", &sources)
            .finish()
    }
}

fn lookup<'a, T>(
    map: &'a HashMap<String, T>,
    kind: ModuleKind,
    id: &str,
) -> RegistryResult<&'a T> {
    map.get(id).ok_or_else(|| RegistryError::UnknownModule { kind, id: id.to_string() })
}

fn factory_error(kind: ModuleKind, id: &str, e: anyhow::Error) -> RegistryError {
    RegistryError::Factory { kind, id: id.to_string(), reason: format!("{:#}", e) }
}
