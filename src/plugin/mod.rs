//! Plugin system for page events.
//!
//! This module provides:
//! - [`Plugin`], the trait every transformation step implements
//! - [`PluginPipeline`], the priority-ordered dispatcher
//! - the built-in plugins appended to every pipeline

mod builtin;
mod hooks;
mod pipeline;

pub use builtin::{
    ALIAS, AliasPlugin, CODEMOD, CodeModPlugin, REF, RefPlugin, TAG, TagPlugin, builtin_entries,
};
pub use hooks::{HookAction, HookPoint, PageContext, Plugin};
pub use pipeline::{DispatchResult, PluginDispatchError, PluginEntry, PluginPipeline};
