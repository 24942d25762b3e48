//! Docweave aggregates pages from independent content sources into one
//! union filesystem and runs every page through a priority-ordered plugin
//! pipeline on its way in.

pub mod config;
pub mod fs;
pub mod layer;
pub mod manager;
pub mod metrics;
pub mod page;
pub mod plugin;
pub mod registry;
pub mod scheduler;
pub mod serialiser;
pub mod source;

pub use config::{Config, ConfigValidationError};
pub use manager::{ManagerError, ManagerResult, SourceManager, SourceUpdate, Subscription};
pub use registry::ModuleRegistry;
