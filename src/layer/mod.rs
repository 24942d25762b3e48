//! Layer module for the aggregated filesystem.
//!
//! This module provides:
//! - [`FileLayer`], the private in-memory tree owned by one source
//! - [`UnionView`], the first-match-wins composite over all live layers

mod file_layer;
mod union_view;

pub use file_layer::{ChangeKind, FileChange, FileLayer, FileMeta, LayerId};
pub use union_view::{DirectoryEntry, FileState, UnionView};
