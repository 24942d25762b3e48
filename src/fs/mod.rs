pub mod error;
pub mod path;

pub use error::{FsError, FsResult};
pub use path::{extension, file_name, file_stem, normalize_path, normalize_prefix};
