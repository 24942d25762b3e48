use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

/// Errors of the layer and union view file operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("No layer holds {0}")]
    NotFound(String),

    #[error("Invalid virtual path '{0}'")]
    InvalidPath(String),

    #[error("Virtual path is {0} bytes, limit is 4096")]
    PathTooLong(usize),

    #[error("Path segment is {0} bytes, limit is 255")]
    FilenameTooLong(usize),
}

impl FsError {
    /// Returns true for lookups that simply found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}
