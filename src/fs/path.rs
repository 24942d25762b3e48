use crate::fs::error::{FsError, FsResult};

const MAX_PATH_LENGTH: usize = 4096;
const MAX_FILENAME_LENGTH: usize = 255;

/// Normalise a virtual path to `/a/b/c` form.
///
/// A missing leading slash is added, repeated and trailing slashes are
/// collapsed, and `.` segments are dropped. `..` is rejected: layers are flat
/// keyed maps and a path never escapes the root.
pub fn normalize_path(path: &str) -> FsResult<String> {
    if path.is_empty() {
        return Err(FsError::InvalidPath("Empty path".to_string()));
    }

    if path.contains('\0') {
        return Err(FsError::InvalidPath("Path contains NULL character".to_string()));
    }

    if path.len() > MAX_PATH_LENGTH {
        return Err(FsError::PathTooLong(path.len()));
    }

    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(FsError::InvalidPath(format!("Parent segment in {}", path))),
            _ if part.len() > MAX_FILENAME_LENGTH => {
                return Err(FsError::FilenameTooLong(part.len()));
            }
            _ => parts.push(part),
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Normalise a listing prefix. Unlike [`normalize_path`] the root is allowed
/// and the result always ends with `/` so `/docs` does not match `/docs-old`.
pub fn normalize_prefix(prefix: &str) -> FsResult<String> {
    if prefix.is_empty() || prefix == "/" {
        return Ok("/".to_string());
    }

    let normalized = normalize_path(prefix)?;
    if normalized == "/" { Ok(normalized) } else { Ok(format!("{}/", normalized)) }
}

/// Returns true if `path` lives under the normalised `prefix`.
pub fn is_within(path: &str, prefix: &str) -> bool {
    prefix == "/" || path.starts_with(prefix) || format!("{}/", path) == prefix
}

/// Final segment of a normalised path.
pub fn file_name(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Extension of the final segment including the dot, e.g. `.mdx`.
pub fn extension(path: &str) -> Option<&str> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(pos) => Some(&name[pos..]),
    }
}

/// File name without its extension.
pub fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    match extension(path) {
        Some(ext) => &name[..name.len() - ext.len()],
        None => name,
    }
}
