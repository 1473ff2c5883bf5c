//! Validates that a wire-supplied name or destination field cannot escape
//! the receiver's output directory.
//!
//! Inspects `std::path::Component`s: a path is safe only if every component
//! is a plain `Normal` segment. `ParentDir` (`..`), `RootDir`/`Prefix`
//! (absolute paths), and `CurDir` (`.`, which is harmless but never
//! produced by a well-behaved sender) are all rejected so the validator
//! never has to reason about how components combine.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
#[error("unsafe path: {0:?}")]
pub struct UnsafePathError(pub String);

/// Validate `raw` is a safe relative path and join it onto `base`.
/// Rejects empty strings, NUL bytes, absolute paths, and any `..`/`.`
/// component, without touching the filesystem.
pub fn safe_join(base: &Path, raw: &str) -> Result<PathBuf, UnsafePathError> {
    if raw.is_empty() || raw.contains('\0') {
        return Err(UnsafePathError(raw.to_string()));
    }
    let candidate = Path::new(raw);
    let mut joined = base.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UnsafePathError(raw.to_string()));
            }
            Component::CurDir => {
                return Err(UnsafePathError(raw.to_string()));
            }
        }
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_plain_relative_name() {
        let base = Path::new("/out");
        let joined = safe_join(base, "frame_cam01_000000001.jpg").unwrap();
        assert_eq!(joined, Path::new("/out/frame_cam01_000000001.jpg"));
    }

    #[test]
    fn accepts_nested_relative_structure() {
        let base = Path::new("/out");
        let joined = safe_join(base, "cam01/frame_000000001.jpg").unwrap();
        assert_eq!(joined, Path::new("/out/cam01/frame_000000001.jpg"));
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        let base = Path::new("/out");
        assert!(safe_join(base, "../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_absolute_paths() {
        let base = Path::new("/out");
        assert!(safe_join(base, "/etc/passwd").is_err());
    }

    #[test]
    fn rejects_embedded_parent_dir() {
        let base = Path::new("/out");
        assert!(safe_join(base, "cam01/../../escape").is_err());
    }

    #[test]
    fn rejects_empty_and_nul() {
        let base = Path::new("/out");
        assert!(safe_join(base, "").is_err());
        assert!(safe_join(base, "bad\0name").is_err());
    }
}
