//! Path utilities for MPQ archives
//!
//! MPQ archives use backslashes (`\`) as path separators internally,
//! regardless of the host operating system, and paths are plain ASCII byte
//! strings capped at 259 bytes. This module normalizes incoming paths,
//! validates them for storage, and extracts the basename component used for
//! per-file encryption keys.

use crate::{Error, Result};

/// Maximum length in bytes of an MPQ file path, including room for a NUL
pub const MAX_PATH: usize = 260;

/// Normalize a path for storage in an MPQ archive
///
/// Converts forward slashes to backslashes to match MPQ format requirements.
///
/// # Examples
///
/// ```
/// use mpq_archive::path::normalize_mpq_path;
///
/// assert_eq!(normalize_mpq_path("dir/file.txt"), "dir\\file.txt");
/// assert_eq!(normalize_mpq_path("dir\\file.txt"), "dir\\file.txt");
/// ```
pub fn normalize_mpq_path(path: &str) -> String {
    path.replace('/', "\\")
}

/// Validate a path for storage and return its normalized form
///
/// Rejects paths longer than 259 bytes and paths containing non-ASCII bytes,
/// which the on-disk hash cannot represent portably.
pub fn validate_mpq_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(Error::FilenameRequired);
    }
    if !path.is_ascii() {
        return Err(Error::FilenameNotAscii(path.to_string()));
    }
    if path.len() >= MAX_PATH {
        return Err(Error::FilenameTooLong(path.len()));
    }
    Ok(normalize_mpq_path(path))
}

/// Return the last backslash-delimited component of an MPQ path
///
/// Per-file encryption keys hash the basename only, so that a file can move
/// between directories without re-encryption.
pub fn mpq_basename(path: &str) -> &str {
    match path.rfind('\\') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mpq_path() {
        assert_eq!(normalize_mpq_path("path/to/file.txt"), "path\\to\\file.txt");
        assert_eq!(
            normalize_mpq_path("path\\to\\file.txt"),
            "path\\to\\file.txt"
        );
        assert_eq!(
            normalize_mpq_path("path/to\\file.txt"),
            "path\\to\\file.txt"
        );
        assert_eq!(normalize_mpq_path("file.txt"), "file.txt");
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        assert!(matches!(
            validate_mpq_path(""),
            Err(Error::FilenameRequired)
        ));
        assert!(matches!(
            validate_mpq_path("héllo.txt"),
            Err(Error::FilenameNotAscii(_))
        ));

        let long = "a".repeat(MAX_PATH);
        assert!(matches!(
            validate_mpq_path(&long),
            Err(Error::FilenameTooLong(_))
        ));

        // 259 bytes is still representable
        let edge = "a".repeat(MAX_PATH - 1);
        assert!(validate_mpq_path(&edge).is_ok());
    }

    #[test]
    fn test_mpq_basename() {
        assert_eq!(mpq_basename("war3map.j"), "war3map.j");
        assert_eq!(mpq_basename("units\\human\\footman.mdx"), "footman.mdx");
        assert_eq!(mpq_basename("dir\\"), "");
    }
}
