//! Validation for file names and archive paths
//!
//! File names are arbitrary UTF-8 strings of 1 to 255 bytes. Archive paths
//! are canonicalized before they are used as registry keys so that two
//! spellings of the same file map to one open archive.

use crate::core::error::{PackError, Result};
use crate::core::record::MAX_NAME_LENGTH;
use std::path::{Component, Path, PathBuf};

/// Validate a file name stored inside an archive
///
/// # Errors
///
/// `InvalidParameter` for an empty name, `NameTooLong` for names over 255 bytes.
///
/// # Examples
///
/// ```
/// use packfs_rs::core::validation::validate_file_name;
///
/// assert!(validate_file_name("textures/hero.png").is_ok());
/// assert!(validate_file_name("").is_err());
/// assert!(validate_file_name(&"x".repeat(256)).is_err());
/// ```
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PackError::InvalidParameter(
            "file name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(PackError::NameTooLong { len: name.len() });
    }

    Ok(())
}

/// Canonicalize an archive path
///
/// 1. Makes the path absolute against the current directory
/// 2. Resolves `.` and `..` lexically
/// 3. Resolves symlinks in the parent directory when it exists
///
/// The archive file itself does not need to exist, so paths for archives
/// about to be created (or held by an in-memory factory) canonicalize too.
///
/// # Examples
///
/// ```
/// use packfs_rs::core::validation::canonicalize_archive_path;
/// use std::path::Path;
///
/// let a = canonicalize_archive_path(Path::new("/no/such/dir/../data.pfs")).unwrap();
/// let b = canonicalize_archive_path(Path::new("/no/such/./data.pfs")).unwrap();
/// assert_eq!(a, b);
/// ```
pub fn canonicalize_archive_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(PackError::InvalidParameter(
            "archive path cannot be empty".to_string(),
        ));
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    let file_name = normalized
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| {
            PackError::InvalidParameter(format!(
                "archive path has no file name: {}",
                path.display()
            ))
        })?;

    match normalized.parent().map(std::fs::canonicalize) {
        Some(Ok(parent)) => Ok(parent.join(file_name)),
        _ => Ok(normalized),
    }
}
