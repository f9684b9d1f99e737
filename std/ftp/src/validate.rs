//! Argument validation for the FTP MCP server.
//!
//! Local paths used by transfers must pass through [`validate_path`] so
//! downloads and uploads stay inside the server's allowed directories.
//! Remote paths and raw commands are checked by [`remote_path`] and
//! [`raw_command`] before they reach the control connection.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from argument validation.
#[derive(Error, Debug)]
pub enum ValidateError {
    /// The path is outside all allowed directories.
    #[error("path not allowed: {0}")]
    NotAllowed(PathBuf),
    /// The path contains a null byte.
    #[error("path contains null byte")]
    NullByte,
    /// A required argument was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
    /// The value would smuggle extra lines onto the control connection.
    #[error("{0} must not contain line breaks")]
    LineBreak(&'static str),
    /// An I/O error occurred during path resolution.
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Validate that a local path is within the allowed directories.
///
/// Steps:
/// 1. Reject paths containing null bytes
/// 2. Canonicalize the path (resolves symlinks, `..`, etc.)
///    - If the path does not exist, canonicalize the parent directory instead
/// 3. Verify the canonical path starts with one of the allowed directories
pub fn validate_path(path: &str, allowed_dirs: &[PathBuf]) -> Result<PathBuf, ValidateError> {
    if path.contains('\0') {
        return Err(ValidateError::NullByte);
    }
    if path.trim().is_empty() {
        return Err(ValidateError::Empty("local path"));
    }

    let path = Path::new(path);
    let io_err = |source| ValidateError::Io {
        path: path.to_path_buf(),
        source,
    };

    let canonical = if path.exists() {
        path.canonicalize().map_err(io_err)?
    } else {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let canon_parent = parent.canonicalize().map_err(io_err)?;
        let file_name = path.file_name().ok_or_else(|| {
            io_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no file name",
            ))
        })?;
        canon_parent.join(file_name)
    };

    let allowed = allowed_dirs.iter().any(|dir| canonical.starts_with(dir));
    if !allowed {
        return Err(ValidateError::NotAllowed(canonical));
    }

    Ok(canonical)
}

/// Canonicalize a list of directory paths, skipping any that don't exist.
pub fn canonicalize_dirs(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    dirs.into_iter()
        .filter_map(|d| d.canonicalize().ok())
        .collect()
}

/// Validate a remote path argument named `field`.
pub fn remote_path(value: &str, field: &'static str) -> Result<String, ValidateError> {
    if value.contains('\0') {
        return Err(ValidateError::NullByte);
    }
    if value.contains(['\r', '\n']) {
        return Err(ValidateError::LineBreak(field));
    }
    if value.is_empty() {
        return Err(ValidateError::Empty(field));
    }
    Ok(value.to_string())
}

/// Validate a raw protocol command line.
pub fn raw_command(value: &str) -> Result<String, ValidateError> {
    let command = remote_path(value.trim(), "command")?;
    Ok(command)
}

/// Validate a session handle argument.
pub fn session_handle(value: &str) -> Result<String, ValidateError> {
    let handle = value.trim();
    if handle.is_empty() {
        return Err(ValidateError::Empty("session_id"));
    }
    Ok(handle.to_string())
}
