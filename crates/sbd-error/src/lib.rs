#![forbid(unsafe_code)]
//! Error types for StripeBD.
//!
//! Defines `SbdError` and a `Result<T>` alias used throughout the workspace.
//! Stage statuses inside the request engine stay raw `i32` values (negated
//! errnos, byte counts) because they travel along completion callbacks;
//! `SbdError` covers the configuration and metadata boundaries.

use sbd_types::{SnapId, ValidationError};
use thiserror::Error;

/// Unified error type for StripeBD operations.
#[derive(Debug, Error)]
pub enum SbdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot {snap} no longer exists")]
    SnapshotMissing { snap: SnapId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("object store rejected submission for {oid}: status {status}")]
    Store { oid: String, status: i32 },
}

impl From<ValidationError> for SbdError {
    fn from(err: ValidationError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

impl SbdError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::SnapshotMissing { .. } => libc::ENOENT,
            Self::InvalidConfig(_) => libc::EINVAL,
            Self::Store { status, .. } => status.unsigned_abs() as libc::c_int,
        }
    }

    /// Negated-errno status form, for delivery along a completion callback.
    #[must_use]
    pub fn to_status(&self) -> i32 {
        -self.to_errno()
    }
}

/// Result alias using `SbdError`.
pub type Result<T> = std::result::Result<T, SbdError>;
