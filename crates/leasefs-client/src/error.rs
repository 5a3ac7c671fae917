//! Error handling and errno mapping for the client.
//!
//! Every operation of the service returns [`FsResult`]. The binding layer
//! turns an [`FsError`] into the errno handed back to the kernel through
//! [`FsError::to_errno`], which delegates to the shared
//! [`ErrorCategory`] so there is exactly one errno table.

use leasefs_common::{ErrorCategory, io_error_to_errno};
use leasefs_core::{IdentityError, RemoteError};
use std::io;
use thiserror::Error;

/// Errors returned by filesystem operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    /// A remote call failed.
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),

    /// The caller's credentials could not be mapped.
    #[error("identity mapping failed: {0}")]
    Identity(#[from] IdentityError),

    /// No such entry, or the entry is deleted.
    #[error("no such entry")]
    NotFound,

    /// The name is taken.
    #[error("entry already exists")]
    AlreadyExists,

    /// The capability lacks the required access bits.
    #[error("access denied")]
    AccessDenied,

    /// The operation is reserved to other callers.
    #[error("operation not permitted")]
    NotPermitted,

    /// Volume or inode quota is exhausted.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// The write would grow the file beyond the permitted size.
    #[error("file size limit of {limit} bytes exceeded")]
    FileTooLarge {
        /// Largest permitted size.
        limit: u64,
    },

    /// Directory still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// A directory was expected.
    #[error("not a directory")]
    NotDirectory,

    /// A directory was not expected.
    #[error("is a directory")]
    IsDirectory,

    /// Hard links across directories are not supported.
    #[error("cross-directory link")]
    CrossDevice,

    /// The extended attribute does not exist.
    #[error("no such attribute")]
    NoAttribute,

    /// The lock is held elsewhere or the lock deadline passed.
    #[error("resource temporarily unavailable")]
    WouldBlock,

    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A path component is too long.
    #[error("name too long")]
    NameTooLong,

    /// Unknown handle, or a handle opened without the needed mode.
    #[error("bad handle {0}")]
    BadHandle(u64),

    /// Handle 0 was passed where an open file is required.
    #[error("no such device or address")]
    NoDevice,

    /// The feature is disabled.
    #[error("operation not supported")]
    NotSupported,

    /// Waiting for a remote acknowledgement took too long.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl FsError {
    /// Semantic category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            FsError::Remote(e) => ErrorCategory::from(e),
            FsError::Identity(_) | FsError::NotPermitted => ErrorCategory::NotPermitted,
            FsError::NotFound => ErrorCategory::NotFound,
            FsError::AlreadyExists => ErrorCategory::AlreadyExists,
            FsError::AccessDenied => ErrorCategory::PermissionDenied,
            FsError::QuotaExceeded => ErrorCategory::QuotaExceeded,
            FsError::FileTooLarge { .. } => ErrorCategory::FileTooLarge,
            FsError::NotEmpty => ErrorCategory::NotEmpty,
            FsError::NotDirectory => ErrorCategory::NotDirectory,
            FsError::IsDirectory => ErrorCategory::IsDirectory,
            FsError::CrossDevice => ErrorCategory::CrossDevice,
            FsError::NoAttribute => ErrorCategory::NoData,
            FsError::WouldBlock => ErrorCategory::WouldBlock,
            FsError::InvalidArgument(_) => ErrorCategory::InvalidArgument,
            FsError::NameTooLong => ErrorCategory::NameTooLong,
            FsError::BadHandle(_) => ErrorCategory::BadHandle,
            FsError::NoDevice => ErrorCategory::NoDevice,
            FsError::NotSupported => ErrorCategory::NotSupported,
            FsError::Timeout(_) | FsError::Io(_) => ErrorCategory::Io,
        }
    }

    /// Converts this error to a libc error code.
    pub fn to_errno(&self) -> i32 {
        self.category().to_errno()
    }

    /// True if the error came from an unreachable remote.
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, FsError::Remote(e) if e.is_retryable())
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::Io(e.to_string())
    }
}

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for RemoteError {
    fn to_errno(&self) -> i32 {
        ErrorCategory::from(self).to_errno()
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

impl ToErrno for FsError {
    fn to_errno(&self) -> i32 {
        FsError::to_errno(self)
    }
}

/// Configuration parsing and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The JSON document could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
