//! Error types reported by the remote services and the identity layer.

use crate::types::Cookie;
use thiserror::Error;

/// Status returned by a remote namespace, authorization or storage call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The entry does not exist (or was deleted remotely).
    #[error("remote entry not found")]
    NotFound,

    /// The target name is already taken.
    #[error("remote entry already exists")]
    AlreadyExists,

    /// The caller lacks the required access rights.
    #[error("permission denied by remote")]
    PermissionDenied,

    /// The operation is never allowed for this caller.
    #[error("operation not permitted by remote")]
    NotPermitted,

    /// Volume or inode quota is exhausted.
    #[error("remote quota exceeded")]
    QuotaExceeded,

    /// Directory still has children.
    #[error("remote directory not empty")]
    NotEmpty,

    /// A directory was required.
    #[error("remote entry is not a directory")]
    NotADirectory,

    /// A non-directory was required.
    #[error("remote entry is a directory")]
    IsADirectory,

    /// A byte-range lock is held by another owner.
    #[error("lock held by another owner")]
    LockConflict,

    /// The byte stream moved on to a newer generation.
    #[error("stale generation: expected {expected}, found {found}")]
    Stale {
        /// Generation the caller presented.
        expected: Cookie,
        /// Generation the remote currently serves.
        found: Cookie,
    },

    /// Transient network or service failure.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The request was malformed or refers to an inconsistent state.
    #[error("invalid remote request: {0}")]
    Invalid(String),
}

impl RemoteError {
    /// True for failures worth retrying later with the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }

    /// True if the remote no longer knows the entry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound)
    }
}

/// Failure to derive a virtual identity from transport credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The credentials carry the overflow id and cannot be mapped.
    #[error("credentials for uid {uid} cannot be mapped")]
    Unmappable {
        /// The rejected uid.
        uid: u32,
    },

    /// The credentials were rejected by policy.
    #[error("credentials rejected: {0}")]
    Rejected(String),
}
