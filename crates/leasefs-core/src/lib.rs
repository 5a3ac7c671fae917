//! Core types for the leasefs client cache.
//!
//! leasefs presents a remote, distributed namespace as a local POSIX-like
//! filesystem. This crate holds the pieces every other layer shares:
//!
//! - [`types`] - modes, timestamps, generation cookies, access masks, locks
//! - [`identity`] - virtual identities and the [`IdentityProvider`] seam
//! - [`remote`] - the namespace, authorization and storage service traits
//! - [`error`] - [`RemoteError`] and [`IdentityError`]
//! - [`testing`] - in-memory remote services with failure injection
//!
//! The caching and concurrency layer itself lives in `leasefs-client`.

#![warn(missing_docs)]

pub mod error;
pub mod identity;
pub mod remote;
pub mod testing;
pub mod types;

pub use error::{IdentityError, RemoteError};
pub use identity::{
    AuthProtocol, IdentityKey, IdentityProvider, TransportCredentials, UnixIdentityProvider,
    VirtualIdentity,
};
pub use remote::{
    Grant, GrantRequest, RemoteAuthorizer, RemoteEntry, RemoteFile, RemoteNamespace,
    RemoteStorage, RenameRequest,
};
pub use types::{
    AccessMask, Cookie, FileLock, LockKind, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, Timespec,
};

/// Local inode id of the mount root.
pub const ROOT_INO: u64 = 1;
