//! Interfaces of the remote services the client cache talks to.
//!
//! Three services sit behind the cache:
//!
//! - [`RemoteNamespace`]: authoritative metadata (create, update, delete,
//!   rename, lookup, listing) plus advisory byte-range locks
//! - [`RemoteAuthorizer`]: issues capability grants
//! - [`RemoteStorage`]: byte streams keyed by remote id and generation
//!
//! All calls are blocking and may be slow; every failure is reported as a
//! [`RemoteError`]. Transport and wire encoding live behind these traits.

use crate::error::RemoteError;
use crate::identity::VirtualIdentity;
use crate::types::{AccessMask, Cookie, FileLock, Timespec, mode_is_dir, mode_is_symlink};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A metadata record as exchanged with the remote namespace.
///
/// `remote_ino` is zero in create requests; the remote assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Remote inode id.
    pub remote_ino: u64,
    /// Remote id of the parent directory.
    pub remote_parent: u64,
    /// Name inside the parent.
    pub name: String,
    /// POSIX mode including the file type bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Link count.
    pub nlink: u32,
    /// Last access.
    pub atime: Timespec,
    /// Last content modification.
    pub mtime: Timespec,
    /// Last status change.
    pub ctime: Timespec,
    /// Creation.
    pub btime: Timespec,
    /// Extended attributes.
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Symlink target.
    pub symlink_target: Option<String>,
    /// For a hard-link name, the remote id of the entry it refers to.
    pub hardlink_of: Option<u64>,
    /// Generation of the byte stream.
    pub cookie: Cookie,
}

impl RemoteEntry {
    /// True if the entry is a directory.
    pub fn is_dir(&self) -> bool {
        mode_is_dir(self.mode)
    }

    /// True if the entry is a symlink.
    pub fn is_symlink(&self) -> bool {
        mode_is_symlink(self.mode)
    }
}

/// A rename as understood by the remote namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRequest<'a> {
    /// Entry being moved.
    pub remote_ino: u64,
    /// Current parent.
    pub src_parent: u64,
    /// Current name.
    pub src_name: &'a str,
    /// New parent.
    pub dst_parent: u64,
    /// New name.
    pub dst_name: &'a str,
}

/// Authoritative metadata service.
pub trait RemoteNamespace: Send + Sync {
    /// Resolves `name` inside `remote_parent`.
    fn lookup_entry(&self, remote_parent: u64, name: &str) -> Result<RemoteEntry, RemoteError>;

    /// Fetches one entry by id.
    fn get_entry(&self, remote_ino: u64) -> Result<RemoteEntry, RemoteError>;

    /// Lists the children of a directory.
    fn list_children(&self, remote_ino: u64) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Creates `entry` under `entry.remote_parent`, returning it with its
    /// assigned id. An entry with `hardlink_of` set creates a hard link.
    fn create_entry(&self, authid: &str, entry: &RemoteEntry) -> Result<RemoteEntry, RemoteError>;

    /// Replaces the attributes of an existing entry.
    fn update_entry(&self, authid: &str, entry: &RemoteEntry) -> Result<(), RemoteError>;

    /// Removes the name `name` from `remote_parent`.
    fn delete_entry(&self, authid: &str, remote_parent: u64, name: &str)
    -> Result<(), RemoteError>;

    /// Moves an entry, replacing an existing destination.
    fn rename_entry(&self, authid: &str, request: &RenameRequest<'_>) -> Result<(), RemoteError>;

    /// Returns a lock of another owner conflicting with `lock`, if any.
    fn get_lock(
        &self,
        remote_ino: u64,
        owner: u64,
        lock: &FileLock,
    ) -> Result<Option<FileLock>, RemoteError>;

    /// Acquires or releases a lock without blocking; a conflict fails with
    /// [`RemoteError::LockConflict`].
    fn set_lock(&self, remote_ino: u64, owner: u64, lock: &FileLock) -> Result<(), RemoteError>;
}

/// A capability request.
#[derive(Debug, Clone, Copy)]
pub struct GrantRequest<'a> {
    /// Requester.
    pub identity: &'a VirtualIdentity,
    /// Inode the capability is scoped to.
    pub remote_ino: u64,
    /// Rights the caller needs.
    pub mask: AccessMask,
    /// The grant should also cover listing the directory.
    pub for_listing: bool,
}

/// A capability grant as returned by the authorization service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Id tagging every remote mutation made under this grant.
    pub authid: String,
    /// Granted rights.
    pub mask: AccessMask,
    /// Owner stamped on records created under the grant.
    pub uid: u32,
    /// Group stamped on records created under the grant.
    pub gid: u32,
    /// Largest permitted file size.
    pub max_file_size: u64,
    /// Remaining volume quota in bytes.
    pub volume_quota: u64,
    /// Remaining inode quota.
    pub inode_quota: u64,
    /// How long the grant stays valid; zero means "use the client default".
    pub lifetime: Duration,
}

/// Remote authorization service.
pub trait RemoteAuthorizer: Send + Sync {
    /// Issues a grant for `request`. A grant with fewer rights than requested
    /// is not an error; outright refusal is [`RemoteError::PermissionDenied`].
    fn grant(&self, request: &GrantRequest<'_>) -> Result<Grant, RemoteError>;
}

/// One generation of a remote byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteFile {
    /// Remote inode id.
    pub remote_ino: u64,
    /// Generation the caller works against.
    pub cookie: Cookie,
}

/// Remote byte-stream storage.
pub trait RemoteStorage: Send + Sync {
    /// Opens the stream and returns its current generation.
    fn open(&self, remote_ino: u64, writable: bool) -> Result<Cookie, RemoteError>;

    /// Reads up to `len` bytes at `offset`; short reads happen at end of file.
    fn read(&self, file: RemoteFile, offset: u64, len: usize) -> Result<Bytes, RemoteError>;

    /// Writes `data` at `offset`, extending the stream if needed.
    fn write(&self, file: RemoteFile, offset: u64, data: &[u8]) -> Result<(), RemoteError>;

    /// Sets the stream length.
    fn truncate(&self, file: RemoteFile, size: u64) -> Result<(), RemoteError>;

    /// Commits written data and returns the new generation.
    fn sync(&self, file: RemoteFile) -> Result<Cookie, RemoteError>;

    /// Ends the session.
    fn close(&self, file: RemoteFile) -> Result<(), RemoteError>;
}
