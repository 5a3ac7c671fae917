//! Attribute structures handed back to the dispatcher.

use crate::md::RecordState;
use leasefs_core::types::{S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG};
use leasefs_core::Timespec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Block size reported in attributes.
pub const BLOCK_SIZE: u32 = 4096;

/// Kind of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Directory.
    Directory,
    /// Regular file.
    RegularFile,
    /// Symbolic link.
    Symlink,
    /// Named pipe.
    NamedPipe,
    /// Anything else (devices, sockets).
    Other,
}

impl FileKind {
    /// Kind encoded in the type bits of `mode`.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileKind::Directory,
            S_IFREG => FileKind::RegularFile,
            S_IFLNK => FileKind::Symlink,
            S_IFIFO => FileKind::NamedPipe,
            _ => FileKind::Other,
        }
    }
}

/// Attributes of one inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Local inode id.
    pub ino: u64,
    /// Size in bytes.
    pub size: u64,
    /// Allocated blocks of [`BLOCK_SIZE`].
    pub blocks: u64,
    /// Last access.
    pub atime: Timespec,
    /// Last modification.
    pub mtime: Timespec,
    /// Last status change.
    pub ctime: Timespec,
    /// Creation.
    pub btime: Timespec,
    /// Entry kind.
    pub kind: FileKind,
    /// Permission bits.
    pub perm: u16,
    /// Link count.
    pub nlink: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Preferred I/O size.
    pub blksize: u32,
}

impl FileAttr {
    /// Attributes of the record `ino` as currently cached.
    pub fn from_state(ino: u64, state: &RecordState) -> Self {
        let size = if state.is_symlink() {
            state
                .symlink_target
                .as_ref()
                .map_or(0, |t| t.len() as u64)
        } else {
            state.size
        };
        Self {
            ino,
            size,
            blocks: size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: state.atime,
            mtime: state.mtime,
            ctime: state.ctime,
            btime: state.btime,
            kind: FileKind::from_mode(state.mode),
            #[allow(clippy::cast_possible_truncation)]
            perm: (state.mode & 0o7777) as u16,
            nlink: state.nlink,
            uid: state.uid,
            gid: state.gid,
            blksize: BLOCK_SIZE,
        }
    }
}

/// Reply to a call that hands the kernel a new reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAttr {
    /// Attributes of the entry.
    pub attr: FileAttr,
    /// How long the kernel may cache the entry and its attributes.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

/// Attribute changes requested by `setattr`; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    /// New permission bits (the type bits are ignored).
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New size.
    pub size: Option<u64>,
    /// New access time.
    pub atime: Option<Timespec>,
    /// New modification time.
    pub mtime: Option<Timespec>,
}

impl SetAttrRequest {
    /// Changes the permission bits.
    #[must_use]
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Changes the owner and group.
    #[must_use]
    pub fn owner(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Truncates or extends the file.
    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets both timestamps.
    #[must_use]
    pub fn times(mut self, atime: Option<Timespec>, mtime: Option<Timespec>) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self
    }

    /// True if ownership changes.
    pub fn changes_owner(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }

    /// True if a timestamp changes.
    pub fn changes_times(&self) -> bool {
        self.atime.is_some() || self.mtime.is_some()
    }
}

/// One entry of a directory listing snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Local inode id.
    pub ino: u64,
    /// Position of the next entry, for resuming a listing.
    pub offset: u64,
    /// Entry kind.
    pub kind: FileKind,
    /// Name inside the directory.
    pub name: String,
}
