//! Closed set of filesystem calls for a binding layer.
//!
//! A kernel binding translates each request into an [`Operation`], hands it
//! to [`LeaseFs::dispatch`] and turns the [`Reply`] (or the errno of the
//! error) into its own reply type.

use crate::attr::{DirEntry, EntryAttr, FileAttr, SetAttrRequest};
use crate::error::FsResult;
use crate::fs::{LeaseFs, Opened};
use bytes::Bytes;
use leasefs_common::ClientStatsSnapshot;
use leasefs_core::{FileLock, TransportCredentials};
use std::time::Instant;

/// One filesystem call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Lookup { parent: u64, name: String },
    GetAttr { ino: u64 },
    Forget { ino: u64, nlookup: u64 },
    SetAttr { ino: u64, fh: Option<u64>, attr: SetAttrRequest },
    Mkdir { parent: u64, name: String, mode: u32 },
    Mknod { parent: u64, name: String, mode: u32 },
    Create { parent: u64, name: String, mode: u32, flags: i32 },
    Symlink { parent: u64, name: String, target: String },
    Readlink { ino: u64 },
    Link { ino: u64, new_parent: u64, new_name: String },
    Unlink { parent: u64, name: String },
    Rmdir { parent: u64, name: String },
    Rename { parent: u64, name: String, new_parent: u64, new_name: String },
    Open { ino: u64, flags: i32 },
    Read { ino: u64, fh: u64, offset: u64, size: u32 },
    Write { ino: u64, fh: u64, offset: u64, data: Bytes },
    Flush { ino: u64, fh: u64, lock_owner: u64 },
    Fsync { ino: u64, fh: u64, datasync: bool },
    Release { ino: u64, fh: u64 },
    OpenDir { ino: u64 },
    ReadDir { ino: u64, fh: u64, offset: u64 },
    ReleaseDir { ino: u64, fh: u64 },
    Access { ino: u64, mask: u32 },
    GetXattr { ino: u64, name: String },
    SetXattr { ino: u64, name: String, value: Vec<u8>, flags: i32 },
    ListXattr { ino: u64 },
    RemoveXattr { ino: u64, name: String },
    GetLk { ino: u64, fh: u64, owner: u64, lock: FileLock },
    SetLk {
        ino: u64,
        fh: u64,
        owner: u64,
        lock: FileLock,
        wait: bool,
        deadline: Option<Instant>,
    },
    Stats,
}

impl Operation {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Lookup { .. } => "lookup",
            Operation::GetAttr { .. } => "getattr",
            Operation::Forget { .. } => "forget",
            Operation::SetAttr { .. } => "setattr",
            Operation::Mkdir { .. } => "mkdir",
            Operation::Mknod { .. } => "mknod",
            Operation::Create { .. } => "create",
            Operation::Symlink { .. } => "symlink",
            Operation::Readlink { .. } => "readlink",
            Operation::Link { .. } => "link",
            Operation::Unlink { .. } => "unlink",
            Operation::Rmdir { .. } => "rmdir",
            Operation::Rename { .. } => "rename",
            Operation::Open { .. } => "open",
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::Flush { .. } => "flush",
            Operation::Fsync { .. } => "fsync",
            Operation::Release { .. } => "release",
            Operation::OpenDir { .. } => "opendir",
            Operation::ReadDir { .. } => "readdir",
            Operation::ReleaseDir { .. } => "releasedir",
            Operation::Access { .. } => "access",
            Operation::GetXattr { .. } => "getxattr",
            Operation::SetXattr { .. } => "setxattr",
            Operation::ListXattr { .. } => "listxattr",
            Operation::RemoveXattr { .. } => "removexattr",
            Operation::GetLk { .. } => "getlk",
            Operation::SetLk { .. } => "setlk",
            Operation::Stats => "stats",
        }
    }
}

/// Successful result of an [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Nothing to return.
    Empty,
    Entry(EntryAttr),
    Attr(FileAttr),
    Created { entry: EntryAttr, opened: Opened },
    Opened(Opened),
    Data(Bytes),
    Written(u32),
    Link(String),
    DirHandle(u64),
    Entries(Vec<DirEntry>),
    Xattr(Vec<u8>),
    XattrNames(Vec<String>),
    Lock(FileLock),
    Stats(ClientStatsSnapshot),
}

impl LeaseFs {
    /// Runs `op` on behalf of `creds`.
    pub fn dispatch(&self, creds: &TransportCredentials, op: Operation) -> FsResult<Reply> {
        Ok(match op {
            Operation::Lookup { parent, name } => Reply::Entry(self.lookup(creds, parent, &name)?),
            Operation::GetAttr { ino } => Reply::Attr(self.getattr(creds, ino)?),
            Operation::Forget { ino, nlookup } => {
                self.forget(ino, nlookup);
                Reply::Empty
            }
            Operation::SetAttr { ino, fh, attr } => Reply::Attr(self.setattr(creds, ino, fh, &attr)?),
            Operation::Mkdir { parent, name, mode } => {
                Reply::Entry(self.mkdir(creds, parent, &name, mode)?)
            }
            Operation::Mknod { parent, name, mode } => {
                Reply::Entry(self.mknod(creds, parent, &name, mode)?)
            }
            Operation::Create {
                parent,
                name,
                mode,
                flags,
            } => {
                let (entry, opened) = self.create(creds, parent, &name, mode, flags)?;
                Reply::Created { entry, opened }
            }
            Operation::Symlink {
                parent,
                name,
                target,
            } => Reply::Entry(self.symlink(creds, parent, &name, &target)?),
            Operation::Readlink { ino } => Reply::Link(self.readlink(creds, ino)?),
            Operation::Link {
                ino,
                new_parent,
                new_name,
            } => Reply::Entry(self.link(creds, ino, new_parent, &new_name)?),
            Operation::Unlink { parent, name } => {
                self.unlink(creds, parent, &name)?;
                Reply::Empty
            }
            Operation::Rmdir { parent, name } => {
                self.rmdir(creds, parent, &name)?;
                Reply::Empty
            }
            Operation::Rename {
                parent,
                name,
                new_parent,
                new_name,
            } => {
                self.rename(creds, parent, &name, new_parent, &new_name)?;
                Reply::Empty
            }
            Operation::Open { ino, flags } => Reply::Opened(self.open(creds, ino, flags)?),
            Operation::Read {
                ino,
                fh,
                offset,
                size,
            } => Reply::Data(self.read(creds, ino, fh, offset, size)?),
            Operation::Write {
                ino,
                fh,
                offset,
                data,
            } => Reply::Written(self.write(creds, ino, fh, offset, &data)?),
            Operation::Flush {
                ino,
                fh,
                lock_owner,
            } => {
                self.flush(creds, ino, fh, lock_owner)?;
                Reply::Empty
            }
            Operation::Fsync { ino, fh, datasync } => {
                self.fsync(creds, ino, fh, datasync)?;
                Reply::Empty
            }
            Operation::Release { ino, fh } => {
                self.release(creds, ino, fh)?;
                Reply::Empty
            }
            Operation::OpenDir { ino } => Reply::DirHandle(self.opendir(creds, ino)?),
            Operation::ReadDir { ino, fh, offset } => {
                Reply::Entries(self.readdir(creds, ino, fh, offset)?)
            }
            Operation::ReleaseDir { ino, fh } => {
                self.releasedir(creds, ino, fh)?;
                Reply::Empty
            }
            Operation::Access { ino, mask } => {
                self.access(creds, ino, mask)?;
                Reply::Empty
            }
            Operation::GetXattr { ino, name } => Reply::Xattr(self.getxattr(creds, ino, &name)?),
            Operation::SetXattr {
                ino,
                name,
                value,
                flags,
            } => {
                self.setxattr(creds, ino, &name, &value, flags)?;
                Reply::Empty
            }
            Operation::ListXattr { ino } => Reply::XattrNames(self.listxattr(creds, ino)?),
            Operation::RemoveXattr { ino, name } => {
                self.removexattr(creds, ino, &name)?;
                Reply::Empty
            }
            Operation::GetLk {
                ino,
                fh,
                owner,
                lock,
            } => Reply::Lock(self.getlk(creds, ino, fh, owner, &lock)?),
            Operation::SetLk {
                ino,
                fh,
                owner,
                lock,
                wait,
                deadline,
            } => {
                self.setlk(creds, ino, fh, owner, &lock, wait, deadline)?;
                Reply::Empty
            }
            Operation::Stats => Reply::Stats(self.stats()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Stats.name(), "stats");
        let op = Operation::Rename {
            parent: 1,
            name: "a".into(),
            new_parent: 2,
            new_name: "b".into(),
        };
        assert_eq!(op.name(), "rename");
        let op = Operation::Write {
            ino: 2,
            fh: 1,
            offset: 0,
            data: Bytes::from_static(b"x"),
        };
        assert_eq!(op.name(), "write");
    }
}
