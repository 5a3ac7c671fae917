//! Open file and directory handles.

use crate::attr::DirEntry;
use crate::caps::Capability;
use crate::data::DataContext;
use crate::error::{FsError, FsResult};
use crate::md::MetadataRecord;
use leasefs_common::HandleTable;
use leasefs_core::VirtualIdentity;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// One open file.
#[derive(Debug)]
pub struct OpenFile {
    /// Local inode id.
    pub ino: u64,
    /// Metadata record of the file.
    pub record: Arc<MetadataRecord>,
    /// Shared I/O context of the inode.
    pub data: Arc<DataContext>,
    /// Identity that opened the file.
    pub identity: Arc<VirtualIdentity>,
    /// Opened for writing.
    pub writable: bool,
    cap: Mutex<Arc<Capability>>,
    lock_owners: Mutex<HashSet<u64>>,
}

impl OpenFile {
    /// A handle bound to `cap`.
    pub fn new(
        record: Arc<MetadataRecord>,
        data: Arc<DataContext>,
        identity: Arc<VirtualIdentity>,
        cap: Arc<Capability>,
        writable: bool,
    ) -> Self {
        Self {
            ino: record.ino(),
            record,
            data,
            identity,
            writable,
            cap: Mutex::new(cap),
            lock_owners: Mutex::new(HashSet::new()),
        }
    }

    /// Capability the handle writes under.
    pub fn cap(&self) -> Arc<Capability> {
        Arc::clone(&self.cap.lock())
    }

    /// Rebinds the handle after its capability was renewed.
    pub fn set_cap(&self, cap: Arc<Capability>) {
        *self.cap.lock() = cap;
    }

    /// Remembers that `owner` took a byte-range lock through this handle.
    pub fn add_lock_owner(&self, owner: u64) {
        self.lock_owners.lock().insert(owner);
    }

    /// Forgets `owner`; true if it held locks.
    pub fn take_lock_owner(&self, owner: u64) -> bool {
        self.lock_owners.lock().remove(&owner)
    }

    /// Every owner still holding locks.
    pub fn lock_owners(&self) -> Vec<u64> {
        self.lock_owners.lock().iter().copied().collect()
    }
}

/// One open directory with its listing snapshot.
#[derive(Debug)]
pub struct DirHandle {
    /// Local inode id.
    pub ino: u64,
    /// Metadata record of the directory.
    pub record: Arc<MetadataRecord>,
    /// Listing taken at `opendir`.
    pub entries: Vec<DirEntry>,
}

/// Open file and directory tables.
#[derive(Debug, Default)]
pub struct Handles {
    files: HandleTable<OpenFile>,
    dirs: HandleTable<DirHandle>,
}

fn check_fh(fh: u64) -> FsResult<()> {
    if fh == 0 {
        return Err(FsError::NoDevice);
    }
    Ok(())
}

impl Handles {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open file.
    pub fn open_file(&self, file: OpenFile) -> u64 {
        self.files.insert(file)
    }

    /// The open file `fh`.
    pub fn file(&self, fh: u64) -> FsResult<Arc<OpenFile>> {
        check_fh(fh)?;
        self.files.get(fh).ok_or(FsError::BadHandle(fh))
    }

    /// Unregisters the open file `fh`.
    pub fn close_file(&self, fh: u64) -> FsResult<Arc<OpenFile>> {
        check_fh(fh)?;
        self.files.remove(fh).ok_or(FsError::BadHandle(fh))
    }

    /// Registers an open directory.
    pub fn open_dir(&self, dir: DirHandle) -> u64 {
        self.dirs.insert(dir)
    }

    /// The open directory `fh`.
    pub fn dir(&self, fh: u64) -> FsResult<Arc<DirHandle>> {
        check_fh(fh)?;
        self.dirs.get(fh).ok_or(FsError::BadHandle(fh))
    }

    /// Unregisters the open directory `fh`.
    pub fn close_dir(&self, fh: u64) -> FsResult<Arc<DirHandle>> {
        check_fh(fh)?;
        self.dirs.remove(fh).ok_or(FsError::BadHandle(fh))
    }

    /// Open files of `ino`.
    pub fn files_of(&self, ino: u64) -> Vec<Arc<OpenFile>> {
        self.files
            .find_all(|f| f.ino == ino)
            .into_iter()
            .map(|(_, f)| f)
            .collect()
    }

    /// Number of open files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of open directories.
    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }
}
