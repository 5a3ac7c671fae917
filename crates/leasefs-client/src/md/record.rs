//! Metadata records and their per-record lock.

use crate::attr::FileAttr;
use event_listener::{Event, Listener};
use leasefs_core::types::{S_IFDIR, mode_is_dir, mode_is_regular, mode_is_symlink};
use leasefs_core::{Cookie, RemoteEntry, RemoteError, Timespec};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// How much of a directory the record knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncType {
    /// Attributes only; children are learned name by name.
    #[default]
    Plain,
    /// The full remote listing has been merged into `children`.
    ListingLoaded,
    /// An exclusive create is in flight; the name must not be reused.
    ExclusivePending,
}

/// A further name of a hard-linked record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Alias {
    pub(crate) parent: u64,
    pub(crate) name: String,
    pub(crate) remote_ino: u64,
}

/// Mutable contents of a [`MetadataRecord`], guarded by the record lock.
#[derive(Debug, Clone)]
pub struct RecordState {
    /// Remote inode id; 0 until the remote acknowledged the create.
    pub remote_ino: u64,
    /// Local id of the parent directory.
    pub parent: u64,
    /// Name inside the parent.
    pub name: String,
    /// POSIX mode including type bits.
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
    /// Last modification.
    pub mtime: Timespec,
    /// Last status change.
    pub ctime: Timespec,
    /// Creation.
    pub btime: Timespec,
    /// Extended attributes.
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Target of a symlink.
    pub symlink_target: Option<String>,
    /// Generation of the byte stream.
    pub cookie: Cookie,
    /// Name to local id, for directories.
    pub children: BTreeMap<String, u64>,
    /// Listing state.
    pub sync: SyncType,
    /// Kernel references.
    pub lookup_count: u64,
    /// Open directory handles.
    pub opendir_count: u32,
    deleted: bool,
    pub(crate) pending: u32,
    pub(crate) todelete: HashMap<String, u32>,
    pub(crate) aliases: Vec<Alias>,
    pub(crate) last_error: Option<RemoteError>,
    pub(crate) fetched_at: Instant,
    pub(crate) update_queued: bool,
    pub(crate) forgotten: bool,
}

impl RecordState {
    /// A record for an entry about to be created locally.
    pub fn new_local(parent: u64, name: &str, mode: u32, uid: u32, gid: u32) -> Self {
        let now = Timespec::now();
        Self {
            remote_ino: 0,
            parent,
            name: name.to_string(),
            mode,
            uid,
            gid,
            size: 0,
            nlink: if mode_is_dir(mode) { 2 } else { 1 },
            atime: now,
            mtime: now,
            ctime: now,
            btime: now,
            xattrs: BTreeMap::new(),
            symlink_target: None,
            cookie: Cookie::NONE,
            children: BTreeMap::new(),
            sync: SyncType::Plain,
            lookup_count: 0,
            opendir_count: 0,
            deleted: false,
            pending: 0,
            todelete: HashMap::new(),
            aliases: Vec::new(),
            last_error: None,
            fetched_at: Instant::now(),
            update_queued: false,
            forgotten: false,
        }
    }

    /// A record mirroring `entry`, placed under the local `parent`.
    pub fn from_remote(parent: u64, entry: &RemoteEntry) -> Self {
        let mut state = Self::new_local(parent, &entry.name, entry.mode, entry.uid, entry.gid);
        state.remote_ino = entry.remote_ino;
        state.copy_attributes(entry);
        state
    }

    fn copy_attributes(&mut self, entry: &RemoteEntry) {
        self.mode = entry.mode;
        self.uid = entry.uid;
        self.gid = entry.gid;
        self.size = entry.size;
        self.nlink = entry.nlink;
        self.atime = entry.atime;
        self.mtime = entry.mtime;
        self.ctime = entry.ctime;
        self.btime = entry.btime;
        self.xattrs.clone_from(&entry.xattrs);
        self.symlink_target.clone_from(&entry.symlink_target);
        self.cookie = entry.cookie;
        self.fetched_at = Instant::now();
    }

    /// Merges a fresh remote view unless local mutations are still queued.
    ///
    /// Returns false when the remote view was ignored.
    pub(crate) fn apply_remote(&mut self, entry: &RemoteEntry) -> bool {
        if self.pending > 0 || self.update_queued || self.deleted {
            return false;
        }
        if self.is_dir() && entry.mtime != self.mtime {
            self.sync = SyncType::Plain;
        }
        self.copy_attributes(entry);
        true
    }

    /// The entry sent to the remote for a create or update.
    pub fn to_remote(&self, remote_parent: u64) -> RemoteEntry {
        RemoteEntry {
            remote_ino: self.remote_ino,
            remote_parent,
            name: self.name.clone(),
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            nlink: self.nlink,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            btime: self.btime,
            xattrs: self.xattrs.clone(),
            symlink_target: self.symlink_target.clone(),
            hardlink_of: None,
            cookie: self.cookie,
        }
    }

    /// True for a directory.
    pub fn is_dir(&self) -> bool {
        mode_is_dir(self.mode)
    }

    /// True for a symlink.
    pub fn is_symlink(&self) -> bool {
        mode_is_symlink(self.mode)
    }

    /// True for a regular file.
    pub fn is_regular(&self) -> bool {
        mode_is_regular(self.mode)
    }

    /// True once the record was unlinked. Never cleared.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
        self.nlink = 0;
        self.ctime = Timespec::now();
    }

    /// Remote mutations not yet acknowledged.
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Error of the last background mutation that failed for good.
    pub fn last_error(&self) -> Option<&RemoteError> {
        self.last_error.as_ref()
    }

    /// True while a queued delete of `name` in this directory is unacknowledged.
    pub fn has_pending_delete(&self, name: &str) -> bool {
        self.todelete.contains_key(name)
    }

    /// Records a change of the directory contents.
    pub(crate) fn touch_dir(&mut self) {
        let now = Timespec::now();
        self.mtime = now;
        self.ctime = now;
    }

    pub(crate) fn find_alias(&self, parent: u64, name: &str) -> Option<usize> {
        self.aliases
            .iter()
            .position(|a| a.parent == parent && a.name == name)
    }

    pub(crate) fn add_alias(&mut self, parent: u64, name: &str, remote_ino: u64) {
        if self.find_alias(parent, name).is_none() {
            self.aliases.push(Alias {
                parent,
                name: name.to_string(),
                remote_ino,
            });
        }
    }

    /// Takes one kernel reference; a record referenced again is no longer forgotten.
    pub(crate) fn take_lookup(&mut self) {
        self.lookup_count += 1;
        self.forgotten = false;
    }

    /// Takes one open-directory reference.
    pub(crate) fn take_opendir(&mut self) {
        self.opendir_count += 1;
        self.forgotten = false;
    }

    /// True once the kernel dropped every reference while a mutation was queued.
    pub(crate) fn is_forgotten(&self) -> bool {
        self.forgotten && self.lookup_count == 0 && self.opendir_count == 0
    }

    pub(crate) fn is_evictable(&self) -> bool {
        self.lookup_count == 0 && self.opendir_count == 0 && self.pending == 0
    }
}

impl Default for RecordState {
    fn default() -> Self {
        Self::new_local(0, "", S_IFDIR | 0o755, 0, 0)
    }
}

/// One cached inode.
///
/// Shared between the metadata cache, open file contexts and queued
/// mutations. The state lock is never held across a remote call.
#[derive(Debug)]
pub struct MetadataRecord {
    ino: u64,
    state: Mutex<RecordState>,
    changed: Event,
}

impl MetadataRecord {
    /// Wraps `state` as local inode `ino`.
    pub fn new(ino: u64, state: RecordState) -> Self {
        Self {
            ino,
            state: Mutex::new(state),
            changed: Event::new(),
        }
    }

    /// Local inode id.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Locks the record state.
    pub fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock()
    }

    /// Attributes as currently cached.
    pub fn attr(&self) -> FileAttr {
        FileAttr::from_state(self.ino, &self.state.lock())
    }

    /// True once the record was unlinked.
    pub fn is_deleted(&self) -> bool {
        self.state.lock().is_deleted()
    }

    /// Remote id, 0 while the create is pending.
    pub fn remote_ino(&self) -> u64 {
        self.state.lock().remote_ino
    }

    /// Wakes every waiter so it re-checks its condition.
    pub(crate) fn notify(&self) {
        self.changed.notify(usize::MAX);
    }

    /// Blocks until `cond` holds or `deadline` passes.
    ///
    /// Returns whether the condition held.
    pub(crate) fn wait_until(
        &self,
        deadline: Instant,
        cond: impl Fn(&RecordState) -> bool,
    ) -> bool {
        loop {
            let listener = self.changed.listen();
            if cond(&self.state.lock()) {
                return true;
            }
            if listener.wait_deadline(deadline).is_none() {
                return cond(&self.state.lock());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasefs_core::S_IFREG;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn remote_file() -> RemoteEntry {
        RemoteEntry {
            remote_ino: 1001,
            remote_parent: 1000,
            name: "f".into(),
            mode: S_IFREG | 0o644,
            size: 42,
            nlink: 1,
            cookie: Cookie::new(3),
            ..RemoteEntry::default()
        }
    }

    #[test]
    fn test_new_directory_has_two_links() {
        let dir = RecordState::new_local(1, "d", S_IFDIR | 0o755, 0, 0);
        assert_eq!(dir.nlink, 2);
        assert!(dir.is_dir());
        let file = RecordState::new_local(1, "f", S_IFREG | 0o644, 0, 0);
        assert_eq!(file.nlink, 1);
    }

    #[test]
    fn test_from_remote_and_back() {
        let entry = remote_file();
        let state = RecordState::from_remote(1, &entry);
        assert_eq!(state.remote_ino, 1001);
        assert_eq!(state.size, 42);
        assert_eq!(state.to_remote(1000), entry);
    }

    #[test]
    fn test_apply_remote_skips_pending_records() {
        let mut state = RecordState::from_remote(1, &remote_file());
        let mut newer = remote_file();
        newer.size = 100;
        state.pending = 1;
        assert!(!state.apply_remote(&newer));
        assert_eq!(state.size, 42);
        state.pending = 0;
        assert!(state.apply_remote(&newer));
        assert_eq!(state.size, 100);
    }

    #[test]
    fn test_deleted_is_one_way() {
        let mut state = RecordState::from_remote(1, &remote_file());
        state.mark_deleted();
        assert!(state.is_deleted());
        assert_eq!(state.nlink, 0);
        assert!(!state.apply_remote(&remote_file()));
        assert!(state.is_deleted());
    }

    #[test]
    fn test_aliases_are_unique() {
        let mut state = RecordState::from_remote(1, &remote_file());
        state.add_alias(1, "g", 1002);
        state.add_alias(1, "g", 1002);
        assert_eq!(state.aliases.len(), 1);
        assert_eq!(state.find_alias(1, "g"), Some(0));
        assert_eq!(state.find_alias(1, "f"), None);
    }

    #[test]
    fn test_wait_until_wakes_on_notify() {
        let record = Arc::new(MetadataRecord::new(2, RecordState::from_remote(1, &remote_file())));
        record.lock().pending = 1;
        let r = Arc::clone(&record);
        let waiter = thread::spawn(move || {
            r.wait_until(Instant::now() + Duration::from_secs(5), |s| s.pending == 0)
        });
        thread::sleep(Duration::from_millis(20));
        record.lock().pending = 0;
        record.notify();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_until_times_out() {
        let record = MetadataRecord::new(2, RecordState::from_remote(1, &remote_file()));
        record.lock().pending = 1;
        let ok = record.wait_until(Instant::now() + Duration::from_millis(20), |s| s.pending == 0);
        assert!(!ok);
    }
}
