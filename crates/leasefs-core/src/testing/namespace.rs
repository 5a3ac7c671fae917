use super::FaultInjector;
use crate::error::RemoteError;
use crate::remote::{RemoteEntry, RemoteNamespace, RenameRequest};
use crate::types::{Cookie, FileLock, LockKind, S_IFDIR, S_IFREG, Timespec};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Per-call counters of a [`MemoryNamespace`].
#[derive(Debug, Default)]
pub struct NamespaceCalls {
    /// `lookup_entry` calls.
    pub lookups: AtomicU64,
    /// `get_entry` calls.
    pub gets: AtomicU64,
    /// `list_children` calls.
    pub listings: AtomicU64,
    /// `create_entry` calls.
    pub creates: AtomicU64,
    /// `update_entry` calls.
    pub updates: AtomicU64,
    /// `delete_entry` calls.
    pub deletes: AtomicU64,
    /// `rename_entry` calls.
    pub renames: AtomicU64,
    /// `set_lock` / `get_lock` calls.
    pub locks: AtomicU64,
}

impl NamespaceCalls {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct HeldLock {
    owner: u64,
    lock: FileLock,
}

#[derive(Debug)]
struct NamespaceState {
    entries: HashMap<u64, RemoteEntry>,
    children: HashMap<u64, BTreeMap<String, u64>>,
    locks: HashMap<u64, Vec<HeldLock>>,
    next_ino: u64,
}

impl NamespaceState {
    fn dir_children(&self, ino: u64) -> Result<&BTreeMap<String, u64>, RemoteError> {
        match self.entries.get(&ino) {
            None => Err(RemoteError::NotFound),
            Some(e) if !e.is_dir() => Err(RemoteError::NotADirectory),
            Some(_) => self.children.get(&ino).ok_or(RemoteError::NotFound),
        }
    }

    fn remove_entry(&mut self, ino: u64) {
        if let Some(entry) = self.entries.remove(&ino)
            && let Some(target) = entry.hardlink_of
            && let Some(t) = self.entries.get_mut(&target)
        {
            t.nlink = t.nlink.saturating_sub(1);
        }
        self.children.remove(&ino);
        self.locks.remove(&ino);
    }
}

/// Remote namespace kept in process memory.
///
/// Remote ids start at [`MemoryNamespace::ROOT`] so they never coincide with
/// the small local ids a client allocates.
#[derive(Debug)]
pub struct MemoryNamespace {
    state: Mutex<NamespaceState>,
    faults: FaultInjector,
    calls: NamespaceCalls,
}

impl MemoryNamespace {
    /// Remote id of the root directory.
    pub const ROOT: u64 = 1000;

    /// A namespace holding only the root directory.
    pub fn new() -> Self {
        let now = Timespec::now();
        let root = RemoteEntry {
            remote_ino: Self::ROOT,
            remote_parent: Self::ROOT,
            name: String::new(),
            mode: S_IFDIR | 0o777,
            nlink: 2,
            atime: now,
            mtime: now,
            ctime: now,
            btime: now,
            ..RemoteEntry::default()
        };
        let mut entries = HashMap::new();
        entries.insert(Self::ROOT, root);
        let mut children = HashMap::new();
        children.insert(Self::ROOT, BTreeMap::new());
        Self {
            state: Mutex::new(NamespaceState {
                entries,
                children,
                locks: HashMap::new(),
                next_ino: Self::ROOT + 1,
            }),
            faults: FaultInjector::new(),
            calls: NamespaceCalls::default(),
        }
    }

    /// Fault switches of this service.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Call counters of this service.
    pub fn calls(&self) -> &NamespaceCalls {
        &self.calls
    }

    /// Adds a directory owned by root without going through the fault layer.
    pub fn seed_dir(&self, parent: u64, name: &str, perm: u32) -> u64 {
        self.seed(parent, name, S_IFDIR | perm, 0, Cookie::NONE)
    }

    /// Adds a regular file owned by root without going through the fault layer.
    pub fn seed_file(&self, parent: u64, name: &str, perm: u32, size: u64, cookie: Cookie) -> u64 {
        self.seed(parent, name, S_IFREG | perm, size, cookie)
    }

    fn seed(&self, parent: u64, name: &str, mode: u32, size: u64, cookie: Cookie) -> u64 {
        let now = Timespec::now();
        let mut state = self.state.lock();
        let ino = state.next_ino;
        state.next_ino += 1;
        let is_dir = mode & S_IFDIR == S_IFDIR;
        state.entries.insert(
            ino,
            RemoteEntry {
                remote_ino: ino,
                remote_parent: parent,
                name: name.to_string(),
                mode,
                size,
                nlink: if is_dir { 2 } else { 1 },
                atime: now,
                mtime: now,
                ctime: now,
                btime: now,
                cookie,
                ..RemoteEntry::default()
            },
        );
        if is_dir {
            state.children.insert(ino, BTreeMap::new());
        }
        state
            .children
            .entry(parent)
            .or_default()
            .insert(name.to_string(), ino);
        ino
    }

    /// Replaces an entry's attributes directly, as another client would.
    pub fn modify(&self, remote_ino: u64, f: impl FnOnce(&mut RemoteEntry)) {
        if let Some(entry) = self.state.lock().entries.get_mut(&remote_ino) {
            f(entry);
        }
    }

    /// Snapshot of one entry.
    pub fn entry(&self, remote_ino: u64) -> Option<RemoteEntry> {
        self.state.lock().entries.get(&remote_ino).cloned()
    }

    /// Remote id bound to `name` in `parent`.
    pub fn child(&self, parent: u64, name: &str) -> Option<u64> {
        self.state
            .lock()
            .children
            .get(&parent)
            .and_then(|c| c.get(name).copied())
    }

    /// Names inside `parent`, sorted.
    pub fn names(&self, parent: u64) -> Vec<String> {
        self.state
            .lock()
            .children
            .get(&parent)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entries including the root.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True if only the root exists.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl Default for MemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteNamespace for MemoryNamespace {
    fn lookup_entry(&self, remote_parent: u64, name: &str) -> Result<RemoteEntry, RemoteError> {
        NamespaceCalls::bump(&self.calls.lookups);
        self.faults.check("lookup")?;
        let state = self.state.lock();
        let ino = state
            .dir_children(remote_parent)?
            .get(name)
            .copied()
            .ok_or(RemoteError::NotFound)?;
        state.entries.get(&ino).cloned().ok_or(RemoteError::NotFound)
    }

    fn get_entry(&self, remote_ino: u64) -> Result<RemoteEntry, RemoteError> {
        NamespaceCalls::bump(&self.calls.gets);
        self.faults.check("get")?;
        self.state
            .lock()
            .entries
            .get(&remote_ino)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    fn list_children(&self, remote_ino: u64) -> Result<Vec<RemoteEntry>, RemoteError> {
        NamespaceCalls::bump(&self.calls.listings);
        self.faults.check("list")?;
        let state = self.state.lock();
        let children = state.dir_children(remote_ino)?;
        Ok(children
            .values()
            .filter_map(|ino| state.entries.get(ino).cloned())
            .collect())
    }

    fn create_entry(&self, authid: &str, entry: &RemoteEntry) -> Result<RemoteEntry, RemoteError> {
        NamespaceCalls::bump(&self.calls.creates);
        self.faults.check("create")?;
        let mut state = self.state.lock();
        if state.dir_children(entry.remote_parent)?.contains_key(&entry.name) {
            return Err(RemoteError::AlreadyExists);
        }
        if let Some(target) = entry.hardlink_of {
            match state.entries.get_mut(&target) {
                None => return Err(RemoteError::NotFound),
                Some(t) if t.is_dir() => return Err(RemoteError::IsADirectory),
                Some(t) => t.nlink += 1,
            }
        }

        let ino = state.next_ino;
        state.next_ino += 1;
        let mut created = entry.clone();
        created.remote_ino = ino;
        if created.is_dir() {
            state.children.insert(ino, BTreeMap::new());
        }
        state
            .children
            .entry(entry.remote_parent)
            .or_default()
            .insert(entry.name.clone(), ino);
        state.entries.insert(ino, created.clone());
        trace!(authid, ino, name = %entry.name, "memory namespace create");
        Ok(created)
    }

    fn update_entry(&self, authid: &str, entry: &RemoteEntry) -> Result<(), RemoteError> {
        NamespaceCalls::bump(&self.calls.updates);
        self.faults.check("update")?;
        let mut state = self.state.lock();
        let existing = state
            .entries
            .get_mut(&entry.remote_ino)
            .ok_or(RemoteError::NotFound)?;
        // Structure (parent, name, link count) is owned by the namespace.
        existing.mode = entry.mode;
        existing.uid = entry.uid;
        existing.gid = entry.gid;
        existing.size = entry.size;
        existing.atime = entry.atime;
        existing.mtime = entry.mtime;
        existing.ctime = entry.ctime;
        existing.xattrs.clone_from(&entry.xattrs);
        existing.cookie = entry.cookie;
        trace!(authid, ino = entry.remote_ino, "memory namespace update");
        Ok(())
    }

    fn delete_entry(
        &self,
        authid: &str,
        remote_parent: u64,
        name: &str,
    ) -> Result<(), RemoteError> {
        NamespaceCalls::bump(&self.calls.deletes);
        self.faults.check("delete")?;
        let mut state = self.state.lock();
        let ino = state
            .dir_children(remote_parent)?
            .get(name)
            .copied()
            .ok_or(RemoteError::NotFound)?;
        let entry = state.entries.get(&ino).ok_or(RemoteError::NotFound)?;
        if entry.is_dir() && state.children.get(&ino).is_some_and(|c| !c.is_empty()) {
            return Err(RemoteError::NotEmpty);
        }
        if !entry.is_dir() && entry.hardlink_of.is_none() && entry.nlink > 1 {
            return Err(RemoteError::Invalid(format!(
                "{name} is still referenced by {} hard links",
                entry.nlink - 1
            )));
        }
        if let Some(c) = state.children.get_mut(&remote_parent) {
            c.remove(name);
        }
        state.remove_entry(ino);
        trace!(authid, ino, name, "memory namespace delete");
        Ok(())
    }

    fn rename_entry(&self, authid: &str, request: &RenameRequest<'_>) -> Result<(), RemoteError> {
        NamespaceCalls::bump(&self.calls.renames);
        self.faults.check("rename")?;
        let mut state = self.state.lock();
        let current = state.dir_children(request.src_parent)?.get(request.src_name).copied();
        if current != Some(request.remote_ino) {
            return Err(RemoteError::NotFound);
        }
        let moving_dir = state
            .entries
            .get(&request.remote_ino)
            .is_some_and(RemoteEntry::is_dir);

        if let Some(existing) = state.dir_children(request.dst_parent)?.get(request.dst_name).copied()
        {
            if existing == request.remote_ino {
                return Ok(());
            }
            let existing_is_dir = state.entries.get(&existing).is_some_and(RemoteEntry::is_dir);
            match (moving_dir, existing_is_dir) {
                (true, false) => return Err(RemoteError::NotADirectory),
                (false, true) => return Err(RemoteError::IsADirectory),
                (true, true) if state.children.get(&existing).is_some_and(|c| !c.is_empty()) => {
                    return Err(RemoteError::NotEmpty);
                }
                _ => {}
            }
            state.remove_entry(existing);
        }

        if let Some(c) = state.children.get_mut(&request.src_parent) {
            c.remove(request.src_name);
        }
        state
            .children
            .entry(request.dst_parent)
            .or_default()
            .insert(request.dst_name.to_string(), request.remote_ino);
        if let Some(e) = state.entries.get_mut(&request.remote_ino) {
            e.remote_parent = request.dst_parent;
            e.name = request.dst_name.to_string();
        }
        trace!(authid, ino = request.remote_ino, to = request.dst_name, "memory namespace rename");
        Ok(())
    }

    fn get_lock(
        &self,
        remote_ino: u64,
        owner: u64,
        lock: &FileLock,
    ) -> Result<Option<FileLock>, RemoteError> {
        NamespaceCalls::bump(&self.calls.locks);
        self.faults.check("getlk")?;
        let state = self.state.lock();
        Ok(state.locks.get(&remote_ino).and_then(|held| {
            held.iter()
                .find(|h| h.owner != owner && h.lock.conflicts_with(lock))
                .map(|h| h.lock)
        }))
    }

    fn set_lock(&self, remote_ino: u64, owner: u64, lock: &FileLock) -> Result<(), RemoteError> {
        NamespaceCalls::bump(&self.calls.locks);
        self.faults.check("setlk")?;
        let mut state = self.state.lock();
        if !state.entries.contains_key(&remote_ino) {
            return Err(RemoteError::NotFound);
        }
        let held = state.locks.entry(remote_ino).or_default();
        if lock.kind == LockKind::Unlock {
            held.retain(|h| h.owner != owner || !h.lock.overlaps(lock));
            return Ok(());
        }
        if held
            .iter()
            .any(|h| h.owner != owner && h.lock.conflicts_with(lock))
        {
            return Err(RemoteError::LockConflict);
        }
        held.retain(|h| h.owner != owner || !h.lock.overlaps(lock));
        held.push(HeldLock { owner, lock: *lock });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_spec(parent: u64, name: &str) -> RemoteEntry {
        RemoteEntry {
            remote_parent: parent,
            name: name.to_string(),
            mode: S_IFREG | 0o644,
            nlink: 1,
            ..RemoteEntry::default()
        }
    }

    #[test]
    fn test_create_rejects_duplicate_names() {
        let ns = MemoryNamespace::new();
        ns.create_entry("a", &file_spec(MemoryNamespace::ROOT, "f")).unwrap();
        let err = ns
            .create_entry("a", &file_spec(MemoryNamespace::ROOT, "f"))
            .unwrap_err();
        assert_eq!(err, RemoteError::AlreadyExists);
    }

    #[test]
    fn test_delete_non_empty_directory_fails() {
        let ns = MemoryNamespace::new();
        let dir = ns.seed_dir(MemoryNamespace::ROOT, "d", 0o755);
        ns.seed_file(dir, "f", 0o644, 0, Cookie::NONE);
        assert_eq!(
            ns.delete_entry("a", MemoryNamespace::ROOT, "d"),
            Err(RemoteError::NotEmpty)
        );
    }

    #[test]
    fn test_hardlink_counts() {
        let ns = MemoryNamespace::new();
        let target = ns.seed_file(MemoryNamespace::ROOT, "f", 0o644, 0, Cookie::NONE);
        let mut link = file_spec(MemoryNamespace::ROOT, "g");
        link.hardlink_of = Some(target);
        ns.create_entry("a", &link).unwrap();
        assert_eq!(ns.entry(target).unwrap().nlink, 2);

        // The primary name cannot go while the link exists.
        assert!(ns.delete_entry("a", MemoryNamespace::ROOT, "f").is_err());

        ns.delete_entry("a", MemoryNamespace::ROOT, "g").unwrap();
        assert_eq!(ns.entry(target).unwrap().nlink, 1);
        ns.delete_entry("a", MemoryNamespace::ROOT, "f").unwrap();
        assert!(ns.entry(target).is_none());
    }

    #[test]
    fn test_rename_replaces_file() {
        let ns = MemoryNamespace::new();
        let a = ns.seed_file(MemoryNamespace::ROOT, "a", 0o644, 1, Cookie::NONE);
        let b = ns.seed_file(MemoryNamespace::ROOT, "b", 0o644, 2, Cookie::NONE);
        ns.rename_entry(
            "x",
            &RenameRequest {
                remote_ino: a,
                src_parent: MemoryNamespace::ROOT,
                src_name: "a",
                dst_parent: MemoryNamespace::ROOT,
                dst_name: "b",
            },
        )
        .unwrap();
        assert_eq!(ns.child(MemoryNamespace::ROOT, "b"), Some(a));
        assert!(ns.entry(b).is_none());
        assert_eq!(ns.names(MemoryNamespace::ROOT), vec!["b".to_string()]);
    }

    #[test]
    fn test_locks_conflict_between_owners() {
        let ns = MemoryNamespace::new();
        let f = ns.seed_file(MemoryNamespace::ROOT, "f", 0o644, 0, Cookie::NONE);
        let write = FileLock { kind: LockKind::Write, start: 0, len: 0, pid: 1 };
        ns.set_lock(f, 1, &write).unwrap();
        assert_eq!(ns.set_lock(f, 2, &write), Err(RemoteError::LockConflict));
        assert_eq!(ns.get_lock(f, 2, &write).unwrap(), Some(write));

        let unlock = FileLock { kind: LockKind::Unlock, ..write };
        ns.set_lock(f, 1, &unlock).unwrap();
        ns.set_lock(f, 2, &write).unwrap();
    }
}
