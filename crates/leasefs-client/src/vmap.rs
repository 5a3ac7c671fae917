//! Local to remote inode id mapping.
//!
//! Local ids are what the kernel sees: small, allocated by the client, root
//! fixed at [`ROOT_INO`]. Remote ids are assigned by the namespace service.
//! A record created locally is bound to remote id 0 until the remote
//! acknowledges the create.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use leasefs_core::ROOT_INO;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bidirectional map between local and remote inode ids.
#[derive(Debug)]
pub struct InodeMap {
    to_remote: DashMap<u64, u64>,
    to_local: DashMap<u64, u64>,
    next: AtomicU64,
}

impl InodeMap {
    /// A map binding the local root to `remote_root`.
    pub fn new(remote_root: u64) -> Self {
        let map = Self {
            to_remote: DashMap::new(),
            to_local: DashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        map.bind(ROOT_INO, remote_root);
        map
    }

    /// A fresh local id with no remote binding yet.
    pub fn allocate(&self) -> u64 {
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        self.to_remote.insert(ino, 0);
        ino
    }

    /// The local id of `remote`, allocating one on first sight.
    ///
    /// Returns the id and whether it was newly allocated.
    pub fn local_for(&self, remote: u64) -> (u64, bool) {
        match self.to_local.entry(remote) {
            Entry::Occupied(e) => (*e.get(), false),
            Entry::Vacant(e) => {
                let ino = self.next.fetch_add(1, Ordering::Relaxed);
                e.insert(ino);
                self.to_remote.insert(ino, remote);
                (ino, true)
            }
        }
    }

    /// Binds `local` to `remote` once the remote id is known.
    pub fn bind(&self, local: u64, remote: u64) {
        if let Some(old) = self.to_remote.insert(local, remote)
            && old != 0
            && old != remote
        {
            self.to_local.remove_if(&old, |_, l| *l == local);
        }
        if remote != 0 {
            self.to_local.insert(remote, local);
        }
    }

    /// Remote id of `local`; 0 while the create is pending.
    pub fn remote(&self, local: u64) -> Option<u64> {
        self.to_remote.get(&local).map(|r| *r)
    }

    /// Local id of `remote`, if bound.
    pub fn local(&self, remote: u64) -> Option<u64> {
        self.to_local.get(&remote).map(|l| *l)
    }

    /// Drops the binding of `local`.
    pub fn forget(&self, local: u64) {
        if local == ROOT_INO {
            return;
        }
        if let Some((_, remote)) = self.to_remote.remove(&local)
            && remote != 0
        {
            self.to_local.remove_if(&remote, |_, l| *l == local);
        }
    }

    /// Number of bound local ids.
    pub fn len(&self) -> usize {
        self.to_remote.len()
    }

    /// True if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.to_remote.is_empty()
    }
}
