//! Thread-safe table of open handles.
//!
//! Open files and directories are handed to the kernel as `u64` handles.
//! The table hands out `Arc` clones so callers never hold a map shard lock
//! while they block on remote I/O for that handle.
//!
//! # Handle Lifecycle
//!
//! 1. **Insert**: `insert` allocates a fresh non-zero id
//! 2. **Get**: `get` clones the shared handle out of the map
//! 3. **Remove**: `remove` detaches it; in-flight users keep their clone

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent map from handle id to a shared handle value.
///
/// Ids start at 1 and skip 0, which the kernel treats as "no handle".
///
/// # Example
///
/// ```
/// use leasefs_common::HandleTable;
///
/// let table: HandleTable<String> = HandleTable::new();
/// let fh = table.insert("open file".to_string());
/// assert_ne!(fh, 0);
///
/// let handle = table.get(fh).unwrap();
/// assert_eq!(handle.as_str(), "open file");
///
/// table.remove(fh);
/// assert!(table.get(fh).is_none());
/// // The clone taken before removal stays usable.
/// assert_eq!(handle.len(), 9);
/// ```
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, Arc<V>>,
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Stores `value` under a fresh id.
    pub fn insert(&self, value: V) -> u64 {
        let value = Arc::new(value);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.handles.entry(id) {
                slot.insert(value);
                return id;
            }
        }
    }

    /// The handle stored under `id`.
    pub fn get(&self, id: u64) -> Option<Arc<V>> {
        self.handles.get(&id).map(|h| Arc::clone(h.value()))
    }

    /// Removes and returns the handle stored under `id`.
    pub fn remove(&self, id: u64) -> Option<Arc<V>> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    /// Handles matching `predicate`, cloned out of the map.
    pub fn find_all(&self, predicate: impl Fn(&V) -> bool) -> Vec<(u64, Arc<V>)> {
        self.handles
            .iter()
            .filter(|h| predicate(h.value()))
            .map(|h| (*h.key(), Arc::clone(h.value())))
            .collect()
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if no handles are open.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
