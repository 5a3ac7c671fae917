//! Kernel cache invalidation hooks.
//!
//! The binding layer implements [`KernelNotifier`] to drop kernel-side
//! attribute, data and dentry caches when the client learns they are stale.

use parking_lot::Mutex;

/// Receives kernel cache invalidations.
pub trait KernelNotifier: Send + Sync {
    /// Attributes and data of `ino` are stale.
    fn invalidate_inode(&self, ino: u64);

    /// The entry `name` in `parent` is stale.
    fn invalidate_entry(&self, parent: u64, name: &str);
}

/// Notifier for mounts without a kernel cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl KernelNotifier for NoopNotifier {
    fn invalidate_inode(&self, _ino: u64) {}

    fn invalidate_entry(&self, _parent: u64, _name: &str) {}
}

/// One recorded invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// From [`KernelNotifier::invalidate_inode`].
    Inode(u64),
    /// From [`KernelNotifier::invalidate_entry`].
    Entry(u64, String),
}

/// Notifier that remembers every call, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Invalidation>>,
}

impl RecordingNotifier {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invalidation so far, oldest first.
    pub fn events(&self) -> Vec<Invalidation> {
        self.events.lock().clone()
    }

    /// True if `ino` was invalidated.
    pub fn saw_inode(&self, ino: u64) -> bool {
        self.events.lock().contains(&Invalidation::Inode(ino))
    }
}

impl KernelNotifier for RecordingNotifier {
    fn invalidate_inode(&self, ino: u64) {
        self.events.lock().push(Invalidation::Inode(ino));
    }

    fn invalidate_entry(&self, parent: u64, name: &str) {
        self.events
            .lock()
            .push(Invalidation::Entry(parent, name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier() {
        let n = RecordingNotifier::new();
        n.invalidate_inode(3);
        n.invalidate_entry(1, "x");
        assert!(n.saw_inode(3));
        assert!(!n.saw_inode(1));
        assert_eq!(n.events()[1], Invalidation::Entry(1, "x".into()));
    }
}
