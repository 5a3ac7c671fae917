//! Data cache: one shared [`DataContext`] per open inode.

mod context;
mod readahead;

pub use context::{AttachOutcome, DataContext};
pub use readahead::ReadAhead;

use crate::config::ReadAheadConfig;
use crate::md::MetadataRecord;
use dashmap::DashMap;
use leasefs_common::ClientStats;
use leasefs_core::RemoteStorage;
use std::sync::Arc;
use tracing::debug;

/// Process-wide map of I/O contexts keyed by local inode id.
pub struct DataCache {
    contexts: DashMap<u64, Arc<DataContext>>,
    storage: Arc<dyn RemoteStorage>,
    stats: Arc<ClientStats>,
    read_ahead: ReadAheadConfig,
    write_back_threshold: u64,
}

impl std::fmt::Debug for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCache")
            .field("contexts", &self.contexts.len())
            .field("read_ahead", &self.read_ahead)
            .finish_non_exhaustive()
    }
}

impl DataCache {
    /// An empty cache over `storage`.
    pub fn new(
        storage: Arc<dyn RemoteStorage>,
        stats: Arc<ClientStats>,
        read_ahead: ReadAheadConfig,
        write_back_threshold: u64,
    ) -> Self {
        Self {
            contexts: DashMap::new(),
            storage,
            stats,
            read_ahead,
            write_back_threshold,
        }
    }

    /// The context of `record`, created on first use.
    pub fn get(&self, record: &Arc<MetadataRecord>) -> Arc<DataContext> {
        let ctx = self.contexts.entry(record.ino()).or_insert_with(|| {
            debug!(ino = record.ino(), "data context created");
            Arc::new(DataContext::new(
                Arc::clone(record),
                Arc::clone(&self.storage),
                Arc::clone(&self.stats),
                self.read_ahead.clone(),
                self.write_back_threshold,
            ))
        });
        Arc::clone(ctx.value())
    }

    /// The context of `ino` if one exists.
    pub fn lookup(&self, ino: u64) -> Option<Arc<DataContext>> {
        self.contexts.get(&ino).map(|c| Arc::clone(c.value()))
    }

    /// Drops the context of `ino` if nothing uses it.
    pub fn release(&self, ino: u64) -> bool {
        self.contexts
            .remove_if(&ino, |_, ctx| ctx.is_idle())
            .is_some()
    }

    /// Drops the context of `ino` and everything it staged.
    pub fn discard(&self, ino: u64) {
        if let Some((_, ctx)) = self.contexts.remove(&ino) {
            ctx.invalidate();
            debug!(ino, "data context discarded");
        }
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// True if no context is live.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::RecordState;
    use leasefs_core::S_IFREG;
    use leasefs_core::testing::MemoryStorage;

    #[test]
    fn test_contexts_are_shared_and_released() {
        let cache = DataCache::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(ClientStats::new()),
            ReadAheadConfig::default(),
            1 << 20,
        );
        let record = Arc::new(MetadataRecord::new(
            7,
            RecordState::new_local(1, "f", S_IFREG | 0o644, 0, 0),
        ));
        let a = cache.get(&record);
        let b = cache.get(&record);
        assert!(Arc::ptr_eq(&a, &b));

        a.attach(leasefs_core::Cookie::NONE, false);
        assert!(!cache.release(7));
        a.detach(false).unwrap();
        assert!(cache.release(7));
        assert!(cache.is_empty());
        assert!(format!("{cache:?}").starts_with("DataCache"));
    }

    #[test]
    fn test_held_peek_keeps_context() {
        let cache = DataCache::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(ClientStats::new()),
            ReadAheadConfig::default(),
            1 << 20,
        );
        let record = Arc::new(MetadataRecord::new(
            8,
            RecordState::new_local(1, "g", S_IFREG | 0o644, 0, 0),
        ));
        let ctx = cache.get(&record);
        ctx.attach(leasefs_core::Cookie::NONE, false);
        assert!(ctx.peek(0, 16).unwrap().is_empty());
        ctx.detach(false).unwrap();
        assert!(format!("{ctx:?}").starts_with("DataContext"));

        assert!(!cache.release(8));
        ctx.release_peek();
        assert!(cache.release(8));
    }
}
