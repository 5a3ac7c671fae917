//! Metadata cache.
//!
//! Mirrors remote inode records under local ids and reconciles local
//! mutations with the remote namespace, either inline (synchronous) or
//! through the background [`flush`] queue (asynchronous).
//!
//! # Lookups
//!
//! A name is resolved from the parent's cached children first. Names with an
//! unacknowledged delete, names absent from a fully loaded listing, and names
//! the remote recently denied (negative cache) fail with `NotFound` without a
//! round trip.
//!
//! # Eviction
//!
//! A record leaves the cache once its lookup count and open-directory count
//! are zero and no queued mutation pins it. Evicting a live record keeps its
//! id binding so the kernel keeps seeing stable ids; evicting a deleted
//! record drops the binding for good.
//!
//! # Hard Links
//!
//! A hard link is a further name of the same record (an alias). Removing an
//! alias drops one link. Removing the primary name while aliases remain
//! renames the primary remote entry onto one alias, which the remote
//! counts as dropping a link, so no hidden name is ever left behind.
//!
//! # Lock Order
//!
//! At most one record lock is held at a time, and never across a remote
//! call.

mod flush;
mod record;

pub use record::{MetadataRecord, RecordState, SyncType};

use crate::config::ClientConfig;
use crate::error::{FsError, FsResult};
use crate::vmap::InodeMap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flush::{FlushOp, FlushQueue, Outcome};
use leasefs_common::{ClientStats, NegativeCache};
use leasefs_core::{ROOT_INO, RemoteEntry, RemoteError, RemoteNamespace, RenameRequest, Timespec};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Outcome of [`MetadataCache::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// A hard-link name was dropped; the record lives on.
    Alias,
    /// The primary name was dropped and an alias took its place.
    Promoted,
    /// The last name was dropped; the record is deleted.
    Deleted,
}

/// State shared between the cache front and the flush worker.
pub(crate) struct MdShared {
    records: DashMap<u64, Arc<MetadataRecord>>,
    vmap: Arc<InodeMap>,
    namespace: Arc<dyn RemoteNamespace>,
    negative: NegativeCache<(u64, String)>,
    stats: Arc<ClientStats>,
    attr_ttl: Duration,
    retry_initial: Duration,
    retry_max: Duration,
}

impl std::fmt::Debug for MdShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdShared")
            .field("records", &self.records.len())
            .field("negative", &self.negative)
            .finish_non_exhaustive()
    }
}

impl MdShared {
    pub(crate) fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub(crate) fn retry_schedule(&self) -> (Duration, Duration) {
        (self.retry_initial, self.retry_max)
    }

    fn record(&self, ino: u64) -> Option<Arc<MetadataRecord>> {
        self.records.get(&ino).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn is_forgotten(&self, ino: u64) -> bool {
        self.record(ino).is_none_or(|r| r.lock().is_forgotten())
    }

    fn remote_of(&self, ino: u64) -> u64 {
        self.record(ino)
            .map(|r| r.remote_ino())
            .or_else(|| self.vmap.remote(ino))
            .unwrap_or(0)
    }

    /// Performs one mutation against the remote.
    pub(crate) fn execute(&self, op: &FlushOp) -> Result<(), RemoteError> {
        match op {
            FlushOp::Create { ino, authid } => {
                let Some(rec) = self.record(*ino) else {
                    return Ok(());
                };
                let (parent, mut entry) = {
                    let s = rec.lock();
                    if s.remote_ino != 0 {
                        return Ok(());
                    }
                    (s.parent, s.to_remote(0))
                };
                entry.remote_parent = self.remote_of(parent);
                if entry.remote_parent == 0 {
                    return Err(RemoteError::Invalid(format!(
                        "parent {parent} of {} is not created",
                        entry.name
                    )));
                }
                let created = self.namespace.create_entry(authid, &entry)?;
                self.vmap.bind(*ino, created.remote_ino);
                let mut s = rec.lock();
                s.remote_ino = created.remote_ino;
                s.fetched_at = Instant::now();
                debug!(ino, remote = created.remote_ino, name = %entry.name, "remote create acknowledged");
                Ok(())
            }
            FlushOp::Update { ino, authid } => {
                let Some(rec) = self.record(*ino) else {
                    return Ok(());
                };
                let (parent, mut entry) = {
                    let mut s = rec.lock();
                    s.update_queued = false;
                    if s.remote_ino == 0 || s.is_deleted() {
                        return Ok(());
                    }
                    (s.parent, s.to_remote(0))
                };
                entry.remote_parent = self.remote_of(parent);
                self.namespace.update_entry(authid, &entry)
            }
            FlushOp::Delete {
                parent,
                name,
                authid,
                ..
            } => {
                let remote_parent = self.remote_of(*parent);
                if remote_parent == 0 {
                    return Ok(());
                }
                match self.namespace.delete_entry(authid, remote_parent, name) {
                    Err(RemoteError::NotFound) => Ok(()),
                    other => other,
                }
            }
            FlushOp::Rename {
                ino,
                entry,
                src_parent,
                src_name,
                dst_parent,
                dst_name,
                authid,
            } => {
                let remote_ino = entry.unwrap_or_else(|| self.remote_of(*ino));
                if remote_ino == 0 {
                    return Err(RemoteError::Invalid(format!("{src_name} is not created")));
                }
                let request = RenameRequest {
                    remote_ino,
                    src_parent: self.remote_of(*src_parent),
                    src_name,
                    dst_parent: self.remote_of(*dst_parent),
                    dst_name,
                };
                self.namespace.rename_entry(authid, &request)
            }
        }
    }

    fn pin(&self, op: &FlushOp) {
        if let Some(rec) = self.record(op.ino()) {
            rec.lock().pending += 1;
        }
        if let FlushOp::Delete { parent, name, .. } = op
            && let Some(prec) = self.record(*parent)
        {
            *prec.lock().todelete.entry(name.clone()).or_default() += 1;
        }
    }

    fn unpin(&self, op: &FlushOp) {
        if let FlushOp::Delete { parent, name, .. } = op
            && let Some(prec) = self.record(*parent)
        {
            {
                let mut p = prec.lock();
                if let Some(n) = p.todelete.get_mut(name) {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        p.todelete.remove(name);
                    }
                }
            }
            prec.notify();
        }
        if let Some(rec) = self.record(op.ino()) {
            {
                let mut s = rec.lock();
                s.pending = s.pending.saturating_sub(1);
            }
            rec.notify();
        }
    }

    /// Releases the pin of a finished queued operation.
    pub(crate) fn finish(&self, op: &FlushOp, outcome: Outcome) {
        let rec = self.record(op.ino());
        if let Outcome::Failed(e) = &outcome {
            self.stats.record_flush_failure();
            error!(op = op.kind(), ino = op.ino(), error = %e, "remote mutation failed");
            if let Some(rec) = &rec {
                rec.lock().last_error = Some(e.clone());
                if matches!(op, FlushOp::Create { .. }) {
                    self.rollback_create(rec);
                }
            }
        }
        self.unpin(op);
        if let Some(rec) = rec
            && rec.lock().is_forgotten()
        {
            self.evict(&rec);
        }
    }

    /// Removes every local trace of a create the remote refused.
    fn rollback_create(&self, rec: &MetadataRecord) {
        let (parent, name) = {
            let mut s = rec.lock();
            s.mark_deleted();
            (s.parent, s.name.clone())
        };
        if let Some(prec) = self.record(parent) {
            let mut p = prec.lock();
            if p.children.get(&name) == Some(&rec.ino()) {
                p.children.remove(&name);
            }
        }
    }

    /// Drops `rec` from the cache if nothing references it.
    pub(crate) fn evict(&self, rec: &Arc<MetadataRecord>) -> bool {
        let ino = rec.ino();
        if ino == ROOT_INO {
            return false;
        }
        let (parent, name, deleted, aliases) = {
            let mut s = rec.lock();
            if !s.is_evictable() {
                if s.lookup_count == 0 && s.opendir_count == 0 {
                    s.forgotten = true;
                }
                return false;
            }
            (s.parent, s.name.clone(), s.is_deleted(), s.aliases.clone())
        };
        if self
            .records
            .remove_if(&ino, |_, r| Arc::ptr_eq(r, rec))
            .is_none()
        {
            return false;
        }
        if deleted {
            self.vmap.forget(ino);
        } else {
            let names = std::iter::once((parent, name)).chain(aliases.into_iter().map(|a| (a.parent, a.name)));
            for (parent, name) in names {
                if let Some(prec) = self.record(parent) {
                    let mut p = prec.lock();
                    if p.children.get(&name) == Some(&ino) {
                        p.children.remove(&name);
                        if p.sync == SyncType::ListingLoaded {
                            p.sync = SyncType::Plain;
                        }
                    }
                }
            }
        }
        self.stats.md_cache_stats().record_eviction();
        self.stats.md_cache_stats().record_remove();
        debug!(ino, deleted, "metadata record evicted");
        true
    }
}

/// Process-wide cache of metadata records.
#[derive(Debug)]
pub struct MetadataCache {
    shared: Arc<MdShared>,
    queue: FlushQueue,
    sync_timeout: Duration,
}

impl MetadataCache {
    /// A cache holding the mount root, built from the remote root entry.
    pub fn new(
        config: &ClientConfig,
        namespace: Arc<dyn RemoteNamespace>,
        vmap: Arc<InodeMap>,
        stats: Arc<ClientStats>,
        root: &RemoteEntry,
    ) -> FsResult<Self> {
        let records = DashMap::new();
        records.insert(
            ROOT_INO,
            Arc::new(MetadataRecord::new(
                ROOT_INO,
                RecordState::from_remote(ROOT_INO, root),
            )),
        );
        stats.md_cache_stats().record_insert();
        let shared = Arc::new(MdShared {
            records,
            vmap,
            namespace,
            negative: NegativeCache::new(config.negative_lookup_ttl),
            stats,
            attr_ttl: config.attr_ttl,
            retry_initial: config.flush_retry_initial,
            retry_max: config.flush_retry_max,
        });
        let queue = FlushQueue::start(Arc::clone(&shared))?;
        Ok(Self {
            shared,
            queue,
            sync_timeout: config.sync_timeout,
        })
    }

    /// The cached record of `ino`, without any remote call.
    pub fn record(&self, ino: u64) -> Option<Arc<MetadataRecord>> {
        self.shared.record(ino)
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.shared.records.len()
    }

    /// True if no record is cached (never the case while the root lives).
    pub fn is_empty(&self) -> bool {
        self.shared.records.is_empty()
    }

    /// Queued mutations not yet picked up by the worker.
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// The record of `ino`, fetched from the remote if absent or stale.
    pub fn get(&self, ino: u64) -> FsResult<Arc<MetadataRecord>> {
        let md_stats = self.shared.stats.md_cache_stats();
        if let Some(rec) = self.shared.record(ino) {
            md_stats.record_hit();
            self.refresh_if_stale(&rec)?;
            return Ok(rec);
        }
        md_stats.record_miss();
        let remote = self
            .shared
            .vmap
            .remote(ino)
            .filter(|r| *r != 0)
            .ok_or(FsError::NotFound)?;
        let entry = self.shared.namespace.get_entry(remote).map_err(|e| {
            if e.is_not_found() {
                self.shared.vmap.forget(ino);
            }
            FsError::from(e)
        })?;
        let parent = if entry.remote_parent == entry.remote_ino {
            ino
        } else {
            self.shared.vmap.local_for(entry.remote_parent).0
        };
        let rec = match self.shared.records.entry(ino) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => {
                md_stats.record_insert();
                let rec = Arc::new(MetadataRecord::new(
                    ino,
                    RecordState::from_remote(parent, &entry),
                ));
                e.insert(Arc::clone(&rec));
                rec
            }
        };
        trace!(ino, remote, "metadata record fetched");
        Ok(rec)
    }

    fn refresh_if_stale(&self, rec: &Arc<MetadataRecord>) -> FsResult<()> {
        let remote = {
            let s = rec.lock();
            let stale = !s.is_deleted()
                && s.remote_ino != 0
                && s.pending == 0
                && !s.update_queued
                && s.fetched_at.elapsed() >= self.shared.attr_ttl;
            if !stale {
                return Ok(());
            }
            s.remote_ino
        };
        match self.shared.namespace.get_entry(remote) {
            Ok(entry) => {
                rec.lock().apply_remote(&entry);
                debug!(ino = rec.ino(), "metadata record refreshed");
                Ok(())
            }
            Err(RemoteError::NotFound) => {
                self.shared.rollback_create(rec);
                Err(FsError::NotFound)
            }
            Err(e) if e.is_retryable() => {
                warn!(ino = rec.ino(), error = %e, "refresh failed, serving cached record");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves `name` in `parent` and takes one kernel reference on it.
    pub fn lookup(&self, parent: u64, name: &str) -> FsResult<Arc<MetadataRecord>> {
        let rec = self.resolve(parent, name)?;
        rec.lock().take_lookup();
        Ok(rec)
    }

    /// Takes one kernel reference on `rec`, as a create reply does.
    pub fn reference(&self, rec: &MetadataRecord) {
        rec.lock().take_lookup();
    }

    /// Resolves `name` in `parent` without taking a reference.
    pub fn resolve(&self, parent: u64, name: &str) -> FsResult<Arc<MetadataRecord>> {
        let prec = self.get(parent)?;
        self.resolve_in(&prec, name)
    }

    fn resolve_in(&self, prec: &MetadataRecord, name: &str) -> FsResult<Arc<MetadataRecord>> {
        let md_stats = self.shared.stats.md_cache_stats();
        let (child, pending_delete, listed, remote_parent) = {
            let p = prec.lock();
            if p.is_deleted() {
                return Err(FsError::NotFound);
            }
            if !p.is_dir() {
                return Err(FsError::NotDirectory);
            }
            (
                p.children.get(name).copied(),
                p.has_pending_delete(name),
                p.sync == SyncType::ListingLoaded,
                p.remote_ino,
            )
        };

        if let Some(ino) = child {
            let rec = match self.shared.record(ino) {
                Some(rec) => Some(rec),
                None => self.get(ino).ok(),
            };
            if let Some(rec) = rec
                && !rec.is_deleted()
            {
                md_stats.record_hit();
                return Ok(rec);
            }
        }
        let key = (prec.ino(), name.to_string());
        if pending_delete || listed || self.shared.negative.contains(&key) || remote_parent == 0 {
            md_stats.record_hit();
            return Err(FsError::NotFound);
        }

        md_stats.record_miss();
        match self.shared.namespace.lookup_entry(remote_parent, name) {
            Ok(entry) => self.adopt(prec, name, &entry),
            Err(RemoteError::NotFound) => {
                self.shared.negative.insert(key);
                Err(FsError::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Places a remote entry named `name` under `prec`.
    fn adopt(
        &self,
        prec: &MetadataRecord,
        name: &str,
        entry: &RemoteEntry,
    ) -> FsResult<Arc<MetadataRecord>> {
        if let Some(target) = entry.hardlink_of {
            let (ino, _) = self.shared.vmap.local_for(target);
            let rec = self.get(ino)?;
            rec.lock().add_alias(prec.ino(), name, entry.remote_ino);
            prec.lock().children.insert(name.to_string(), ino);
            return Ok(rec);
        }

        let (ino, _) = self.shared.vmap.local_for(entry.remote_ino);
        let rec = match self.shared.records.entry(ino) {
            Entry::Occupied(e) => {
                let rec = Arc::clone(e.get());
                drop(e);
                let mut s = rec.lock();
                if s.apply_remote(entry) {
                    s.parent = prec.ino();
                    s.name = name.to_string();
                }
                drop(s);
                rec
            }
            Entry::Vacant(e) => {
                self.shared.stats.md_cache_stats().record_insert();
                let rec = Arc::new(MetadataRecord::new(
                    ino,
                    RecordState::from_remote(prec.ino(), entry),
                ));
                e.insert(Arc::clone(&rec));
                rec
            }
        };
        prec.lock().children.insert(name.to_string(), ino);
        Ok(rec)
    }

    /// Allocates a local id for a record built locally and caches it.
    pub fn insert(&self, state: RecordState) -> u64 {
        let ino = if state.remote_ino == 0 {
            self.shared.vmap.allocate()
        } else {
            self.shared.vmap.local_for(state.remote_ino).0
        };
        self.shared
            .records
            .insert(ino, Arc::new(MetadataRecord::new(ino, state)));
        self.shared.stats.md_cache_stats().record_insert();
        ino
    }

    /// Forgets a record that never became visible.
    fn discard(&self, ino: u64) {
        if self.shared.records.remove(&ino).is_some() {
            self.shared.stats.md_cache_stats().record_remove();
        }
        self.shared.vmap.forget(ino);
    }

    fn link_child(&self, prec: &MetadataRecord, name: &str, ino: u64) {
        {
            let mut p = prec.lock();
            p.children.insert(name.to_string(), ino);
            p.touch_dir();
        }
        self.shared.negative.remove(&(prec.ino(), name.to_string()));
    }

    /// Runs `op` inline, or pins its record and queues it.
    fn dispatch(&self, rec: &MetadataRecord, op: FlushOp, sync: bool) -> FsResult<()> {
        if sync {
            self.wait_flush(rec)?;
            return self.shared.execute(&op).map_err(FsError::from);
        }
        self.shared.pin(&op);
        if let Err(op) = self.queue.submit(op) {
            self.shared.unpin(&op);
            return Err(FsError::Io("flush queue is shut down".into()));
        }
        Ok(())
    }

    /// Links `rec` under `parent` and queues the remote create.
    pub fn add(&self, parent: &MetadataRecord, rec: &MetadataRecord, authid: &str) -> FsResult<()> {
        let name = rec.lock().name.clone();
        let op = FlushOp::Create {
            ino: rec.ino(),
            authid: authid.to_string(),
        };
        if let Err(e) = self.dispatch(rec, op, false) {
            self.discard(rec.ino());
            return Err(e);
        }
        self.link_child(parent, &name, rec.ino());
        trace!(parent = parent.ino(), ino = rec.ino(), name, "create queued");
        Ok(())
    }

    /// Creates `rec` remotely, then links it under `parent`.
    ///
    /// A rejected create leaves no trace of `rec` in the cache.
    pub fn add_sync(&self, parent: &MetadataRecord, rec: &MetadataRecord, authid: &str) -> FsResult<()> {
        let name = {
            let mut s = rec.lock();
            s.sync = SyncType::ExclusivePending;
            s.name.clone()
        };
        let result = if parent.remote_ino() == 0 {
            self.wait_flush(parent)
        } else {
            Ok(())
        }
        .and_then(|()| {
            let op = FlushOp::Create {
                ino: rec.ino(),
                authid: authid.to_string(),
            };
            self.dispatch(rec, op, true)
        });
        if let Err(e) = result {
            self.discard(rec.ino());
            return Err(e);
        }
        rec.lock().sync = SyncType::Plain;
        self.link_child(parent, &name, rec.ino());
        trace!(parent = parent.ino(), ino = rec.ino(), name, "create acknowledged");
        Ok(())
    }

    /// Adds `name` in `parent` as a hard link to `target`. Always synchronous.
    pub fn add_link(
        &self,
        parent: &MetadataRecord,
        name: &str,
        target: &MetadataRecord,
        authid: &str,
    ) -> FsResult<()> {
        if parent.remote_ino() == 0 {
            self.wait_flush(parent)?;
        }
        self.wait_flush(target)?;
        let entry = {
            let s = target.lock();
            RemoteEntry {
                remote_parent: parent.remote_ino(),
                name: name.to_string(),
                mode: s.mode,
                uid: s.uid,
                gid: s.gid,
                nlink: 1,
                hardlink_of: Some(s.remote_ino),
                ..RemoteEntry::default()
            }
        };
        let created = self.shared.namespace.create_entry(authid, &entry)?;
        {
            let mut s = target.lock();
            s.nlink += 1;
            s.ctime = Timespec::now();
            s.add_alias(parent.ino(), name, created.remote_ino);
        }
        self.link_child(parent, name, target.ino());
        debug!(target = target.ino(), parent = parent.ino(), name, "hard link created");
        Ok(())
    }

    /// Finds the hard-link names of `rec` inside `prec` on the remote.
    fn discover_aliases(&self, prec: &MetadataRecord, rec: &MetadataRecord) -> FsResult<()> {
        let remote_parent = prec.remote_ino();
        let remote_ino = rec.remote_ino();
        if remote_parent == 0 || remote_ino == 0 {
            return Ok(());
        }
        let entries = self.shared.namespace.list_children(remote_parent)?;
        for entry in entries.iter().filter(|e| e.hardlink_of == Some(remote_ino)) {
            rec.lock().add_alias(prec.ino(), &entry.name, entry.remote_ino);
            prec.lock().children.insert(entry.name.clone(), rec.ino());
        }
        Ok(())
    }

    /// Unlinks `name` from `parent`.
    ///
    /// Hard-link cases always run synchronously; a plain delete runs inline
    /// when `sync` is set and is queued otherwise.
    pub fn remove(
        &self,
        parent: u64,
        name: &str,
        authid: &str,
        sync: bool,
    ) -> FsResult<(Removal, Arc<MetadataRecord>)> {
        let prec = self.get(parent)?;
        let rec = self.resolve_in(&prec, name)?;
        let (alias, nlink, is_dir) = {
            let s = rec.lock();
            (s.find_alias(parent, name).is_some(), s.nlink, s.is_dir())
        };

        if alias {
            let op = FlushOp::Delete {
                ino: rec.ino(),
                parent,
                name: name.to_string(),
                authid: authid.to_string(),
            };
            self.dispatch(&rec, op, true)?;
            {
                let mut s = rec.lock();
                if let Some(i) = s.find_alias(parent, name) {
                    s.aliases.remove(i);
                }
                s.nlink = s.nlink.saturating_sub(1);
                s.ctime = Timespec::now();
            }
            self.unlink_child(&prec, name);
            debug!(parent, name, ino = rec.ino(), "hard link removed");
            return Ok((Removal::Alias, rec));
        }

        if !is_dir && nlink > 1 {
            if rec.lock().aliases.is_empty() {
                self.discover_aliases(&prec, &rec)?;
            }
            let promoted = rec.lock().aliases.first().cloned();
            if let Some(promoted) = promoted {
                let op = FlushOp::Rename {
                    ino: rec.ino(),
                    entry: None,
                    src_parent: parent,
                    src_name: name.to_string(),
                    dst_parent: promoted.parent,
                    dst_name: promoted.name.clone(),
                    authid: authid.to_string(),
                };
                self.dispatch(&rec, op, true)?;
                {
                    let mut s = rec.lock();
                    s.aliases.retain(|a| a != &promoted);
                    s.nlink = s.nlink.saturating_sub(1);
                    s.parent = promoted.parent;
                    s.name.clone_from(&promoted.name);
                    s.ctime = Timespec::now();
                }
                self.unlink_child(&prec, name);
                debug!(parent, name, ino = rec.ino(), promoted = %promoted.name, "hard link promoted");
                return Ok((Removal::Promoted, rec));
            }
        }

        let op = FlushOp::Delete {
            ino: rec.ino(),
            parent,
            name: name.to_string(),
            authid: authid.to_string(),
        };
        self.dispatch(&rec, op, sync)?;
        rec.lock().mark_deleted();
        self.unlink_child(&prec, name);
        debug!(parent, name, ino = rec.ino(), sync, "record deleted");
        Ok((Removal::Deleted, rec))
    }

    fn unlink_child(&self, prec: &MetadataRecord, name: &str) {
        let mut p = prec.lock();
        p.children.remove(name);
        p.touch_dir();
    }

    /// Renames `src_name` in `src_parent` to `dst_name` in `dst_parent`.
    ///
    /// The caller holds both parent monitors. Returns the record that was
    /// replaced at the destination, if any.
    pub fn mv(
        &self,
        src_parent: u64,
        src_name: &str,
        dst_parent: u64,
        dst_name: &str,
        authid: &str,
        sync: bool,
    ) -> FsResult<Option<Arc<MetadataRecord>>> {
        let sprec = self.get(src_parent)?;
        let dprec = self.get(dst_parent)?;
        let rec = self.resolve_in(&sprec, src_name)?;
        let replaced = match self.resolve_in(&dprec, dst_name) {
            Ok(existing) => Some(existing),
            Err(FsError::NotFound) => None,
            Err(e) => return Err(e),
        };

        if let Some(existing) = &replaced {
            if Arc::ptr_eq(existing, &rec) {
                return Ok(None);
            }
            let moving_dir = rec.lock().is_dir();
            let existing_dir = existing.lock().is_dir();
            match (moving_dir, existing_dir) {
                (true, false) => return Err(FsError::NotDirectory),
                (false, true) => return Err(FsError::IsDirectory),
                (true, true) => {
                    self.load_listing(existing)?;
                    if !existing.lock().children.is_empty() {
                        return Err(FsError::NotEmpty);
                    }
                }
                (false, false) => {}
            }
        }
        if rec.lock().is_dir() && self.is_ancestor(rec.ino(), dst_parent) {
            return Err(FsError::InvalidArgument("cannot move a directory below itself"));
        }

        self.wait_flush(&rec)?;
        let alias = {
            let s = rec.lock();
            s.find_alias(src_parent, src_name)
                .map(|i| s.aliases[i].remote_ino)
        };
        let op = FlushOp::Rename {
            ino: rec.ino(),
            entry: alias,
            src_parent,
            src_name: src_name.to_string(),
            dst_parent,
            dst_name: dst_name.to_string(),
            authid: authid.to_string(),
        };
        self.dispatch(&rec, op, sync)?;

        self.unlink_child(&sprec, src_name);
        self.link_child(&dprec, dst_name, rec.ino());
        {
            let mut s = rec.lock();
            match s.find_alias(src_parent, src_name) {
                Some(i) => {
                    s.aliases[i].parent = dst_parent;
                    s.aliases[i].name = dst_name.to_string();
                }
                None => {
                    s.parent = dst_parent;
                    s.name = dst_name.to_string();
                }
            }
            s.ctime = Timespec::now();
        }
        if let Some(existing) = &replaced {
            let mut e = existing.lock();
            match e.find_alias(dst_parent, dst_name) {
                Some(i) => {
                    e.aliases.remove(i);
                    e.nlink = e.nlink.saturating_sub(1);
                }
                None => e.mark_deleted(),
            }
        }
        debug!(src_parent, src_name, dst_parent, dst_name, ino = rec.ino(), sync, "record renamed");
        Ok(replaced)
    }

    fn is_ancestor(&self, ancestor: u64, mut ino: u64) -> bool {
        loop {
            if ino == ancestor {
                return true;
            }
            if ino == ROOT_INO {
                return false;
            }
            match self.shared.record(ino) {
                Some(rec) => ino = rec.lock().parent,
                None => return false,
            }
        }
    }

    /// Queues the current attributes of `rec`; consecutive updates coalesce.
    pub fn update(&self, rec: &MetadataRecord, authid: &str) -> FsResult<()> {
        {
            let mut s = rec.lock();
            if s.update_queued {
                return Ok(());
            }
            s.update_queued = true;
        }
        let op = FlushOp::Update {
            ino: rec.ino(),
            authid: authid.to_string(),
        };
        self.dispatch(rec, op, false).inspect_err(|_| {
            rec.lock().update_queued = false;
        })
    }

    /// Pushes the current attributes of `rec` inline.
    pub fn update_sync(&self, rec: &MetadataRecord, authid: &str) -> FsResult<()> {
        let op = FlushOp::Update {
            ino: rec.ino(),
            authid: authid.to_string(),
        };
        self.dispatch(rec, op, true)
    }

    /// Blocks until every queued mutation of `rec` is acknowledged.
    ///
    /// A mutation that failed for good is reported once.
    pub fn wait_flush(&self, rec: &MetadataRecord) -> FsResult<()> {
        let deadline = Instant::now() + self.sync_timeout;
        if !rec.wait_until(deadline, |s| s.pending == 0) {
            warn!(ino = rec.ino(), "timed out waiting for remote acknowledgement");
            return Err(FsError::Timeout("flush"));
        }
        match rec.lock().last_error.take() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Blocks until a queued delete of `name` in `parent` is acknowledged.
    pub fn wait_deleted(&self, parent: &MetadataRecord, name: &str) -> FsResult<()> {
        let deadline = Instant::now() + self.sync_timeout;
        if parent.wait_until(deadline, |s| !s.has_pending_delete(name)) {
            Ok(())
        } else {
            warn!(parent = parent.ino(), name, "timed out waiting for remote delete");
            Err(FsError::Timeout("delete"))
        }
    }

    /// Drops `n` kernel references of `ino`; returns true if it was evicted.
    pub fn forget(&self, ino: u64, n: u64) -> bool {
        let Some(rec) = self.shared.record(ino) else {
            return false;
        };
        {
            let mut s = rec.lock();
            s.lookup_count = s.lookup_count.saturating_sub(n);
        }
        self.shared.evict(&rec)
    }

    /// Evicts `rec` if nothing references it any more.
    pub fn evict(&self, rec: &Arc<MetadataRecord>) -> bool {
        self.shared.evict(rec)
    }

    /// Merges the full remote listing of `dir` into its children.
    pub fn load_listing(&self, dir: &MetadataRecord) -> FsResult<()> {
        let remote = {
            let s = dir.lock();
            if !s.is_dir() {
                return Err(FsError::NotDirectory);
            }
            if s.sync == SyncType::ListingLoaded {
                return Ok(());
            }
            s.remote_ino
        };
        if remote == 0 {
            dir.lock().sync = SyncType::ListingLoaded;
            return Ok(());
        }
        let started = Instant::now();
        let entries = self.shared.namespace.list_children(remote)?;
        let mut seen = Vec::with_capacity(entries.len());
        for entry in &entries {
            if dir.lock().has_pending_delete(&entry.name) {
                continue;
            }
            self.adopt(dir, &entry.name, entry)?;
            seen.push(entry.name.clone());
        }

        let local: Vec<(String, u64)> = dir
            .lock()
            .children
            .iter()
            .map(|(n, i)| (n.clone(), *i))
            .collect();
        let gone: Vec<String> = local
            .into_iter()
            .filter(|(name, ino)| {
                !seen.contains(name)
                    && self
                        .shared
                        .record(*ino)
                        .is_none_or(|r| {
                            let s = r.lock();
                            s.remote_ino != 0 && s.pending == 0 && s.fetched_at < started
                        })
            })
            .map(|(name, _)| name)
            .collect();
        let mut s = dir.lock();
        for name in gone {
            s.children.remove(&name);
        }
        s.sync = SyncType::ListingLoaded;
        debug!(ino = dir.ino(), entries = entries.len(), "listing loaded");
        Ok(())
    }

    /// Snapshot of the children of `dir` in name order.
    pub fn listing(&self, dir: &MetadataRecord) -> Vec<(String, u64)> {
        dir.lock()
            .children
            .iter()
            .map(|(n, i)| (n.clone(), *i))
            .collect()
    }

    /// Stops the flush worker after it ran the queued mutations once.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}
