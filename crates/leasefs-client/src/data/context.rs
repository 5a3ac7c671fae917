//! Per-file I/O context.
//!
//! One [`DataContext`] exists per open inode and is shared by every handle
//! opened on it. It holds one remote storage session, a small cache of
//! fetched blocks, the staged writes and the size bookkeeping that drives
//! quota accounting and failure recovery.
//!
//! # Sizes
//!
//! - `size`: what readers and `getattr` see, including staged writes.
//! - `remote_size`: length of the remote stream as of the last push.
//! - `stable_size`: size at attach or after the last successful flush; a
//!   failed flush reverts to it.
//! - `accounted_size`: size last booked against the volume quota.
//!
//! # Generations
//!
//! Cached blocks belong to one stream generation (cookie). Attaching with a
//! different cookie drops them and reports [`AttachOutcome::Expired`]; a read
//! that the remote rejects as stale reopens the session and retries once.

use crate::caps::Capability;
use crate::config::ReadAheadConfig;
use crate::data::readahead::ReadAhead;
use crate::error::{FsError, FsResult};
use crate::md::MetadataRecord;
use bytes::Bytes;
use leasefs_common::{ClientStats, WriteBuffer};
use leasefs_core::{Cookie, RemoteError, RemoteFile, RemoteStorage, Timespec};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What an attach found in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Nothing cached yet.
    Fresh,
    /// Cached blocks match the presented generation.
    Cached,
    /// The generation changed; cached data was dropped and the kernel data
    /// cache must not be kept.
    Expired,
}

#[derive(Debug)]
struct DataState {
    session: Option<RemoteFile>,
    attached: u32,
    writers: u32,
    cookie: Cookie,
    blocks: VecDeque<(u64, Bytes)>,
    readahead: ReadAhead,
    buffer: WriteBuffer,
    truncated_at: Option<u64>,
    remote_size: u64,
    size: u64,
    stable_size: u64,
    accounted_size: u64,
    dirty: bool,
    peeks: u32,
}

impl DataState {
    fn drop_blocks(&mut self) {
        self.blocks.clear();
        self.readahead.reset();
    }

    /// Remote bytes that are still valid to read.
    fn readable_remote(&self) -> u64 {
        self.truncated_at
            .map_or(self.remote_size, |t| t.min(self.remote_size))
    }

    fn cached(&self, offset: u64, end: u64) -> Option<Bytes> {
        self.blocks.iter().find_map(|(start, data)| {
            let block_end = start + data.len() as u64;
            (*start <= offset && end <= block_end).then(|| {
                data.slice(to_usize(offset - start)..to_usize(end - start))
            })
        })
    }
}

/// Buffered I/O state of one inode.
pub struct DataContext {
    ino: u64,
    record: Arc<MetadataRecord>,
    storage: Arc<dyn RemoteStorage>,
    stats: Arc<ClientStats>,
    write_back_threshold: u64,
    state: Mutex<DataState>,
}

impl std::fmt::Debug for DataContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContext")
            .field("ino", &self.ino)
            .field("write_back_threshold", &self.write_back_threshold)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl DataContext {
    /// A context for `record`, not attached to any session yet.
    pub fn new(
        record: Arc<MetadataRecord>,
        storage: Arc<dyn RemoteStorage>,
        stats: Arc<ClientStats>,
        read_ahead: ReadAheadConfig,
        write_back_threshold: u64,
    ) -> Self {
        let (size, cookie) = {
            let s = record.lock();
            (s.size, s.cookie)
        };
        Self {
            ino: record.ino(),
            record,
            storage,
            stats,
            write_back_threshold,
            state: Mutex::new(DataState {
                session: None,
                attached: 0,
                writers: 0,
                cookie,
                blocks: VecDeque::new(),
                readahead: ReadAhead::new(read_ahead),
                buffer: WriteBuffer::new(),
                truncated_at: None,
                remote_size: size,
                size,
                stable_size: size,
                accounted_size: size,
                dirty: false,
                peeks: 0,
            }),
        }
    }

    /// Local inode id.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// The record this context serves.
    pub fn record(&self) -> &Arc<MetadataRecord> {
        &self.record
    }

    /// Starts one handle's use of the context against generation `cookie`.
    pub fn attach(&self, cookie: Cookie, writable: bool) -> AttachOutcome {
        let record_size = self.record.lock().size;
        let mut st = self.state.lock();
        let first = st.attached == 0;
        st.attached += 1;
        if writable {
            st.writers += 1;
        }
        if first && !st.dirty {
            st.size = record_size;
            st.remote_size = record_size;
            st.stable_size = record_size;
            st.accounted_size = record_size;
        }

        let outcome = if st.cookie != cookie && !st.cookie.is_none() {
            st.drop_blocks();
            st.session = None;
            AttachOutcome::Expired
        } else if st.blocks.is_empty() {
            AttachOutcome::Fresh
        } else {
            AttachOutcome::Cached
        };
        st.cookie = cookie;
        debug!(ino = self.ino, ?cookie, ?outcome, attached = st.attached, "data context attached");
        outcome
    }

    /// Ends one handle's use; the last detach pushes dirty data and closes
    /// the remote session.
    pub fn detach(&self, writable: bool) -> FsResult<()> {
        let mut st = self.state.lock();
        st.attached = st.attached.saturating_sub(1);
        if writable {
            st.writers = st.writers.saturating_sub(1);
        }
        if st.attached > 0 {
            return Ok(());
        }
        let flushed = if st.dirty { self.flush_locked(&mut st) } else { Ok(()) };
        if let Some(file) = st.session.take()
            && let Err(e) = self.storage.close(file)
        {
            warn!(ino = self.ino, error = %e, "closing remote session failed");
        }
        debug!(ino = self.ino, "data context detached");
        flushed
    }

    /// Number of attached handles.
    pub fn attached(&self) -> u32 {
        self.state.lock().attached
    }

    /// True while writes are staged.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Current size including staged writes.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    fn session(&self, st: &mut DataState) -> FsResult<RemoteFile> {
        if let Some(file) = st.session {
            return Ok(file);
        }
        let remote_ino = self.record.remote_ino();
        if remote_ino == 0 {
            return Err(FsError::Io(format!("inode {} is not yet created remotely", self.ino)));
        }
        let cookie = self.storage.open(remote_ino, st.writers > 0)?;
        if !st.cookie.is_none() && cookie != st.cookie {
            debug!(ino = self.ino, old = ?st.cookie, new = ?cookie, "stream generation changed");
            st.drop_blocks();
        }
        st.cookie = cookie;
        self.record.lock().cookie = cookie;
        let file = RemoteFile { remote_ino, cookie };
        st.session = Some(file);
        trace!(ino = self.ino, remote_ino, ?cookie, "remote session opened");
        Ok(file)
    }

    fn fetch(&self, st: &mut DataState, offset: u64, len: u64) -> FsResult<Bytes> {
        let mut file = self.session(st)?;
        let len = to_usize(len);
        let data = match self.storage.read(file, offset, len) {
            Err(RemoteError::Stale { expected, found }) => {
                debug!(ino = self.ino, ?expected, ?found, "stale read, reopening");
                st.session = None;
                st.drop_blocks();
                file = self.session(st)?;
                self.storage.read(file, offset, len)?
            }
            other => other?,
        };
        let max = st.readahead.max_blocks().max(1);
        while st.blocks.len() >= max {
            st.blocks.pop_front();
        }
        st.blocks.push_back((offset, data.clone()));
        Ok(data)
    }

    /// Reads up to `len` bytes at `offset`, staged writes included.
    pub fn pread(&self, offset: u64, len: usize) -> FsResult<Bytes> {
        let mut st = self.state.lock();
        let end = offset.saturating_add(len as u64).min(st.size);
        if offset >= end {
            return Ok(Bytes::new());
        }
        let remote_end = end.min(st.readable_remote());
        let staged = st.buffer.end() > offset && !st.buffer.is_empty();

        if remote_end == end
            && !staged
            && let Some(hit) = st.cached(offset, end)
        {
            st.readahead.note(offset, end - offset);
            self.stats.record_read(hit.len() as u64);
            return Ok(hit);
        }

        let mut buf = vec![0u8; to_usize(end - offset)];
        if offset < remote_end {
            let chunk = match st.cached(offset, remote_end) {
                Some(hit) => hit,
                None => {
                    let want = st.readahead.plan(offset, end - offset);
                    let fetch_len = want.max(remote_end - offset).min(st.remote_size - offset);
                    let data = self.fetch(&mut st, offset, fetch_len)?;
                    let avail = data.len().min(to_usize(remote_end - offset));
                    data.slice(..avail)
                }
            };
            buf[..chunk.len()].copy_from_slice(&chunk);
        }
        st.buffer.overlay(offset, &mut buf);
        self.stats.record_read(buf.len() as u64);
        Ok(Bytes::from(buf))
    }

    /// Like [`pread`](Self::pread), but pins the result until
    /// [`release_peek`](Self::release_peek); cached blocks are handed out
    /// without copying.
    pub fn peek(&self, offset: u64, len: usize) -> FsResult<Bytes> {
        let data = self.pread(offset, len)?;
        self.state.lock().peeks += 1;
        Ok(data)
    }

    /// Releases one [`peek`](Self::peek).
    pub fn release_peek(&self) {
        let mut st = self.state.lock();
        st.peeks = st.peeks.saturating_sub(1);
    }

    /// Stages `data` at `offset`.
    ///
    /// Fails with `FileTooLarge` past the capability's size limit and with
    /// `QuotaExceeded` if the growth does not fit the volume quota; neither
    /// changes the size. Returns true once enough is staged to push early.
    pub fn pwrite(&self, cap: &Capability, offset: u64, data: &[u8]) -> FsResult<bool> {
        let end = offset.saturating_add(data.len() as u64);
        if end > cap.max_file_size() {
            return Err(FsError::FileTooLarge {
                limit: cap.max_file_size(),
            });
        }
        let mut st = self.state.lock();
        let growth = end.saturating_sub(st.size.max(st.accounted_size));
        if !cap.has_quota(growth) {
            return Err(FsError::QuotaExceeded);
        }
        st.buffer.write(offset, data);
        st.size = st.size.max(end);
        st.dirty = true;
        let size = st.size;
        let staged = st.buffer.staged_bytes();
        drop(st);

        {
            let mut r = self.record.lock();
            r.size = size;
            r.mtime = Timespec::now();
            r.ctime = r.mtime;
        }
        self.stats.record_write(data.len() as u64);
        trace!(ino = self.ino, offset, len = data.len(), staged, "write staged");
        Ok(staged >= self.write_back_threshold)
    }

    /// Sets the size to `size`, booking or freeing the difference.
    pub fn truncate(&self, cap: &Capability, size: u64) -> FsResult<()> {
        if size > cap.max_file_size() {
            return Err(FsError::FileTooLarge {
                limit: cap.max_file_size(),
            });
        }
        let mut st = self.state.lock();
        let delta = to_i64(size) - to_i64(st.accounted_size);
        cap.adjust_volume(delta)?;
        st.accounted_size = size;
        st.buffer.truncate(size);
        st.truncated_at = Some(st.truncated_at.map_or(size, |t| t.min(size)));
        st.blocks.retain(|(start, _)| *start < size);
        st.size = size;
        st.dirty = true;
        drop(st);

        let mut r = self.record.lock();
        r.size = size;
        r.mtime = Timespec::now();
        r.ctime = r.mtime;
        debug!(ino = self.ino, size, delta, "size changed");
        Ok(())
    }

    /// Books the size change since the last accounting point.
    pub fn account(&self, cap: &Capability) -> FsResult<()> {
        let mut st = self.state.lock();
        let delta = to_i64(st.size) - to_i64(st.accounted_size);
        if delta == 0 {
            return Ok(());
        }
        cap.adjust_volume(delta)?;
        st.accounted_size = st.size;
        trace!(ino = self.ino, delta, "volume accounted");
        Ok(())
    }

    /// Pushes staged data to the remote stream.
    ///
    /// On failure the staged data is dropped and the size reverts to the
    /// last stable size; the caller must invalidate kernel caches and call
    /// [`account`](Self::account) to return the dropped growth.
    pub fn flush(&self) -> FsResult<()> {
        let mut st = self.state.lock();
        self.flush_locked(&mut st)
    }

    fn flush_locked(&self, st: &mut DataState) -> FsResult<()> {
        if !st.dirty {
            return Ok(());
        }
        match self.push(st) {
            Ok(()) => {
                st.remote_size = st.size;
                st.stable_size = st.size;
                st.truncated_at = None;
                st.dirty = false;
                st.drop_blocks();
                debug!(ino = self.ino, size = st.size, "data flushed");
                Ok(())
            }
            Err(e) => {
                st.buffer.clear();
                st.truncated_at = None;
                st.dirty = false;
                st.drop_blocks();
                st.size = st.stable_size;
                st.session = None;
                self.record.lock().size = st.stable_size;
                warn!(ino = self.ino, error = %e, size = st.stable_size, "data flush failed, size reverted");
                Err(e)
            }
        }
    }

    fn push(&self, st: &mut DataState) -> FsResult<()> {
        let file = self.session(st)?;
        if let Some(t) = st.truncated_at {
            self.storage.truncate(file, t)?;
        }
        let extents = st.buffer.take_extents();
        let mut written_end = st.truncated_at.unwrap_or(st.remote_size);
        for (offset, data) in &extents {
            self.storage.write(file, *offset, data)?;
            written_end = written_end.max(offset + data.len() as u64);
        }
        if written_end < st.size {
            self.storage.truncate(file, st.size)?;
        }
        Ok(())
    }

    /// Flushes, then commits the stream; returns the new generation.
    pub fn sync(&self) -> FsResult<Cookie> {
        let mut st = self.state.lock();
        self.flush_locked(&mut st)?;
        let file = self.session(&mut st)?;
        let cookie = self.storage.sync(file)?;
        st.session = Some(RemoteFile {
            remote_ino: file.remote_ino,
            cookie,
        });
        st.cookie = cookie;
        self.record.lock().cookie = cookie;
        debug!(ino = self.ino, ?cookie, "data synced");
        Ok(cookie)
    }

    /// Drops every cached block and staged write without pushing.
    pub fn invalidate(&self) {
        let mut st = self.state.lock();
        st.drop_blocks();
        st.buffer.clear();
        st.truncated_at = None;
        st.dirty = false;
        st.size = st.stable_size;
    }

    /// True if no handle, peek or staged write needs this context.
    pub fn is_idle(&self) -> bool {
        let st = self.state.lock();
        st.attached == 0 && st.peeks == 0 && !st.dirty
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
