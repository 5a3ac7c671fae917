use super::FaultInjector;
use crate::error::RemoteError;
use crate::remote::{RemoteFile, RemoteStorage};
use crate::types::Cookie;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
struct StoredFile {
    data: Vec<u8>,
    generation: Cookie,
    sessions: u32,
}

impl StoredFile {
    fn check(&self, file: RemoteFile) -> Result<(), RemoteError> {
        if file.cookie != self.generation {
            return Err(RemoteError::Stale {
                expected: file.cookie,
                found: self.generation,
            });
        }
        Ok(())
    }
}

/// Byte-stream storage kept in process memory.
///
/// Every stream carries a generation that advances on each `sync`; calls
/// presenting an older generation fail with [`RemoteError::Stale`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<u64, StoredFile>>,
    faults: FaultInjector,
    reads: AtomicU64,
    bytes_read: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault switches of this service.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Stores `data` as a fresh stream and returns its generation.
    pub fn seed(&self, remote_ino: u64, data: &[u8]) -> Cookie {
        let mut files = self.files.lock();
        let generation = files
            .get(&remote_ino)
            .map_or(Cookie::new(1), |f| f.generation.next());
        files.insert(
            remote_ino,
            StoredFile {
                data: data.to_vec(),
                generation,
                sessions: 0,
            },
        );
        generation
    }

    /// Advances the generation as a writer on another client would.
    pub fn bump_generation(&self, remote_ino: u64) -> Option<Cookie> {
        let mut files = self.files.lock();
        let file = files.get_mut(&remote_ino)?;
        file.generation = file.generation.next();
        Some(file.generation)
    }

    /// Current content of a stream.
    pub fn contents(&self, remote_ino: u64) -> Option<Vec<u8>> {
        self.files.lock().get(&remote_ino).map(|f| f.data.clone())
    }

    /// Current generation of a stream.
    pub fn generation(&self, remote_ino: u64) -> Option<Cookie> {
        self.files.lock().get(&remote_ino).map(|f| f.generation)
    }

    /// Number of open sessions on a stream.
    pub fn sessions(&self, remote_ino: u64) -> u32 {
        self.files.lock().get(&remote_ino).map_or(0, |f| f.sessions)
    }

    /// Number of `read` calls served.
    pub fn read_calls(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Bytes returned by `read`.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Number of `write` calls accepted.
    pub fn write_calls(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl RemoteStorage for MemoryStorage {
    fn open(&self, remote_ino: u64, _writable: bool) -> Result<Cookie, RemoteError> {
        self.faults.check("open")?;
        let mut files = self.files.lock();
        let file = files.entry(remote_ino).or_insert_with(|| StoredFile {
            data: Vec::new(),
            generation: Cookie::new(1),
            sessions: 0,
        });
        file.sessions += 1;
        Ok(file.generation)
    }

    fn read(&self, file: RemoteFile, offset: u64, len: usize) -> Result<Bytes, RemoteError> {
        self.faults.check("read")?;
        let files = self.files.lock();
        let stored = files.get(&file.remote_ino).ok_or(RemoteError::NotFound)?;
        stored.check(file)?;
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(stored.data.len());
        let end = start.saturating_add(len).min(stored.data.len());
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read
            .fetch_add((end - start) as u64, Ordering::Relaxed);
        Ok(Bytes::copy_from_slice(&stored.data[start..end]))
    }

    fn write(&self, file: RemoteFile, offset: u64, data: &[u8]) -> Result<(), RemoteError> {
        self.faults.check("write")?;
        let mut files = self.files.lock();
        let stored = files.get_mut(&file.remote_ino).ok_or(RemoteError::NotFound)?;
        stored.check(file)?;
        let start = usize::try_from(offset)
            .map_err(|_| RemoteError::Invalid(format!("offset {offset} out of range")))?;
        let end = start + data.len();
        if stored.data.len() < end {
            stored.data.resize(end, 0);
        }
        stored.data[start..end].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn truncate(&self, file: RemoteFile, size: u64) -> Result<(), RemoteError> {
        self.faults.check("truncate")?;
        let mut files = self.files.lock();
        let stored = files.get_mut(&file.remote_ino).ok_or(RemoteError::NotFound)?;
        stored.check(file)?;
        let size = usize::try_from(size)
            .map_err(|_| RemoteError::Invalid(format!("size {size} out of range")))?;
        stored.data.resize(size, 0);
        Ok(())
    }

    fn sync(&self, file: RemoteFile) -> Result<Cookie, RemoteError> {
        self.faults.check("sync")?;
        let mut files = self.files.lock();
        let stored = files.get_mut(&file.remote_ino).ok_or(RemoteError::NotFound)?;
        stored.check(file)?;
        stored.generation = stored.generation.next();
        Ok(stored.generation)
    }

    fn close(&self, file: RemoteFile) -> Result<(), RemoteError> {
        self.faults.check("close")?;
        if let Some(stored) = self.files.lock().get_mut(&file.remote_ino) {
            stored.sessions = stored.sessions.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_within_generation() {
        let storage = MemoryStorage::new();
        let cookie = storage.open(7, true).unwrap();
        let file = RemoteFile { remote_ino: 7, cookie };
        storage.write(file, 4, b"data").unwrap();
        assert_eq!(storage.read(file, 0, 16).unwrap().as_ref(), b"\0\0\0\0data");
        assert_eq!(storage.read(file, 100, 4).unwrap().len(), 0);
    }

    #[test]
    fn test_sync_advances_generation() {
        let storage = MemoryStorage::new();
        let cookie = storage.seed(3, b"abc");
        let file = RemoteFile { remote_ino: 3, cookie };
        let next = storage.sync(file).unwrap();
        assert_eq!(next, cookie.next());

        let err = storage.read(file, 0, 3).unwrap_err();
        assert!(matches!(err, RemoteError::Stale { .. }));
        let fresh = RemoteFile { remote_ino: 3, cookie: next };
        assert_eq!(storage.read(fresh, 0, 3).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_truncate_and_sessions() {
        let storage = MemoryStorage::new();
        let cookie = storage.seed(9, b"0123456789");
        storage.open(9, false).unwrap();
        assert_eq!(storage.sessions(9), 1);
        let file = RemoteFile { remote_ino: 9, cookie };
        storage.truncate(file, 4).unwrap();
        assert_eq!(storage.contents(9).unwrap(), b"0123");
        storage.close(file).unwrap();
        assert_eq!(storage.sessions(9), 0);
    }
}
