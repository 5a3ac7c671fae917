//! Capability (lease) cache.
//!
//! A capability is a time-bounded grant of access bits plus quota counters,
//! issued by the remote authorizer for one directory and one identity.
//! Operations on files use the capability of their parent directory.
//!
//! # Denials
//!
//! [`CapabilityCache::acquire`] never fails: a refused or insufficient grant
//! comes back as a capability whose [`Capability::error`] is set. Outright
//! refusals (`EACCES`, `EPERM`) and insufficient grants are remembered for
//! `denied_cap_ttl`, so a caller retrying in a loop does not hammer the
//! remote. Transient failures are never remembered.
//!
//! # Quota
//!
//! Volume and inode counters live behind a per-capability lock and are
//! shared with capabilities implied for newly created subdirectories, so a
//! whole subtree draws from one grant.

use crate::error::{FsError, FsResult};
use dashmap::DashMap;
use leasefs_common::{CacheStats, TtlCache};
use leasefs_core::types::mode_is_dir;
use leasefs_core::{
    AccessMask, Grant, GrantRequest, IdentityKey, RemoteAuthorizer, RemoteError, VirtualIdentity,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Cache key: one capability per inode and identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapKey {
    /// Local inode id the capability is scoped to.
    pub ino: u64,
    /// Requesting identity.
    pub identity: IdentityKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Quota {
    volume: u64,
    inodes: u64,
}

/// A cached grant.
#[derive(Debug)]
pub struct Capability {
    key: CapKey,
    authid: String,
    mask: AccessMask,
    uid: u32,
    gid: u32,
    max_file_size: u64,
    expires: Instant,
    error: Option<FsError>,
    quota: Arc<Mutex<Quota>>,
}

impl Capability {
    fn from_grant(key: CapKey, grant: Grant, lifetime: Duration) -> Self {
        Self {
            key,
            authid: grant.authid,
            mask: grant.mask,
            uid: grant.uid,
            gid: grant.gid,
            max_file_size: grant.max_file_size,
            expires: Instant::now() + lifetime,
            error: None,
            quota: Arc::new(Mutex::new(Quota {
                volume: grant.volume_quota,
                inodes: grant.inode_quota,
            })),
        }
    }

    fn denied(key: CapKey, error: FsError) -> Self {
        Self {
            key,
            authid: String::new(),
            mask: AccessMask::NONE,
            uid: 0,
            gid: 0,
            max_file_size: 0,
            expires: Instant::now(),
            error: Some(error),
            quota: Arc::new(Mutex::new(Quota { volume: 0, inodes: 0 })),
        }
    }

    /// Local inode id the capability is scoped to.
    pub fn ino(&self) -> u64 {
        self.key.ino
    }

    /// Identity the capability was issued to.
    pub fn identity(&self) -> &IdentityKey {
        &self.key.identity
    }

    /// Id tagging remote mutations made under this capability.
    pub fn authid(&self) -> &str {
        &self.authid
    }

    /// Granted rights.
    pub fn mask(&self) -> AccessMask {
        self.mask
    }

    /// True if every bit of `mask` was granted.
    pub fn allows(&self, mask: AccessMask) -> bool {
        self.error.is_none() && self.mask.contains(mask)
    }

    /// Owner stamped on records created under this capability.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Group stamped on records created under this capability.
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Largest permitted file size.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// The refusal, if the capability was denied.
    pub fn error(&self) -> Option<&FsError> {
        self.error.as_ref()
    }

    /// `Ok` for a usable capability, the refusal otherwise.
    pub fn check(&self) -> FsResult<()> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// True once the lease ran out.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    /// Time left on the lease.
    pub fn remaining(&self) -> Duration {
        self.expires.saturating_duration_since(Instant::now())
    }

    /// Remaining volume quota in bytes.
    pub fn volume_quota(&self) -> u64 {
        self.quota.lock().volume
    }

    /// Remaining inode quota.
    pub fn inode_quota(&self) -> u64 {
        self.quota.lock().inodes
    }

    /// True if `bytes` more fit into the volume quota. Does not book them.
    pub fn has_quota(&self, bytes: u64) -> bool {
        self.error.is_none() && self.quota.lock().volume >= bytes
    }

    /// Books up to `bytes` of volume; returns what was actually booked.
    ///
    /// The counter is clamped at zero.
    pub fn book_volume(&self, bytes: u64) -> u64 {
        let mut q = self.quota.lock();
        let booked = bytes.min(q.volume);
        q.volume -= booked;
        booked
    }

    /// Returns `bytes` of volume to the quota.
    pub fn free_volume(&self, bytes: u64) {
        let mut q = self.quota.lock();
        q.volume = q.volume.saturating_add(bytes);
    }

    /// Books a signed size change. A growth that does not fit in full books
    /// nothing and fails with `QuotaExceeded`.
    pub fn adjust_volume(&self, delta: i64) -> FsResult<()> {
        let amount = delta.unsigned_abs();
        if delta < 0 {
            self.free_volume(amount);
            return Ok(());
        }
        let booked = self.book_volume(amount);
        if booked < amount {
            self.free_volume(booked);
            return Err(FsError::QuotaExceeded);
        }
        Ok(())
    }

    /// Books one inode; false if the inode quota is exhausted.
    pub fn book_inode(&self) -> bool {
        let mut q = self.quota.lock();
        if q.inodes == 0 {
            return false;
        }
        q.inodes -= 1;
        true
    }

    /// Returns one inode to the quota.
    pub fn free_inode(&self) {
        let mut q = self.quota.lock();
        q.inodes = q.inodes.saturating_add(1);
    }
}

/// Process-wide capability cache.
pub struct CapabilityCache {
    caps: DashMap<CapKey, Arc<Capability>>,
    denied: TtlCache<(CapKey, u32), FsError>,
    authorizer: Arc<dyn RemoteAuthorizer>,
    lease_time: Duration,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for CapabilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityCache")
            .field("caps", &self.caps.len())
            .field("lease_time", &self.lease_time)
            .finish_non_exhaustive()
    }
}

impl CapabilityCache {
    /// A cache asking `authorizer` on every miss.
    pub fn new(
        authorizer: Arc<dyn RemoteAuthorizer>,
        lease_time: Duration,
        denied_ttl: Duration,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            caps: DashMap::new(),
            denied: TtlCache::new(denied_ttl),
            authorizer,
            lease_time,
            stats,
        }
    }

    /// A capability of `identity` on `ino` satisfying `mask`.
    ///
    /// Cached and unexpired capabilities are returned without a remote
    /// call. The result carries an error instead of failing.
    pub fn acquire(
        &self,
        identity: &VirtualIdentity,
        ino: u64,
        remote_ino: u64,
        mask: AccessMask,
        for_listing: bool,
    ) -> Arc<Capability> {
        let key = CapKey {
            ino,
            identity: identity.key(),
        };
        if let Some(cap) = self.caps.get(&key).map(|c| Arc::clone(c.value()))
            && !cap.is_expired()
            && cap.allows(mask)
        {
            self.stats.record_hit();
            trace!(ino, ?mask, "capability hit");
            return cap;
        }
        let denial_key = (key.clone(), mask.bits());
        if let Some(error) = self.denied.get(&denial_key) {
            self.stats.record_hit();
            trace!(ino, ?mask, "cached capability denial");
            return Arc::new(Capability::denied(key, error));
        }
        self.stats.record_miss();

        if remote_ino == 0 {
            return Arc::new(Capability::denied(
                key,
                FsError::Io(format!("inode {ino} is not yet created remotely")),
            ));
        }
        let request = GrantRequest {
            identity,
            remote_ino,
            mask,
            for_listing,
        };
        match self.authorizer.grant(&request) {
            Ok(grant) => {
                let lifetime = if grant.lifetime.is_zero() {
                    self.lease_time
                } else {
                    grant.lifetime
                };
                let cap = Arc::new(Capability::from_grant(key.clone(), grant, lifetime));
                if self.caps.insert(key.clone(), Arc::clone(&cap)).is_none() {
                    self.stats.record_insert();
                }
                debug!(ino, granted = ?cap.mask(), lifetime = ?lifetime, "capability granted");
                if cap.mask().contains(mask) {
                    return cap;
                }
                let error = if mask.contains(AccessMask::DIR) && !cap.mask().contains(AccessMask::DIR) {
                    FsError::NotDirectory
                } else {
                    FsError::AccessDenied
                };
                debug!(ino, wanted = ?mask, granted = ?cap.mask(), "capability insufficient");
                self.denied.insert(denial_key, error.clone());
                Arc::new(Capability::denied(key, error))
            }
            Err(e @ (RemoteError::PermissionDenied | RemoteError::NotPermitted)) => {
                let error = if e == RemoteError::NotPermitted {
                    FsError::NotPermitted
                } else {
                    FsError::AccessDenied
                };
                debug!(ino, error = %error, "capability denied");
                self.denied.insert(denial_key, error.clone());
                Arc::new(Capability::denied(key, error))
            }
            Err(e) => {
                warn!(ino, error = %e, "capability request failed");
                Arc::new(Capability::denied(key, FsError::from(e)))
            }
        }
    }

    /// Derives a capability for a freshly created `child` from `parent`.
    ///
    /// No remote call is made; the child shares the parent's quota and
    /// expiry. The directory flag follows `mode`.
    pub fn imply(&self, parent: &Capability, authid: String, mode: u32, child: u64) -> Arc<Capability> {
        let key = CapKey {
            ino: child,
            identity: parent.key.identity.clone(),
        };
        let mask = if mode_is_dir(mode) {
            parent.mask | AccessMask::DIR
        } else {
            parent.mask.without(AccessMask::DIR)
        };
        let cap = Arc::new(Capability {
            key: key.clone(),
            authid,
            mask,
            uid: parent.uid,
            gid: parent.gid,
            max_file_size: parent.max_file_size,
            expires: parent.expires,
            error: parent.error.clone(),
            quota: Arc::clone(&parent.quota),
        });
        if cap.error.is_none() && self.caps.insert(key, Arc::clone(&cap)).is_none() {
            self.stats.record_insert();
        }
        debug!(parent = parent.ino(), child, "capability implied");
        cap
    }

    /// Drops the capability of `identity` on `ino`.
    pub fn drop_cap(&self, identity: &VirtualIdentity, ino: u64) -> bool {
        let key = CapKey {
            ino,
            identity: identity.key(),
        };
        let dropped = self.caps.remove(&key).is_some();
        self.denied
            .invalidate_where(move |(k, _)| k.ino == key.ino && k.identity == key.identity);
        if dropped {
            self.stats.record_remove();
        }
        debug!(ino, dropped, "capability dropped");
        dropped
    }

    /// Drops every capability scoped to `ino`.
    pub fn forget(&self, ino: u64) {
        let before = self.caps.len();
        self.caps.retain(|k, _| k.ino != ino);
        for _ in self.caps.len()..before {
            self.stats.record_remove();
        }
    }

    /// Drops every capability and every remembered denial.
    pub fn reset(&self) {
        let n = self.caps.len();
        self.caps.clear();
        self.denied.clear();
        for _ in 0..n {
            self.stats.record_remove();
        }
        debug!(dropped = n, "all capabilities dropped");
    }

    /// Number of cached capabilities.
    pub fn len(&self) -> usize {
        self.caps.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}
