use super::{FaultInjector, MemoryNamespace};
use crate::error::RemoteError;
use crate::identity::VirtualIdentity;
use crate::remote::{Grant, GrantRequest, RemoteAuthorizer, RemoteEntry};
use crate::types::AccessMask;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Quota and lifetime numbers handed out with every grant.
#[derive(Debug, Clone)]
pub struct GrantPolicy {
    /// Remaining volume quota in bytes.
    pub volume_quota: u64,
    /// Remaining inode quota.
    pub inode_quota: u64,
    /// Largest permitted file size.
    pub max_file_size: u64,
    /// Grant lifetime.
    pub lifetime: Duration,
}

impl Default for GrantPolicy {
    fn default() -> Self {
        Self {
            volume_quota: 1 << 40,
            inode_quota: 1 << 20,
            max_file_size: 1 << 40,
            lifetime: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct Overrides {
    denied: HashSet<u64>,
    masks: HashMap<u64, AccessMask>,
}

/// Authorization service deriving rights from the mode bits of a
/// [`MemoryNamespace`] entry.
#[derive(Debug)]
pub struct MemoryAuthorizer {
    namespace: Arc<MemoryNamespace>,
    policy: Mutex<GrantPolicy>,
    overrides: Mutex<Overrides>,
    faults: FaultInjector,
    grants: AtomicU64,
}

impl MemoryAuthorizer {
    /// Authorizer backed by `namespace` with the default policy.
    pub fn new(namespace: Arc<MemoryNamespace>) -> Self {
        Self {
            namespace,
            policy: Mutex::new(GrantPolicy::default()),
            overrides: Mutex::new(Overrides::default()),
            faults: FaultInjector::new(),
            grants: AtomicU64::new(0),
        }
    }

    /// Fault switches of this service.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Replaces the policy for subsequent grants.
    pub fn set_policy(&self, policy: GrantPolicy) {
        *self.policy.lock() = policy;
    }

    /// Adjusts the policy for subsequent grants.
    pub fn update_policy(&self, f: impl FnOnce(&mut GrantPolicy)) {
        f(&mut self.policy.lock());
    }

    /// Refuses every grant on `remote_ino`.
    pub fn deny(&self, remote_ino: u64) {
        self.overrides.lock().denied.insert(remote_ino);
    }

    /// Lifts a [`deny`](Self::deny).
    pub fn allow(&self, remote_ino: u64) {
        self.overrides.lock().denied.remove(&remote_ino);
    }

    /// Grants exactly `mask` on `remote_ino`, ignoring mode bits.
    pub fn set_mask(&self, remote_ino: u64, mask: AccessMask) {
        self.overrides.lock().masks.insert(remote_ino, mask);
    }

    /// Number of grants issued (successful or not).
    pub fn grant_count(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    fn rights_for(entry: &RemoteEntry, identity: &VirtualIdentity) -> AccessMask {
        let type_bit = if entry.is_dir() {
            AccessMask::DIR
        } else {
            AccessMask::NONE
        };
        if identity.sudoer {
            return AccessMask::ALL | type_bit;
        }

        let owner = identity.uid == entry.uid || identity.uid_list.contains(&entry.uid);
        let class = if owner {
            (entry.mode >> 6) & 0o7
        } else if identity.in_group(entry.gid) {
            (entry.mode >> 3) & 0o7
        } else {
            entry.mode & 0o7
        };

        let mut mask = type_bit;
        if class & 0o4 != 0 {
            mask |= AccessMask::R_OK;
        }
        if class & 0o2 != 0 {
            mask |= AccessMask::W_OK | AccessMask::D_OK | AccessMask::U_OK | AccessMask::SA_OK;
        }
        if class & 0o1 != 0 {
            mask |= AccessMask::X_OK;
        }
        if owner {
            mask |= AccessMask::M_OK | AccessMask::SU_OK | AccessMask::SA_OK;
        }
        mask
    }
}

impl RemoteAuthorizer for MemoryAuthorizer {
    fn grant(&self, request: &GrantRequest<'_>) -> Result<Grant, RemoteError> {
        let serial = self.grants.fetch_add(1, Ordering::Relaxed) + 1;
        self.faults.check("grant")?;
        let overrides = self.overrides.lock();
        if overrides.denied.contains(&request.remote_ino) {
            return Err(RemoteError::PermissionDenied);
        }
        let entry = self.namespace.entry(request.remote_ino).ok_or(RemoteError::NotFound)?;
        let mask = overrides
            .masks
            .get(&request.remote_ino)
            .copied()
            .unwrap_or_else(|| Self::rights_for(&entry, request.identity));
        drop(overrides);

        let policy = self.policy.lock().clone();
        Ok(Grant {
            authid: format!("grant-{serial:08x}"),
            mask,
            uid: request.identity.uid,
            gid: request.identity.gid,
            max_file_size: policy.max_file_size,
            volume_quota: policy.volume_quota,
            inode_quota: policy.inode_quota,
            lifetime: policy.lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cookie;

    fn request(identity: &VirtualIdentity, ino: u64) -> GrantRequest<'_> {
        GrantRequest {
            identity,
            remote_ino: ino,
            mask: AccessMask::R_OK,
            for_listing: false,
        }
    }

    #[test]
    fn test_rights_follow_mode_bits() {
        let ns = Arc::new(MemoryNamespace::new());
        let f = ns.seed_file(MemoryNamespace::ROOT, "f", 0o640, 0, Cookie::NONE);
        ns.modify(f, |e| {
            e.uid = 10;
            e.gid = 20;
        });
        let auth = MemoryAuthorizer::new(Arc::clone(&ns));

        let owner = VirtualIdentity::unix(10, 99);
        let member = VirtualIdentity::unix(11, 20);
        let other = VirtualIdentity::unix(12, 30);

        let g = auth.grant(&request(&owner, f)).unwrap();
        assert!(g.mask.contains(AccessMask::R_OK | AccessMask::W_OK | AccessMask::M_OK));
        let g = auth.grant(&request(&member, f)).unwrap();
        assert!(g.mask.contains(AccessMask::R_OK));
        assert!(!g.mask.contains(AccessMask::W_OK));
        let g = auth.grant(&request(&other, f)).unwrap();
        assert_eq!(g.mask, AccessMask::NONE);
    }

    #[test]
    fn test_sudoer_gets_everything_and_dir_flag() {
        let ns = Arc::new(MemoryNamespace::new());
        let auth = MemoryAuthorizer::new(Arc::clone(&ns));
        let g = auth
            .grant(&request(&VirtualIdentity::root(), MemoryNamespace::ROOT))
            .unwrap();
        assert!(g.mask.contains(AccessMask::ALL | AccessMask::DIR));
    }

    #[test]
    fn test_deny_and_policy() {
        let ns = Arc::new(MemoryNamespace::new());
        let auth = MemoryAuthorizer::new(Arc::clone(&ns));
        auth.update_policy(|p| p.volume_quota = 5);
        let id = VirtualIdentity::root();
        assert_eq!(auth.grant(&request(&id, MemoryNamespace::ROOT)).unwrap().volume_quota, 5);

        auth.deny(MemoryNamespace::ROOT);
        assert_eq!(
            auth.grant(&request(&id, MemoryNamespace::ROOT)),
            Err(RemoteError::PermissionDenied)
        );
        assert_eq!(auth.grant_count(), 2);
    }
}
