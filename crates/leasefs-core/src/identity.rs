//! Virtual identities and the provider that maps transport credentials.
//!
//! Every downstream check (capabilities, ownership of new records) works on a
//! [`VirtualIdentity`]. The kernel binding only knows the raw
//! [`TransportCredentials`] of the calling process; an [`IdentityProvider`]
//! turns those into an identity once per request.

use crate::error::IdentityError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// The overflow uid the kernel reports for unmapped users.
pub const OVERFLOW_ID: u32 = u32::MAX;

/// Authentication protocol the identity was established with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProtocol {
    /// Plain uid/gid trust.
    #[default]
    Unix,
    /// Kerberos ticket.
    Krb5,
    /// X.509 proxy certificate.
    Gsi,
    /// Shared-secret token.
    Sss,
    /// Bearer token.
    Oauth2,
}

impl fmt::Display for AuthProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthProtocol::Unix => "unix",
            AuthProtocol::Krb5 => "krb5",
            AuthProtocol::Gsi => "gsi",
            AuthProtocol::Sss => "sss",
            AuthProtocol::Oauth2 => "oauth2",
        };
        f.write_str(name)
    }
}

/// Identity used for every permission decision of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualIdentity {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
    /// User ids this identity may act as.
    pub uid_list: Vec<u32>,
    /// Group ids this identity is a member of.
    pub gid_list: Vec<u32>,
    /// May act on behalf of any user.
    pub sudoer: bool,
    /// How the identity was established.
    pub protocol: AuthProtocol,
    /// Application tag.
    pub app: String,
}

impl VirtualIdentity {
    /// A plain unix identity without supplementary ids.
    pub fn unix(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            uid_list: vec![uid],
            gid_list: vec![gid],
            sudoer: uid == 0,
            protocol: AuthProtocol::Unix,
            app: "fuse".to_string(),
        }
    }

    /// The superuser.
    pub fn root() -> Self {
        Self::unix(0, 0)
    }

    /// True for uid 0.
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// True if `gid` is the primary group or one of the supplementary groups.
    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.gid_list.contains(&gid)
    }

    /// Key under which per-identity state (capabilities) is cached.
    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            uid: self.uid,
            gid: self.gid,
            app: self.app.clone(),
        }
    }
}

/// Compact key identifying the requester of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
    /// Application tag.
    pub app: String,
}

/// Opaque credentials of the process issuing a filesystem call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TransportCredentials {
    /// Caller uid.
    pub uid: u32,
    /// Caller gid.
    pub gid: u32,
    /// Caller pid.
    pub pid: u32,
    /// Supplementary groups.
    pub groups: Vec<u32>,
    /// Application tag, if the binding can tell.
    pub app: Option<String>,
}

impl TransportCredentials {
    /// Credentials carrying only uid and gid.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            ..Self::default()
        }
    }

    /// Sets the caller pid.
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Sets the supplementary groups.
    #[must_use]
    pub fn with_groups(mut self, groups: Vec<u32>) -> Self {
        self.groups = groups;
        self
    }
}

/// Maps transport credentials to a virtual identity.
pub trait IdentityProvider: Send + Sync {
    /// Resolves the identity for one request.
    fn map(&self, creds: &TransportCredentials) -> Result<Arc<VirtualIdentity>, IdentityError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CredentialKey {
    uid: u32,
    gid: u32,
    groups: Vec<u32>,
    app: Option<String>,
}

/// Trusts the uid/gid reported by the kernel.
///
/// Mapped identities are shared through a small cache so repeated calls by
/// the same process reuse one allocation.
#[derive(Debug)]
pub struct UnixIdentityProvider {
    sudoers: HashSet<u32>,
    default_app: String,
    cache: DashMap<CredentialKey, Arc<VirtualIdentity>>,
}

impl UnixIdentityProvider {
    /// Creates a provider where only uid 0 is a sudoer.
    pub fn new() -> Self {
        Self {
            sudoers: HashSet::new(),
            default_app: "fuse".to_string(),
            cache: DashMap::new(),
        }
    }

    /// Grants the sudoer flag to an additional uid.
    #[must_use]
    pub fn with_sudoer(mut self, uid: u32) -> Self {
        self.sudoers.insert(uid);
        self
    }

    /// Application tag used when the credentials carry none.
    #[must_use]
    pub fn with_default_app(mut self, app: impl Into<String>) -> Self {
        self.default_app = app.into();
        self
    }

    /// Number of cached identities.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl Default for UnixIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for UnixIdentityProvider {
    fn map(&self, creds: &TransportCredentials) -> Result<Arc<VirtualIdentity>, IdentityError> {
        if creds.uid == OVERFLOW_ID || creds.gid == OVERFLOW_ID {
            return Err(IdentityError::Unmappable { uid: creds.uid });
        }

        let key = CredentialKey {
            uid: creds.uid,
            gid: creds.gid,
            groups: creds.groups.clone(),
            app: creds.app.clone(),
        };
        if let Some(found) = self.cache.get(&key) {
            return Ok(Arc::clone(&found));
        }

        let mut gid_list = vec![creds.gid];
        gid_list.extend(creds.groups.iter().copied().filter(|g| *g != creds.gid));
        let identity = Arc::new(VirtualIdentity {
            uid: creds.uid,
            gid: creds.gid,
            uid_list: vec![creds.uid],
            gid_list,
            sudoer: creds.uid == 0 || self.sudoers.contains(&creds.uid),
            protocol: AuthProtocol::Unix,
            app: creds.app.clone().unwrap_or_else(|| self.default_app.clone()),
        });
        trace!(uid = creds.uid, gid = creds.gid, sudoer = identity.sudoer, "mapped identity");

        Ok(Arc::clone(
            self.cache.entry(key).or_insert(identity).value(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_provider_maps_groups() {
        let provider = UnixIdentityProvider::new();
        let creds = TransportCredentials::new(1000, 100).with_groups(vec![100, 200, 300]);
        let id = provider.map(&creds).unwrap();

        assert_eq!(id.uid, 1000);
        assert_eq!(id.gid_list, vec![100, 200, 300]);
        assert!(id.in_group(300));
        assert!(!id.in_group(400));
        assert!(!id.sudoer);
        assert_eq!(id.app, "fuse");
    }

    #[test]
    fn test_unix_provider_sudoers() {
        let provider = UnixIdentityProvider::new().with_sudoer(42);
        assert!(provider.map(&TransportCredentials::new(0, 0)).unwrap().sudoer);
        assert!(provider.map(&TransportCredentials::new(42, 42)).unwrap().sudoer);
        assert!(!provider.map(&TransportCredentials::new(43, 43)).unwrap().sudoer);
    }

    #[test]
    fn test_unix_provider_caches_identity() {
        let provider = UnixIdentityProvider::new();
        let creds = TransportCredentials::new(7, 7);
        let a = provider.map(&creds).unwrap();
        let b = provider.map(&creds.clone().with_pid(99)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.cached(), 1);
    }

    #[test]
    fn test_unix_provider_rejects_overflow_id() {
        let provider = UnixIdentityProvider::new();
        let err = provider
            .map(&TransportCredentials::new(OVERFLOW_ID, 0))
            .unwrap_err();
        assert_eq!(err, IdentityError::Unmappable { uid: OVERFLOW_ID });
    }

    #[test]
    fn test_identity_key_ignores_supplementary_ids() {
        let mut a = VirtualIdentity::unix(5, 5);
        let b = a.clone();
        a.gid_list.push(77);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_protocol_serializes_lowercase() {
        let json = serde_json::to_string(&AuthProtocol::Krb5).unwrap();
        assert_eq!(json, "\"krb5\"");
    }
}
