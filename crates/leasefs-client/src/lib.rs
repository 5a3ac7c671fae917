//! Client-side caching and concurrency layer of leasefs.
//!
//! leasefs-client sits between a kernel binding and the remote services and
//! keeps three process-wide caches coherent under concurrent calls:
//!
//! - [`md`] - metadata records mirrored from the remote namespace, with the
//!   background flush queue for asynchronous mutations
//! - [`caps`] - time-bounded capabilities (leases) with quota counters
//! - [`data`] - per-inode I/O contexts with read-ahead and write-back
//!
//! [`tracker`] serializes operations per inode, [`fs::LeaseFs`] wires the
//! pieces together per filesystem call, and [`ops`] offers the calls as a
//! closed enum for a dispatcher.
//!
//! # Example
//!
//! ```
//! use leasefs_client::{ClientConfig, LeaseFs, Remotes};
//! use leasefs_core::testing::{MemoryAuthorizer, MemoryNamespace, MemoryStorage};
//! use leasefs_core::{ROOT_INO, TransportCredentials, UnixIdentityProvider};
//! use std::sync::Arc;
//!
//! let namespace = Arc::new(MemoryNamespace::new());
//! let remotes = Remotes {
//!     namespace: namespace.clone(),
//!     authorizer: Arc::new(MemoryAuthorizer::new(namespace.clone())),
//!     storage: Arc::new(MemoryStorage::new()),
//!     root: MemoryNamespace::ROOT,
//! };
//! let fs = LeaseFs::new(
//!     ClientConfig::default(),
//!     Arc::new(UnixIdentityProvider::new()),
//!     remotes,
//! )
//! .unwrap();
//!
//! let creds = TransportCredentials::new(0, 0);
//! let dir = fs.mkdir(&creds, ROOT_INO, "docs", 0o755).unwrap();
//! assert_eq!(fs.lookup(&creds, ROOT_INO, "docs").unwrap().attr.ino, dir.attr.ino);
//! ```

pub mod attr;
pub mod caps;
pub mod config;
pub mod data;
pub mod error;
pub mod fs;
pub mod handles;
pub mod kernel;
pub mod md;
pub mod ops;
pub mod tracker;
pub mod vmap;

pub use attr::{DirEntry, EntryAttr, FileAttr, FileKind, SetAttrRequest};
pub use caps::{Capability, CapabilityCache};
pub use config::{ClientConfig, ReadAheadConfig, ReadAheadStrategy};
pub use error::{ConfigError, FsError, FsResult, ToErrno};
pub use fs::{DROP_ALL_CAPS_XATTR, DROP_CAP_XATTR, LeaseFs, Opened, Remotes};
pub use kernel::{KernelNotifier, NoopNotifier, RecordingNotifier};
pub use ops::{Operation, Reply};
