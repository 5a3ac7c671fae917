//! Test harness for leasefs-client integration tests.
//!
//! Provides a `TestMount` wiring a `LeaseFs` to the in-memory remote
//! services, with shortcuts for the call sequences tests repeat.

use leasefs_client::{ClientConfig, KernelNotifier, LeaseFs, RecordingNotifier, Remotes};
use leasefs_core::testing::{MemoryAuthorizer, MemoryNamespace, MemoryStorage};
use leasefs_core::{
    ROOT_INO, RemoteAuthorizer, RemoteNamespace, RemoteStorage, TransportCredentials,
    UnixIdentityProvider,
};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber once per test binary.
///
/// Filter with `RUST_LOG=leasefs_client=debug`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Defaults with short retry and poll intervals.
pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .flush_retry(Duration::from_millis(1), Duration::from_millis(20))
        .lock_poll(Duration::from_millis(1), Duration::from_millis(20))
        .sync_timeout(Duration::from_secs(5))
}

/// A client mounted over in-memory remotes.
pub struct TestMount {
    pub fs: LeaseFs,
    pub namespace: Arc<MemoryNamespace>,
    pub authorizer: Arc<MemoryAuthorizer>,
    pub storage: Arc<MemoryStorage>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestMount {
    /// A mount with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// A mount with `config` over an empty namespace.
    pub fn with_config(config: ClientConfig) -> Self {
        Self::with_namespace(config, Arc::new(MemoryNamespace::new()))
    }

    /// A mount with `config` over a pre-seeded `namespace`.
    pub fn with_namespace(config: ClientConfig, namespace: Arc<MemoryNamespace>) -> Self {
        init_tracing();
        let authorizer = Arc::new(MemoryAuthorizer::new(Arc::clone(&namespace)));
        let storage = Arc::new(MemoryStorage::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let remotes = Remotes {
            namespace: Arc::clone(&namespace) as Arc<dyn RemoteNamespace>,
            authorizer: Arc::clone(&authorizer) as Arc<dyn RemoteAuthorizer>,
            storage: Arc::clone(&storage) as Arc<dyn RemoteStorage>,
            root: MemoryNamespace::ROOT,
        };
        let fs = LeaseFs::new(config, Arc::new(UnixIdentityProvider::new()), remotes)
            .expect("mount failed")
            .with_notifier(Arc::clone(&notifier) as Arc<dyn KernelNotifier>);
        Self {
            fs,
            namespace,
            authorizer,
            storage,
            notifier,
        }
    }

    /// Credentials of uid 0 (a sudoer).
    pub fn root(&self) -> TransportCredentials {
        TransportCredentials::new(0, 0)
    }

    /// Credentials of an unprivileged user.
    pub fn user(&self, uid: u32) -> TransportCredentials {
        TransportCredentials::new(uid, uid)
    }

    /// Creates `name` in the root holding `data`; returns its ino.
    pub fn write_file(&self, name: &str, data: &[u8]) -> u64 {
        let creds = self.root();
        let (entry, opened) = self
            .fs
            .create(&creds, ROOT_INO, name, 0o644, libc::O_RDWR)
            .expect("create failed");
        let ino = entry.attr.ino;
        if !data.is_empty() {
            self.fs
                .write(&creds, ino, opened.fh, 0, data)
                .expect("write failed");
        }
        self.fs
            .release(&creds, ino, opened.fh)
            .expect("release failed");
        ino
    }

    /// Reads the whole of `ino` through a fresh handle.
    pub fn read_file(&self, ino: u64) -> Vec<u8> {
        let creds = self.root();
        let opened = self.fs.open(&creds, ino, libc::O_RDONLY).expect("open failed");
        let size = self.fs.getattr(&creds, ino).expect("getattr failed").size;
        let data = self
            .fs
            .read(&creds, ino, opened.fh, 0, u32::try_from(size).expect("file too big"))
            .expect("read failed");
        self.fs
            .release(&creds, ino, opened.fh)
            .expect("release failed");
        data.to_vec()
    }

    /// Remote id behind the local `ino`.
    pub fn remote(&self, ino: u64) -> u64 {
        self.fs.remote_ino(ino).expect("unknown ino")
    }

    /// Names in the remote root.
    pub fn remote_names(&self) -> Vec<String> {
        self.namespace.names(MemoryNamespace::ROOT)
    }
}
