//! In-memory remote services for tests and local experiments.
//!
//! The three fakes implement the remote traits against process memory and
//! share a [`FaultInjector`] so tests can simulate outages:
//!
//! ```
//! use leasefs_core::testing::{MemoryNamespace, MemoryStorage};
//! use leasefs_core::RemoteNamespace;
//!
//! let ns = MemoryNamespace::new();
//! let dir = ns.seed_dir(MemoryNamespace::ROOT, "data", 0o755);
//! assert_eq!(ns.lookup_entry(MemoryNamespace::ROOT, "data").unwrap().remote_ino, dir);
//!
//! ns.faults().set_available(false);
//! assert!(ns.lookup_entry(MemoryNamespace::ROOT, "data").is_err());
//! ```

mod authorizer;
mod namespace;
mod storage;

pub use authorizer::{GrantPolicy, MemoryAuthorizer};
pub use namespace::{MemoryNamespace, NamespaceCalls};
pub use storage::MemoryStorage;

use crate::error::RemoteError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Switches that make a fake service fail or slow down.
#[derive(Debug, Default)]
pub struct FaultInjector {
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    latency: Mutex<Duration>,
}

impl FaultInjector {
    /// A healthy injector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns the service on or off.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    /// Makes the next `n` calls fail with [`RemoteError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Applies the configured faults to one call named `op`.
    pub fn check(&self, op: &str) -> Result<(), RemoteError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if self.unavailable.load(Ordering::Acquire) {
            return Err(RemoteError::Unavailable(format!("{op}: injected outage")));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(RemoteError::Unavailable(format!("{op}: injected failure")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_injector_fail_next_counts_down() {
        let faults = FaultInjector::new();
        faults.fail_next(2);
        assert!(faults.check("a").is_err());
        assert!(faults.check("b").is_err());
        assert!(faults.check("c").is_ok());
    }

    #[test]
    fn test_fault_injector_outage() {
        let faults = FaultInjector::new();
        faults.set_available(false);
        let err = faults.check("create").unwrap_err();
        assert!(err.is_retryable());
        faults.set_available(true);
        assert!(faults.check("create").is_ok());
    }
}
