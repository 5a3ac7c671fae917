//! Client configuration.
//!
//! Defaults target a remote namespace with noticeable latency: long leases,
//! synchronous creates and renames, asynchronous deletes. Values can be built
//! in code with the `#[must_use]` setters or parsed from JSON, where
//! durations use humantime notation (`"300s"`, `"10ms"`).
//!
//! ```
//! use leasefs_client::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::from_json_str(r#"{ "lease_time": "2m", "rmdir_is_sync": true }"#)
//!     .unwrap();
//! assert_eq!(config.lease_time, Duration::from_secs(120));
//! assert!(config.rmdir_is_sync);
//! assert!(config.mkdir_is_sync);
//! ```

use crate::error::ConfigError;
use leasefs_common::{DEFAULT_NEGATIVE_TTL, DEFAULT_TTL};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lease lifetime when a grant carries none.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(300);

/// Default lifetime of a cached capability denial.
pub const DEFAULT_DENIED_CAP_TTL: Duration = Duration::from_secs(5);

/// Default deadline for waiting on a remote acknowledgement.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-ahead policy of the data cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadAheadStrategy {
    /// Fetch exactly what was asked.
    None,
    /// Prefetch a fixed window on sequential reads.
    Static,
    /// Double the window on sequential reads, reset on random access.
    #[default]
    Dynamic,
}

/// Read-ahead settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadAheadConfig {
    /// Prefetch policy.
    pub strategy: ReadAheadStrategy,
    /// Initial (static) window in bytes.
    pub nominal: u64,
    /// Largest window in bytes.
    pub max: u64,
    /// Cached blocks kept per open file.
    pub blocks: usize,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            strategy: ReadAheadStrategy::Dynamic,
            nominal: 256 * 1024,
            max: 2 * 1024 * 1024,
            blocks: 16,
        }
    }
}

/// Configuration of one client instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `mkdir` waits for the remote create.
    pub mkdir_is_sync: bool,
    /// `create`/`mknod` wait for the remote create.
    pub create_is_sync: bool,
    /// `symlink` waits for the remote create.
    pub symlink_is_sync: bool,
    /// `rename` waits for the remote rename.
    pub rename_is_sync: bool,
    /// `rmdir`/`unlink` wait for the remote delete.
    pub rmdir_is_sync: bool,

    /// Lease lifetime used when a grant carries none.
    #[serde(with = "humantime_serde")]
    pub lease_time: Duration,
    /// How long a denied capability is remembered.
    #[serde(with = "humantime_serde")]
    pub denied_cap_ttl: Duration,
    /// How long a confirmed-missing name is remembered; zero disables.
    #[serde(with = "humantime_serde")]
    pub negative_lookup_ttl: Duration,
    /// Age after which an idle record is re-fetched from the remote.
    #[serde(with = "humantime_serde")]
    pub attr_ttl: Duration,

    /// Read-ahead settings.
    pub read_ahead: ReadAheadConfig,
    /// Staged bytes that trigger an early data push.
    pub write_back_threshold: u64,
    /// Volume quota a writer must have left to open or create a file.
    pub open_quota_reserve: u64,

    /// Deadline for `wait_flush` / `wait_deleted`.
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
    /// First retry wait of the background flush queue.
    #[serde(with = "humantime_serde")]
    pub flush_retry_initial: Duration,
    /// Retry wait ceiling of the background flush queue.
    #[serde(with = "humantime_serde")]
    pub flush_retry_max: Duration,
    /// First poll wait of a blocking `setlk`.
    #[serde(with = "humantime_serde")]
    pub lock_poll_initial: Duration,
    /// Poll wait ceiling of a blocking `setlk`.
    #[serde(with = "humantime_serde")]
    pub lock_poll_max: Duration,
    /// Advisory byte-range locks are forwarded to the remote.
    pub global_locking: bool,

    /// Keep the kernel data cache on open unless the generation changed.
    pub keep_data_cache: bool,
    /// Longest accepted name.
    pub max_name_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mkdir_is_sync: true,
            create_is_sync: true,
            symlink_is_sync: true,
            rename_is_sync: true,
            rmdir_is_sync: false,
            lease_time: DEFAULT_LEASE_TIME,
            denied_cap_ttl: DEFAULT_DENIED_CAP_TTL,
            negative_lookup_ttl: DEFAULT_NEGATIVE_TTL,
            attr_ttl: DEFAULT_TTL,
            read_ahead: ReadAheadConfig::default(),
            write_back_threshold: 4 * 1024 * 1024,
            open_quota_reserve: 1024 * 1024,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            flush_retry_initial: Duration::from_millis(10),
            flush_retry_max: Duration::from_secs(1),
            lock_poll_initial: Duration::from_millis(10),
            lock_poll_max: Duration::from_secs(1),
            global_locking: true,
            keep_data_cache: true,
            max_name_len: 255,
        }
    }
}

impl ClientConfig {
    /// Parses and validates a JSON document; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_time.is_zero() {
            return Err(ConfigError::Invalid {
                field: "lease_time",
                reason: "must be positive".to_string(),
            });
        }
        if self.sync_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "sync_timeout",
                reason: "must be positive".to_string(),
            });
        }
        if self.flush_retry_initial.is_zero() || self.flush_retry_max < self.flush_retry_initial {
            return Err(ConfigError::Invalid {
                field: "flush_retry_max",
                reason: format!(
                    "{:?} must be at least flush_retry_initial {:?} (> 0)",
                    self.flush_retry_max, self.flush_retry_initial
                ),
            });
        }
        if self.lock_poll_initial.is_zero() || self.lock_poll_max < self.lock_poll_initial {
            return Err(ConfigError::Invalid {
                field: "lock_poll_max",
                reason: format!(
                    "{:?} must be at least lock_poll_initial {:?} (> 0)",
                    self.lock_poll_max, self.lock_poll_initial
                ),
            });
        }
        if self.read_ahead.strategy != ReadAheadStrategy::None {
            if self.read_ahead.nominal == 0 || self.read_ahead.max < self.read_ahead.nominal {
                return Err(ConfigError::Invalid {
                    field: "read_ahead",
                    reason: format!(
                        "window {}..{} is empty or inverted",
                        self.read_ahead.nominal, self.read_ahead.max
                    ),
                });
            }
            if self.read_ahead.blocks == 0 {
                return Err(ConfigError::Invalid {
                    field: "read_ahead.blocks",
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.max_name_len == 0 {
            return Err(ConfigError::Invalid {
                field: "max_name_len",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Makes every namespace mutation wait for the remote.
    #[must_use]
    pub fn all_sync(mut self) -> Self {
        self.mkdir_is_sync = true;
        self.create_is_sync = true;
        self.symlink_is_sync = true;
        self.rename_is_sync = true;
        self.rmdir_is_sync = true;
        self
    }

    /// Queues every namespace mutation for the background flusher.
    #[must_use]
    pub fn all_async(mut self) -> Self {
        self.mkdir_is_sync = false;
        self.create_is_sync = false;
        self.symlink_is_sync = false;
        self.rename_is_sync = false;
        self.rmdir_is_sync = false;
        self
    }

    /// Sets the lease lifetime.
    #[must_use]
    pub fn lease_time(mut self, ttl: Duration) -> Self {
        self.lease_time = ttl;
        self
    }

    /// Sets how long capability denials are cached.
    #[must_use]
    pub fn denied_cap_ttl(mut self, ttl: Duration) -> Self {
        self.denied_cap_ttl = ttl;
        self
    }

    /// Sets the negative lookup TTL.
    #[must_use]
    pub fn negative_lookup_ttl(mut self, ttl: Duration) -> Self {
        self.negative_lookup_ttl = ttl;
        self
    }

    /// Sets the attribute TTL.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the read-ahead settings.
    #[must_use]
    pub fn read_ahead(mut self, read_ahead: ReadAheadConfig) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    /// Sets the write-back threshold.
    #[must_use]
    pub fn write_back_threshold(mut self, bytes: u64) -> Self {
        self.write_back_threshold = bytes;
        self
    }

    /// Sets the quota reserve checked on open and create.
    #[must_use]
    pub fn open_quota_reserve(mut self, bytes: u64) -> Self {
        self.open_quota_reserve = bytes;
        self
    }

    /// Sets the acknowledgement deadline.
    #[must_use]
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Sets the flush queue backoff.
    #[must_use]
    pub fn flush_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.flush_retry_initial = initial;
        self.flush_retry_max = max;
        self
    }

    /// Sets the `setlk` poll backoff.
    #[must_use]
    pub fn lock_poll(mut self, initial: Duration, max: Duration) -> Self {
        self.lock_poll_initial = initial;
        self.lock_poll_max = max;
        self
    }

    /// Enables or disables remote byte-range locking.
    #[must_use]
    pub fn global_locking(mut self, enabled: bool) -> Self {
        self.global_locking = enabled;
        self
    }

    /// Sets the longest accepted name.
    #[must_use]
    pub fn max_name_len(mut self, len: usize) -> Self {
        self.max_name_len = len;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.mkdir_is_sync);
        assert!(config.create_is_sync);
        assert!(!config.rmdir_is_sync);
        assert_eq!(config.lease_time, Duration::from_secs(300));
        assert_eq!(config.negative_lookup_ttl, Duration::from_secs(30));
        assert_eq!(config.read_ahead.strategy, ReadAheadStrategy::Dynamic);
        assert_eq!(config.read_ahead.max, 2 * 1024 * 1024);
        assert_eq!(config.lock_poll_max, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ClientConfig::default()
            .all_async()
            .sync_timeout(Duration::from_millis(500));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"sync_timeout\":\"500ms\""));
        let back = ClientConfig::from_json_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{ "read_ahead": { "strategy": "static" }, "global_locking": false }"#,
        )
        .unwrap();
        assert_eq!(config.read_ahead.strategy, ReadAheadStrategy::Static);
        assert_eq!(config.read_ahead.nominal, 256 * 1024);
        assert!(!config.global_locking);
        assert_eq!(config.max_name_len, 255);
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = ClientConfig::default()
            .lock_poll(Duration::from_secs(2), Duration::from_millis(1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "lock_poll_max", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_read_ahead() {
        let json = r#"{ "read_ahead": { "nominal": 4096, "max": 1024 } }"#;
        assert!(ClientConfig::from_json_str(json).is_err());

        let json = r#"{ "read_ahead": { "strategy": "none", "nominal": 0 } }"#;
        assert!(ClientConfig::from_json_str(json).is_ok());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ClientConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
