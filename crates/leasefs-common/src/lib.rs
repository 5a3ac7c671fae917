//! Cache building blocks shared by the leasefs client.
//!
//! # Components
//!
//! - [`TtlCache`] / [`NegativeCache`] - Moka-backed caches with per-entry
//!   TTL and "known absent" markers
//! - [`HandleTable`] - thread-safe table of open file and directory handles
//! - [`WriteBuffer`] - sparse staging buffer for write-back
//! - [`ExponentialBackoff`] - doubling wait schedule with deadline
//! - [`ErrorCategory`] - error classification and the errno mapping
//! - [`ClientStats`] - atomic operation and cache counters
//!
//! # Example
//!
//! ```
//! use leasefs_common::{HandleTable, NegativeCache, WriteBuffer};
//! use std::time::Duration;
//!
//! let negative: NegativeCache<(u64, String)> = NegativeCache::new(Duration::from_secs(30));
//! negative.insert((1, "missing".to_string()));
//! assert!(negative.contains(&(1, "missing".to_string())));
//!
//! let handles: HandleTable<WriteBuffer> = HandleTable::new();
//! let fh = handles.insert(WriteBuffer::new());
//! assert!(handles.get(fh).is_some());
//! ```

#![warn(missing_docs)]

pub mod backoff;
pub mod error_category;
pub mod handle_table;
pub mod stats;
pub mod ttl_cache;
pub mod write_buffer;

pub use backoff::ExponentialBackoff;
pub use error_category::{ErrorCategory, io_error_to_errno};
pub use handle_table::HandleTable;
pub use stats::{CacheStats, CacheStatsSnapshot, ClientStats, ClientStatsSnapshot};
pub use ttl_cache::{DEFAULT_NEGATIVE_TTL, DEFAULT_TTL, NegativeCache, TtlCache};
pub use write_buffer::WriteBuffer;
