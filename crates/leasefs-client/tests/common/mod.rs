//! Common test utilities for leasefs-client integration tests.

pub mod assertions;
pub mod harness;

pub use assertions::*;
pub use harness::{TestMount, init_tracing, test_config};
