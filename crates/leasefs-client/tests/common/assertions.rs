//! Assertions shared by the integration tests.

use leasefs_client::FsError;
use std::time::{Duration, Instant};

/// Asserts that `result` failed with `errno`.
#[track_caller]
pub fn assert_errno<T: std::fmt::Debug>(result: Result<T, FsError>, errno: i32) {
    match result {
        Ok(v) => panic!("expected errno {errno}, got Ok({v:?})"),
        Err(e) => assert_eq!(e.to_errno(), errno, "unexpected error {e:?}"),
    }
}

/// Polls `cond` until it holds or `timeout` passes.
#[track_caller]
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
