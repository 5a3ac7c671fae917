//! Background flush queue for remote namespace mutations.
//!
//! Asynchronous creates, updates, deletes and renames are queued here and
//! pushed to the remote by a single worker thread, so mutations of one
//! record reach the remote in the order they were made.
//!
//! # Pinning
//!
//! Every queued operation pins its record (`pending` count) and, for a
//! delete, the name inside the parent (`todelete`). The pin is released when
//! the remote acknowledges, fails for good, or the work is abandoned because
//! the record was forgotten. Waiters in `wait_flush` / `wait_deleted` are
//! woken through the record's event.
//!
//! # Retries
//!
//! Retryable failures back off exponentially and are retried until they
//! succeed, the record is forgotten, or the queue shuts down.

use super::MdShared;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use leasefs_common::ExponentialBackoff;
use leasefs_core::RemoteError;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// A remote mutation waiting for the worker.
///
/// Operations carry local ids; remote ids are resolved when the operation
/// runs, so an operation queued behind a pending create sees its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FlushOp {
    /// Create the record `ino` under its current parent and name.
    Create { ino: u64, authid: String },
    /// Push the current attributes of `ino`.
    Update { ino: u64, authid: String },
    /// Remove `name` from `parent`; `ino` is the record it named.
    Delete {
        ino: u64,
        parent: u64,
        name: String,
        authid: String,
    },
    /// Move the entry named `src_name` to `dst_name`.
    ///
    /// `entry` overrides the remote id when the moved name is a hard link.
    Rename {
        ino: u64,
        entry: Option<u64>,
        src_parent: u64,
        src_name: String,
        dst_parent: u64,
        dst_name: String,
        authid: String,
    },
}

impl FlushOp {
    /// Local id of the record this operation pins.
    pub(crate) fn ino(&self) -> u64 {
        match self {
            FlushOp::Create { ino, .. }
            | FlushOp::Update { ino, .. }
            | FlushOp::Delete { ino, .. }
            | FlushOp::Rename { ino, .. } => *ino,
        }
    }

    /// Short name for logs.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            FlushOp::Create { .. } => "create",
            FlushOp::Update { .. } => "update",
            FlushOp::Delete { .. } => "delete",
            FlushOp::Rename { .. } => "rename",
        }
    }
}

/// How a queued operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The remote applied it.
    Acked,
    /// The remote refused it for good.
    Failed(RemoteError),
    /// Given up while the remote was unreachable.
    Abandoned,
}

/// Handle to the flush worker.
#[derive(Debug)]
pub(crate) struct FlushQueue {
    tx: Mutex<Option<Sender<FlushOp>>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FlushQueue {
    /// Starts the worker thread.
    pub(crate) fn start(shared: Arc<MdShared>) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let worker = thread::Builder::new()
            .name("leasefs-flush".to_string())
            .spawn(move || flush_loop(&rx, &shared, &flag))?;
        info!("flush queue started");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues `op`; hands it back if the queue was shut down.
    pub(crate) fn submit(&self, op: FlushOp) -> Result<(), FlushOp> {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(op).map_err(|e| e.into_inner()),
            None => Err(op),
        }
    }

    /// Operations waiting for the worker.
    pub(crate) fn depth(&self) -> usize {
        self.tx.lock().as_ref().map_or(0, Sender::len)
    }

    /// Runs the queued operations once more and stops the worker.
    ///
    /// Retryable failures are no longer retried.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        drop(self.tx.lock().take());
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            error!("flush worker panicked");
        }
    }
}

impl Drop for FlushQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush_loop(rx: &Receiver<FlushOp>, shared: &MdShared, shutdown: &AtomicBool) {
    debug!("flush worker started");
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(op) => {
                let outcome = run(shared, shutdown, &op);
                shared.finish(&op, outcome);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("flush queue closed, worker exiting");
                break;
            }
        }
    }
}

fn run(shared: &MdShared, shutdown: &AtomicBool, op: &FlushOp) -> Outcome {
    let (initial, max) = shared.retry_schedule();
    let mut backoff = ExponentialBackoff::new(initial, max);
    loop {
        match shared.execute(op) {
            Ok(()) => {
                trace!(op = op.kind(), ino = op.ino(), "remote mutation acknowledged");
                return Outcome::Acked;
            }
            Err(e) if e.is_retryable() => {
                if shutdown.load(Ordering::Acquire) || shared.is_forgotten(op.ino()) {
                    warn!(
                        op = op.kind(),
                        ino = op.ino(),
                        error = %e,
                        "abandoning remote mutation"
                    );
                    return Outcome::Abandoned;
                }
                shared.stats().record_flush_retry();
                warn!(
                    op = op.kind(),
                    ino = op.ino(),
                    attempt = backoff.attempts() + 1,
                    error = %e,
                    "remote mutation failed, retrying"
                );
                backoff.sleep();
            }
            Err(e) => return Outcome::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_accessors() {
        let op = FlushOp::Delete {
            ino: 7,
            parent: 1,
            name: "x".into(),
            authid: "a".into(),
        };
        assert_eq!(op.ino(), 7);
        assert_eq!(op.kind(), "delete");

        let op = FlushOp::Rename {
            ino: 9,
            entry: None,
            src_parent: 1,
            src_name: "a".into(),
            dst_parent: 2,
            dst_name: "b".into(),
            authid: "a".into(),
        };
        assert_eq!(op.ino(), 9);
        assert_eq!(op.kind(), "rename");
    }
}
