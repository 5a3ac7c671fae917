//! Per-inode operation monitors.
//!
//! The tracker serializes *operations* on an inode; it does not protect
//! record contents (each metadata record carries its own lock). A delete
//! and a concurrent re-create of the same name both take the parent's
//! monitor exclusively, so they cannot interleave.
//!
//! # Deadlock Prevention
//!
//! 1. Operations touching two inodes use [`InodeTracker::monitor_pair`],
//!    which locks the lower id first
//! 2. A thread never asks for a monitor it already holds
//! 3. Shared monitors are never upgraded; take the exclusive one up front
//!
//! Monitors are created lazily and dropped again by [`InodeTracker::forget`]
//! once no guard references them.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct MonitorState {
    readers: u32,
    writer: bool,
    waiting_writers: u32,
}

#[derive(Debug, Default)]
struct MonitorSlot {
    state: Mutex<MonitorState>,
    cond: Condvar,
}

impl MonitorSlot {
    fn acquire(&self, exclusive: bool) {
        let mut state = self.state.lock();
        if exclusive {
            state.waiting_writers += 1;
            while state.writer || state.readers > 0 {
                self.cond.wait(&mut state);
            }
            state.waiting_writers -= 1;
            state.writer = true;
        } else {
            // Queued writers take precedence over new readers.
            while state.writer || state.waiting_writers > 0 {
                self.cond.wait(&mut state);
            }
            state.readers += 1;
        }
    }

    fn release(&self, exclusive: bool) {
        let mut state = self.state.lock();
        if exclusive {
            state.writer = false;
        } else {
            state.readers = state.readers.saturating_sub(1);
        }
        drop(state);
        self.cond.notify_all();
    }
}

/// RAII guard of one inode monitor.
#[derive(Debug)]
#[must_use = "the monitor is released when the guard is dropped"]
pub struct Monitor {
    ino: u64,
    exclusive: bool,
    slot: Option<Arc<MonitorSlot>>,
}

impl Monitor {
    fn noop(ino: u64) -> Self {
        Self {
            ino,
            exclusive: false,
            slot: None,
        }
    }

    /// Monitored inode.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// True for an exclusive monitor.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.release(self.exclusive);
        }
    }
}

/// Two monitors taken in ascending inode order.
#[derive(Debug)]
#[must_use = "the monitors are released when the guard is dropped"]
pub struct MonitorPair {
    // Field order is drop order: release the higher id first.
    _high: Monitor,
    _low: Monitor,
}

/// Registry of per-inode monitors.
#[derive(Debug, Default)]
pub struct InodeTracker {
    slots: DashMap<u64, Arc<MonitorSlot>>,
}

impl InodeTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, ino: u64) -> Arc<MonitorSlot> {
        Arc::clone(self.slots.entry(ino).or_default().value())
    }

    /// Blocks until the monitor of `ino` is held, shared or exclusive.
    pub fn monitor(&self, ino: u64, exclusive: bool) -> Monitor {
        let slot = self.slot(ino);
        slot.acquire(exclusive);
        trace!(ino, exclusive, "monitor acquired");
        Monitor {
            ino,
            exclusive,
            slot: Some(slot),
        }
    }

    /// Takes the monitors of `a` and `b` exclusively, lower id first.
    ///
    /// When `a == b` only one monitor is taken.
    pub fn monitor_pair(&self, a: u64, b: u64) -> MonitorPair {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let low_guard = self.monitor(low, true);
        let high_guard = if high == low {
            Monitor::noop(high)
        } else {
            self.monitor(high, true)
        };
        MonitorPair {
            _high: high_guard,
            _low: low_guard,
        }
    }

    /// Drops the monitor of `ino` if no guard references it.
    pub fn forget(&self, ino: u64) -> bool {
        self.slots
            .remove_if(&ino, |_, slot| Arc::strong_count(slot) == 1)
            .is_some()
    }

    /// Drops every unreferenced monitor; returns how many were dropped.
    pub fn cleanup_unused(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before.saturating_sub(self.slots.len())
    }

    /// Number of live monitors.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no monitor exists.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
