//! Read-ahead planner.
//!
//! Decides how many bytes to fetch for a read. Sequential access (a read
//! starting where the previous one ended, or at offset 0) prefetches beyond
//! the request; any other access fetches exactly what was asked and, for
//! the dynamic strategy, shrinks the window back to nominal.

use crate::config::{ReadAheadConfig, ReadAheadStrategy};

/// Per-file read-ahead state.
#[derive(Debug, Clone)]
pub struct ReadAhead {
    config: ReadAheadConfig,
    window: u64,
    next: u64,
}

impl ReadAhead {
    /// A planner starting at the nominal window.
    pub fn new(config: ReadAheadConfig) -> Self {
        let window = config.nominal.min(config.max);
        Self {
            config,
            window,
            next: 0,
        }
    }

    /// Bytes to fetch for a read of `len` bytes at `offset`.
    pub fn plan(&mut self, offset: u64, len: u64) -> u64 {
        let sequential = offset == self.next || offset == 0;
        self.next = offset.saturating_add(len);
        match self.config.strategy {
            ReadAheadStrategy::None => len,
            ReadAheadStrategy::Static if sequential => len.max(self.config.nominal),
            ReadAheadStrategy::Static => len,
            ReadAheadStrategy::Dynamic if sequential => {
                let fetch = len.max(self.window);
                self.window = self.window.saturating_mul(2).min(self.config.max).max(1);
                fetch
            }
            ReadAheadStrategy::Dynamic => {
                self.window = self.config.nominal.min(self.config.max);
                len
            }
        }
    }

    /// Records a read served without fetching.
    pub fn note(&mut self, offset: u64, len: u64) {
        self.next = offset.saturating_add(len);
    }

    /// Current dynamic window.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Largest number of fetched blocks kept per file.
    pub fn max_blocks(&self) -> usize {
        self.config.blocks
    }

    /// Forgets the access pattern, e.g. after the cached data was dropped.
    pub fn reset(&mut self) {
        self.window = self.config.nominal.min(self.config.max);
        self.next = 0;
    }
}
