//! Sparse staging buffer for write-back.
//!
//! Writes land in memory as non-overlapping extents keyed by offset; a
//! later flush pushes them to remote storage in offset order. Reads overlay
//! the staged bytes on top of whatever was fetched from the remote, so a
//! reader always sees its own unflushed writes.
//!
//! Overlapping and touching extents are merged on insert, so the map never
//! holds two extents that could be sent as one.

use std::collections::BTreeMap;

/// Staged, not yet flushed writes of one file.
///
/// # Example
///
/// ```
/// use leasefs_common::WriteBuffer;
///
/// let mut buf = WriteBuffer::new();
/// buf.write(0, b"hello");
/// buf.write(5, b" world");
/// assert_eq!(buf.extent_count(), 1);
///
/// let mut page = [0u8; 11];
/// buf.overlay(0, &mut page);
/// assert_eq!(&page, b"hello world");
/// ```
#[derive(Debug, Default, Clone)]
pub struct WriteBuffer {
    extents: BTreeMap<u64, Vec<u8>>,
    staged: u64,
}

impl WriteBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `data` at `offset`, replacing older staged bytes in range.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let end = offset + data.len() as u64;

        // Extents overlapping or touching [offset, end).
        let touching: Vec<u64> = self
            .extents
            .range(..=end)
            .rev()
            .take_while(|(start, buf)| **start + buf.len() as u64 >= offset)
            .map(|(start, _)| *start)
            .collect();

        let mut merged_start = offset;
        let mut merged_end = end;
        let mut old = Vec::with_capacity(touching.len());
        for start in touching {
            if let Some(buf) = self.extents.remove(&start) {
                self.staged -= buf.len() as u64;
                merged_start = merged_start.min(start);
                merged_end = merged_end.max(start + buf.len() as u64);
                old.push((start, buf));
            }
        }

        let mut merged = vec![0u8; usize_len(merged_end - merged_start)];
        for (start, buf) in old {
            let at = usize_len(start - merged_start);
            merged[at..at + buf.len()].copy_from_slice(&buf);
        }
        let at = usize_len(offset - merged_start);
        merged[at..at + data.len()].copy_from_slice(data);

        self.staged += merged.len() as u64;
        self.extents.insert(merged_start, merged);
    }

    /// Copies staged bytes overlapping `[offset, offset + buf.len())` into
    /// `buf`; bytes with nothing staged are left untouched.
    pub fn overlay(&self, offset: u64, buf: &mut [u8]) {
        let end = offset + buf.len() as u64;
        let first = self
            .extents
            .range(..=offset)
            .next_back()
            .map_or(offset, |(start, _)| *start);
        for (start, data) in self.extents.range(first..end) {
            let ext_end = start + data.len() as u64;
            if ext_end <= offset {
                continue;
            }
            let from = (*start).max(offset);
            let to = ext_end.min(end);
            let src = usize_len(from - start)..usize_len(to - start);
            let dst = usize_len(from - offset)..usize_len(to - offset);
            buf[dst].copy_from_slice(&data[src]);
        }
    }

    /// Drops staged bytes at or beyond `size`.
    pub fn truncate(&mut self, size: u64) {
        let tail = self.extents.split_off(&size);
        for buf in tail.values() {
            self.staged -= buf.len() as u64;
        }
        if let Some((start, buf)) = self.extents.iter_mut().next_back() {
            let keep = size - start;
            if (buf.len() as u64) > keep {
                self.staged -= buf.len() as u64 - keep;
                buf.truncate(usize_len(keep));
            }
        }
    }

    /// Removes and returns every extent in offset order.
    pub fn take_extents(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.staged = 0;
        std::mem::take(&mut self.extents).into_iter().collect()
    }

    /// Total staged bytes.
    pub fn staged_bytes(&self) -> u64 {
        self.staged
    }

    /// One past the last staged byte, or 0 when empty.
    pub fn end(&self) -> u64 {
        self.extents
            .iter()
            .next_back()
            .map_or(0, |(start, buf)| start + buf.len() as u64)
    }

    /// Number of disjoint extents.
    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    /// True if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Discards everything staged.
    pub fn clear(&mut self) {
        self.extents.clear();
        self.staged = 0;
    }
}

#[inline]
fn usize_len(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_overlapping_writes_merge() {
        let mut buf = WriteBuffer::new();
        buf.write(10, b"aaaa");
        buf.write(20, b"bbbb");
        assert_eq!(buf.extent_count(), 2);
        buf.write(12, b"cccccccccc");
        assert_eq!(buf.extent_count(), 1);
        assert_eq!(buf.staged_bytes(), 14);
        assert_eq!(buf.end(), 24);

        let mut out = [b'.'; 16];
        buf.overlay(10, &mut out);
        assert_eq!(&out[..14], b"aaccccccccccbb");
    }

    #[test]
    fn test_overlay_leaves_gaps_untouched() {
        let mut buf = WriteBuffer::new();
        buf.write(2, b"xy");
        let mut out = *b"abcdef";
        buf.overlay(0, &mut out);
        assert_eq!(&out, b"abxyef");
    }

    #[test]
    fn test_truncate_splits_extent() {
        let mut buf = WriteBuffer::new();
        buf.write(0, b"0123456789");
        buf.write(20, b"tail");
        buf.truncate(4);
        assert_eq!(buf.end(), 4);
        assert_eq!(buf.staged_bytes(), 4);
        let extents = buf.take_extents();
        assert_eq!(extents, vec![(0, b"0123".to_vec())]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_write_is_noop() {
        let mut buf = WriteBuffer::new();
        buf.write(100, b"");
        assert!(buf.is_empty());
        assert_eq!(buf.end(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(u64, Vec<u8>),
        Truncate(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u64..200, proptest::collection::vec(any::<u8>(), 0..40))
                .prop_map(|(off, data)| Op::Write(off, data)),
            1 => (0u64..240).prop_map(Op::Truncate),
        ]
    }

    proptest! {
        #[test]
        fn test_buffer_matches_byte_model(ops in proptest::collection::vec(op_strategy(), 1..30)) {
            let mut buf = WriteBuffer::new();
            let mut model: Vec<Option<u8>> = Vec::new();
            for op in ops {
                match op {
                    Op::Write(off, data) => {
                        buf.write(off, &data);
                        let end = off as usize + data.len();
                        if model.len() < end {
                            model.resize(end, None);
                        }
                        for (i, b) in data.iter().enumerate() {
                            model[off as usize + i] = Some(*b);
                        }
                    }
                    Op::Truncate(size) => {
                        buf.truncate(size);
                        model.truncate(size as usize);
                    }
                }
            }

            let mut view = vec![0xEEu8; 300];
            buf.overlay(0, &mut view);
            for (i, byte) in view.iter().enumerate() {
                let expected = model.get(i).copied().flatten().unwrap_or(0xEE);
                prop_assert_eq!(*byte, expected, "offset {}", i);
            }

            let staged = model.iter().filter(|b| b.is_some()).count() as u64;
            prop_assert_eq!(buf.staged_bytes(), staged);

            let extents = buf.take_extents();
            for pair in extents.windows(2) {
                let (start, data) = &pair[0];
                prop_assert!(start + (data.len() as u64) < pair[1].0, "extents touch or overlap");
            }
        }
    }
}
