//! Plain value types shared by the client caches and the remote interfaces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File type bits of a POSIX mode.
pub const S_IFMT: u32 = 0o170000;
/// Directory.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file.
pub const S_IFREG: u32 = 0o100000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120000;
/// Named pipe.
pub const S_IFIFO: u32 = 0o010000;

/// Returns true if `mode` describes a directory.
#[inline]
pub fn mode_is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Returns true if `mode` describes a symbolic link.
#[inline]
pub fn mode_is_symlink(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Returns true if `mode` describes a regular file.
#[inline]
pub fn mode_is_regular(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

/// A timestamp with nanosecond resolution, seconds relative to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timespec {
    /// Seconds since the epoch (negative before 1970).
    pub sec: i64,
    /// Nanoseconds within the second.
    pub nsec: u32,
}

impl Timespec {
    /// Creates a timestamp, normalizing `nsec` into the seconds field.
    pub fn new(sec: i64, nsec: u32) -> Self {
        let carry = i64::from(nsec / 1_000_000_000);
        Self {
            sec: sec + carry,
            nsec: nsec % 1_000_000_000,
        }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// Converts back to a `SystemTime`.
    pub fn to_system_time(self) -> SystemTime {
        let nanos = Duration::from_nanos(u64::from(self.nsec));
        if self.sec >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.sec.unsigned_abs()) + nanos
        } else {
            UNIX_EPOCH - Duration::from_secs(self.sec.unsigned_abs()) + nanos
        }
    }
}

impl From<SystemTime> for Timespec {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                nsec: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                let mut sec = -i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
                let mut nsec = d.subsec_nanos();
                if nsec > 0 {
                    sec -= 1;
                    nsec = 1_000_000_000 - nsec;
                }
                Self { sec, nsec }
            }
        }
    }
}

/// Opaque token identifying one generation of a remote file's byte stream.
///
/// Zero means "no generation known yet".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Cookie(u64);

impl Cookie {
    /// The unset cookie.
    pub const NONE: Cookie = Cookie(0);

    /// Wraps a raw generation number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw generation number.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// True if no generation has been assigned.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The generation following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({:x})", self.0)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Access bits carried by a capability.
///
/// The low three bits follow `access(2)`; the remaining bits cover the
/// finer-grained rights a lease can grant (delete, chmod, chown, xattr,
/// update, utimes). [`AccessMask::DIR`] is a request flag meaning the target
/// must be a directory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AccessMask(u32);

impl AccessMask {
    /// No access.
    pub const NONE: AccessMask = AccessMask(0);
    /// Execute / search.
    pub const X_OK: AccessMask = AccessMask(1);
    /// Write.
    pub const W_OK: AccessMask = AccessMask(2);
    /// Read.
    pub const R_OK: AccessMask = AccessMask(4);
    /// Delete entries.
    pub const D_OK: AccessMask = AccessMask(8);
    /// Change mode.
    pub const M_OK: AccessMask = AccessMask(16);
    /// Change owner.
    pub const C_OK: AccessMask = AccessMask(32);
    /// Set extended attributes.
    pub const SA_OK: AccessMask = AccessMask(64);
    /// Update existing content.
    pub const U_OK: AccessMask = AccessMask(128);
    /// Set timestamps.
    pub const SU_OK: AccessMask = AccessMask(256);
    /// Target must be a directory.
    pub const DIR: AccessMask = AccessMask(0x1_0000);
    /// Every right.
    pub const ALL: AccessMask = AccessMask(0x1ff);

    /// Builds a mask from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is present.
    pub const fn contains(self, other: AccessMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if at least one bit of `other` is present.
    pub const fn intersects(self, other: AccessMask) -> bool {
        self.0 & other.0 != 0
    }

    /// True if no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// This mask without the bits of `other`.
    #[must_use]
    pub const fn without(self, other: AccessMask) -> Self {
        Self(self.0 & !other.0)
    }

    /// Converts the low `rwx` bits of an `access(2)` mask.
    pub const fn from_posix(mask: u32) -> Self {
        Self(mask & 0o7)
    }
}

impl BitOr for AccessMask {
    type Output = AccessMask;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AccessMask {
    type Output = AccessMask;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for AccessMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(AccessMask, &str); 10] = [
            (AccessMask::R_OK, "r"),
            (AccessMask::W_OK, "w"),
            (AccessMask::X_OK, "x"),
            (AccessMask::D_OK, "d"),
            (AccessMask::M_OK, "m"),
            (AccessMask::C_OK, "c"),
            (AccessMask::SA_OK, "sa"),
            (AccessMask::U_OK, "u"),
            (AccessMask::SU_OK, "su"),
            (AccessMask::DIR, "dir"),
        ];
        let parts: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "AccessMask({})", parts.join("|"))
    }
}

/// Byte-range lock type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
    /// Release a held range.
    Unlock,
}

/// An advisory byte-range lock as seen by `getlk`/`setlk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileLock {
    /// Lock type.
    pub kind: LockKind,
    /// First byte covered.
    pub start: u64,
    /// Number of bytes covered; zero means "to end of file".
    pub len: u64,
    /// Process holding (or requesting) the lock.
    pub pid: u32,
}

impl FileLock {
    /// Exclusive end offset, `None` for a lock running to end of file.
    pub fn end(&self) -> Option<u64> {
        (self.len != 0).then(|| self.start.saturating_add(self.len))
    }

    /// True if the two ranges share at least one byte.
    pub fn overlaps(&self, other: &FileLock) -> bool {
        let starts_before_other_ends = other.end().is_none_or(|end| self.start < end);
        let other_starts_before_end = self.end().is_none_or(|end| other.start < end);
        starts_before_other_ends && other_starts_before_end
    }

    /// True if the two locks cannot be held by different owners at once.
    pub fn conflicts_with(&self, other: &FileLock) -> bool {
        self.overlaps(other) && (self.kind == LockKind::Write || other.kind == LockKind::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_helpers() {
        assert!(mode_is_dir(S_IFDIR | 0o755));
        assert!(!mode_is_dir(S_IFREG | 0o644));
        assert!(mode_is_symlink(S_IFLNK | 0o777));
        assert!(mode_is_regular(S_IFREG));
    }

    #[test]
    fn test_timespec_roundtrip_system_time() {
        let ts = Timespec::new(1_700_000_000, 123_456_789);
        assert_eq!(Timespec::from(ts.to_system_time()), ts);

        let before_epoch = Timespec::new(-5, 250_000_000);
        assert_eq!(Timespec::from(before_epoch.to_system_time()), before_epoch);
    }

    #[test]
    fn test_timespec_normalizes_nanos() {
        let ts = Timespec::new(10, 2_500_000_000);
        assert_eq!(ts, Timespec { sec: 12, nsec: 500_000_000 });
    }

    #[test]
    fn test_access_mask_contains() {
        let rw = AccessMask::R_OK | AccessMask::W_OK;
        assert!(rw.contains(AccessMask::R_OK));
        assert!(!rw.contains(AccessMask::R_OK | AccessMask::X_OK));
        assert!(rw.intersects(AccessMask::W_OK | AccessMask::X_OK));
        assert_eq!(rw.without(AccessMask::W_OK), AccessMask::R_OK);
        assert_eq!(AccessMask::from_posix(0o7), AccessMask::R_OK | AccessMask::W_OK | AccessMask::X_OK);
        assert_eq!(format!("{rw:?}"), "AccessMask(r|w)");
    }

    #[test]
    fn test_cookie_next_and_none() {
        assert!(Cookie::NONE.is_none());
        let c = Cookie::new(7);
        assert_eq!(c.next().value(), 8);
        assert_eq!(c.to_string(), "7");
    }

    #[test]
    fn test_lock_overlap_rules() {
        let a = FileLock { kind: LockKind::Write, start: 0, len: 10, pid: 1 };
        let b = FileLock { kind: LockKind::Read, start: 10, len: 5, pid: 2 };
        let c = FileLock { kind: LockKind::Read, start: 5, len: 0, pid: 3 };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(a.conflicts_with(&c));
        assert!(!b.conflicts_with(&c));
    }
}
