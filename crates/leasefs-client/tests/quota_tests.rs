//! Quota and size-limit integration tests.

mod common;

#[allow(unused_imports)]
use common::*;

use leasefs_client::{DROP_ALL_CAPS_XATTR, SetAttrRequest};
use leasefs_core::ROOT_INO;

const MIB: u64 = 1024 * 1024;

// ============================================================================
// Inode and Volume Quota on Create
// ============================================================================

#[test]
fn test_create_without_volume_quota_leaves_no_trace() {
    let m = TestMount::new();
    m.authorizer.update_policy(|p| p.volume_quota = 0);

    assert_errno(
        m.fs.create(&m.root(), ROOT_INO, "big", 0o644, libc::O_RDWR),
        libc::EDQUOT,
    );
    assert_eq!(m.fs.metadata().len(), 1);
    assert!(m.remote_names().is_empty());
    assert_errno(m.fs.lookup(&m.root(), ROOT_INO, "big"), libc::ENOENT);
}

#[test]
fn test_mkdir_without_inode_quota() {
    let m = TestMount::new();
    m.authorizer.update_policy(|p| p.inode_quota = 0);

    assert_errno(m.fs.mkdir(&m.root(), ROOT_INO, "d", 0o755), libc::EDQUOT);
    assert!(m.remote_names().is_empty());
}

#[test]
fn test_inode_quota_is_consumed_and_returned() {
    let m = TestMount::new();
    m.authorizer.update_policy(|p| p.inode_quota = 1);
    let creds = m.root();

    m.fs.mkdir(&creds, ROOT_INO, "one", 0o755).unwrap();
    assert_errno(m.fs.mkdir(&creds, ROOT_INO, "two", 0o755), libc::EDQUOT);

    m.fs.rmdir(&creds, ROOT_INO, "one").unwrap();
    m.fs.mkdir(&creds, ROOT_INO, "two", 0o755).unwrap();
}

#[test]
fn test_failed_create_returns_inode_quota() {
    let m = TestMount::new();
    m.authorizer.update_policy(|p| p.inode_quota = 1);
    let creds = m.root();
    let excl = libc::O_RDWR | libc::O_EXCL;

    assert_errno(m.fs.lookup(&creds, ROOT_INO, "lost"), libc::ENOENT);
    m.namespace.faults().set_available(false);
    assert!(m.fs.create(&creds, ROOT_INO, "lost", 0o644, excl).is_err());
    m.namespace.faults().set_available(true);
    assert!(m.remote_names().is_empty());

    let (entry, opened) = m.fs.create(&creds, ROOT_INO, "kept", 0o644, excl).unwrap();
    m.fs.release(&creds, entry.attr.ino, opened.fh).unwrap();
    assert_errno(m.fs.mkdir(&creds, ROOT_INO, "extra", 0o755), libc::EDQUOT);
}

// ============================================================================
// Volume Quota on Write
// ============================================================================

#[test]
fn test_write_past_volume_quota_keeps_size() {
    let m = TestMount::new();
    m.authorizer.update_policy(|p| p.volume_quota = 2 * MIB);
    let creds = m.root();

    let (entry, opened) = m
        .fs
        .create(&creds, ROOT_INO, "q", 0o644, libc::O_RDWR)
        .unwrap();
    let ino = entry.attr.ino;
    let too_much = vec![7u8; 3 * MIB as usize];
    assert_errno(m.fs.write(&creds, ino, opened.fh, 0, &too_much), libc::EDQUOT);
    assert_eq!(m.fs.getattr(&creds, ino).unwrap().size, 0);

    let fits = vec![1u8; MIB as usize];
    assert_eq!(m.fs.write(&creds, ino, opened.fh, 0, &fits).unwrap(), MIB as u32);
    m.fs.release(&creds, ino, opened.fh).unwrap();

    let remote = m.remote(ino);
    assert_eq!(m.storage.contents(remote).unwrap().len(), MIB as usize);
}

#[test]
fn test_flush_books_growth_against_shared_quota() {
    let m = TestMount::new();
    m.authorizer.update_policy(|p| p.volume_quota = 2 * MIB);
    let creds = m.root();

    let (a, fa) = m
        .fs
        .create(&creds, ROOT_INO, "a", 0o644, libc::O_RDWR)
        .unwrap();
    let (b, fb) = m
        .fs
        .create(&creds, ROOT_INO, "b", 0o644, libc::O_RDWR)
        .unwrap();
    let chunk = vec![3u8; (3 * MIB / 2) as usize];

    // Both fit on their own; only one fits once booked.
    m.fs.write(&creds, a.attr.ino, fa.fh, 0, &chunk).unwrap();
    m.fs.write(&creds, b.attr.ino, fb.fh, 0, &chunk).unwrap();
    m.fs.flush(&creds, a.attr.ino, fa.fh, 0).unwrap();
    assert_errno(m.fs.flush(&creds, b.attr.ino, fb.fh, 0), libc::EDQUOT);
    assert_errno(m.fs.release(&creds, b.attr.ino, fb.fh), libc::EDQUOT);

    m.fs.release(&creds, a.attr.ino, fa.fh).unwrap();
    assert_eq!(
        m.storage.contents(m.remote(a.attr.ino)).unwrap().len(),
        chunk.len()
    );
}

#[test]
fn test_failed_push_returns_booked_volume() {
    let m = TestMount::new();
    m.authorizer.update_policy(|p| p.volume_quota = 2 * MIB);
    let creds = m.root();
    let full = vec![5u8; (2 * MIB) as usize];

    let (a, fa) = m
        .fs
        .create(&creds, ROOT_INO, "a", 0o644, libc::O_RDWR)
        .unwrap();
    m.fs.write(&creds, a.attr.ino, fa.fh, 0, &full).unwrap();
    m.storage.faults().set_available(false);
    assert_errno(m.fs.flush(&creds, a.attr.ino, fa.fh, 0), libc::EIO);
    m.storage.faults().set_available(true);
    assert_eq!(m.fs.getattr(&creds, a.attr.ino).unwrap().size, 0);
    m.fs.release(&creds, a.attr.ino, fa.fh).unwrap();

    // The whole quota is available again.
    let (b, fb) = m
        .fs
        .create(&creds, ROOT_INO, "b", 0o644, libc::O_RDWR)
        .unwrap();
    m.fs.write(&creds, b.attr.ino, fb.fh, 0, &full).unwrap();
    m.fs.release(&creds, b.attr.ino, fb.fh).unwrap();
    assert_eq!(
        m.storage.contents(m.remote(b.attr.ino)).unwrap().len(),
        full.len()
    );
}

#[test]
fn test_open_for_write_needs_reserve() {
    let m = TestMount::new();
    let ino = m.write_file("r", b"readable");

    m.authorizer.update_policy(|p| p.volume_quota = 0);
    m.fs.setxattr(&m.root(), ROOT_INO, DROP_ALL_CAPS_XATTR, b"", 0)
        .unwrap();

    assert_errno(m.fs.open(&m.root(), ino, libc::O_WRONLY), libc::EDQUOT);
    let opened = m.fs.open(&m.root(), ino, libc::O_RDONLY).unwrap();
    m.fs.release(&m.root(), ino, opened.fh).unwrap();
    assert_eq!(m.read_file(ino), b"readable");
}

// ============================================================================
// Size Limit
// ============================================================================

#[test]
fn test_write_past_max_file_size_is_efbig() {
    let m = TestMount::new();
    m.authorizer.update_policy(|p| p.max_file_size = 1024);
    let creds = m.root();

    let (entry, opened) = m
        .fs
        .create(&creds, ROOT_INO, "small", 0o644, libc::O_RDWR)
        .unwrap();
    let ino = entry.attr.ino;
    m.fs.write(&creds, ino, opened.fh, 0, &[0u8; 1000]).unwrap();
    assert_errno(m.fs.write(&creds, ino, opened.fh, 1000, &[0u8; 100]), libc::EFBIG);
    assert_eq!(m.fs.getattr(&creds, ino).unwrap().size, 1000);

    assert_errno(
        m.fs.setattr(&creds, ino, Some(opened.fh), &SetAttrRequest::default().size(2048)),
        libc::EFBIG,
    );
    assert_eq!(m.fs.getattr(&creds, ino).unwrap().size, 1000);
    m.fs.release(&creds, ino, opened.fh).unwrap();
}

#[test]
fn test_truncate_shrinks_file() {
    let m = TestMount::new();
    let ino = m.write_file("shrink", b"0123456789");
    let attr = m
        .fs
        .setattr(&m.root(), ino, None, &SetAttrRequest::default().size(4))
        .unwrap();
    assert_eq!(attr.size, 4);
    assert_eq!(m.read_file(ino), b"0123");
    assert_eq!(m.storage.contents(m.remote(ino)).unwrap(), b"0123");
}
