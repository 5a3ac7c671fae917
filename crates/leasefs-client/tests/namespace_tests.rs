//! Namespace integration tests: creates, removals, renames, hard links and
//! listings against the in-memory remotes, including concurrent callers.

mod common;

#[allow(unused_imports)]
use common::*;

use leasefs_client::{FileKind, FsError};
use leasefs_core::ROOT_INO;
use leasefs_core::testing::MemoryNamespace;
use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// ============================================================================
// Create and Lookup
// ============================================================================

#[test]
fn test_mkdir_then_lookup() {
    let m = TestMount::new();
    let creds = m.root();
    let dir = m.fs.mkdir(&creds, ROOT_INO, "docs", 0o755).unwrap();
    assert_eq!(dir.attr.kind, FileKind::Directory);

    let found = m.fs.lookup(&creds, ROOT_INO, "docs").unwrap();
    assert_eq!(found.attr.ino, dir.attr.ino);
    assert!(m.remote_names().contains(&"docs".to_string()));
}

#[test]
fn test_create_existing_name_fails() {
    let m = TestMount::new();
    m.write_file("a", b"x");
    assert_errno(
        m.fs.create(&m.root(), ROOT_INO, "a", 0o644, libc::O_RDWR),
        libc::EEXIST,
    );
    assert_errno(m.fs.mkdir(&m.root(), ROOT_INO, "a", 0o755), libc::EEXIST);
}

#[test]
fn test_lookup_of_remote_only_entry() {
    let ns = Arc::new(MemoryNamespace::new());
    ns.seed_dir(MemoryNamespace::ROOT, "existing", 0o755);
    let m = TestMount::with_namespace(test_config(), ns);

    let entry = m.fs.lookup(&m.root(), ROOT_INO, "existing").unwrap();
    assert_eq!(entry.attr.kind, FileKind::Directory);
    assert_errno(m.fs.lookup(&m.root(), ROOT_INO, "missing"), libc::ENOENT);
}

#[test]
fn test_concurrent_mkdir_same_name_single_winner() {
    let m = TestMount::new();
    let barrier = Barrier::new(2);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    m.fs.mkdir(&m.root(), ROOT_INO, "x", 0o755)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let exists = results
        .iter()
        .filter(|r| matches!(r, Err(FsError::AlreadyExists)))
        .count();
    assert_eq!(ok, 1, "{results:?}");
    assert_eq!(exists, 1, "{results:?}");
    assert_eq!(m.remote_names(), vec!["x".to_string()]);
}

#[test]
fn test_access_denied_without_search_permission() {
    let m = TestMount::new();
    let dir = m.fs.mkdir(&m.root(), ROOT_INO, "private", 0o700).unwrap();
    m.fs.mkdir(&m.root(), dir.attr.ino, "inner", 0o755).unwrap();

    let user = m.user(1000);
    assert_errno(m.fs.lookup(&user, dir.attr.ino, "inner"), libc::EACCES);
    assert_errno(m.fs.access(&user, dir.attr.ino, 4), libc::EACCES);
    m.fs.lookup(&m.root(), dir.attr.ino, "inner").unwrap();
}

// ============================================================================
// Symlinks
// ============================================================================

#[test]
fn test_symlink_and_readlink() {
    let m = TestMount::new();
    let link = m.fs.symlink(&m.root(), ROOT_INO, "ln", "target/path").unwrap();
    assert_eq!(link.attr.kind, FileKind::Symlink);
    assert_eq!(m.fs.readlink(&m.root(), link.attr.ino).unwrap(), "target/path");

    let ino = m.write_file("plain", b"data");
    assert_errno(m.fs.readlink(&m.root(), ino), libc::EINVAL);
}

// ============================================================================
// Removal
// ============================================================================

#[test]
fn test_unlink_removes_remote_entry() {
    let m = TestMount::new();
    let ino = m.write_file("gone", b"bytes");
    m.fs.unlink(&m.root(), ROOT_INO, "gone").unwrap();

    assert_errno(m.fs.lookup(&m.root(), ROOT_INO, "gone"), libc::ENOENT);
    assert!(m.fs.metadata().record(ino).is_none_or(|r| r.is_deleted()));
    wait_for(Duration::from_secs(5), || m.remote_names().is_empty());
}

#[test]
fn test_unlink_directory_is_eisdir() {
    let m = TestMount::new();
    m.fs.mkdir(&m.root(), ROOT_INO, "d", 0o755).unwrap();
    assert_errno(m.fs.unlink(&m.root(), ROOT_INO, "d"), libc::EISDIR);
}

#[test]
fn test_rmdir_rules() {
    let m = TestMount::with_config(test_config().all_sync());
    let creds = m.root();
    let dir = m.fs.mkdir(&creds, ROOT_INO, "d", 0o755).unwrap();
    let (entry, opened) = m
        .fs
        .create(&creds, dir.attr.ino, "f", 0o644, libc::O_RDWR)
        .unwrap();
    m.fs.release(&creds, entry.attr.ino, opened.fh).unwrap();

    assert_errno(m.fs.rmdir(&creds, ROOT_INO, "d"), libc::ENOTEMPTY);
    m.write_file("file", b"");
    assert_errno(m.fs.rmdir(&creds, ROOT_INO, "file"), libc::ENOTDIR);

    m.fs.unlink(&creds, dir.attr.ino, "f").unwrap();
    m.fs.rmdir(&creds, ROOT_INO, "d").unwrap();
    assert_errno(m.fs.lookup(&creds, ROOT_INO, "d"), libc::ENOENT);
    wait_for(Duration::from_secs(5), || {
        m.namespace.child(MemoryNamespace::ROOT, "d").is_none()
    });
}

#[test]
fn test_rmdir_updates_parent_nlink() {
    let m = TestMount::new();
    let creds = m.root();
    let before = m.fs.getattr(&creds, ROOT_INO).unwrap().nlink;
    m.fs.mkdir(&creds, ROOT_INO, "sub", 0o755).unwrap();
    assert_eq!(m.fs.getattr(&creds, ROOT_INO).unwrap().nlink, before + 1);
    m.fs.rmdir(&creds, ROOT_INO, "sub").unwrap();
    assert_eq!(m.fs.getattr(&creds, ROOT_INO).unwrap().nlink, before);
}

// ============================================================================
// Asynchronous Mutations
// ============================================================================

#[test]
fn test_create_delete_create_waits_for_queued_delete() {
    let m = TestMount::with_config(test_config().all_async());
    let first = m.write_file("f", b"one");
    m.fs.unlink(&m.root(), ROOT_INO, "f").unwrap();
    let second = m.write_file("f", b"two");

    assert_ne!(first, second);
    assert!(m.fs.metadata().record(first).is_none_or(|r| r.is_deleted()));
    assert_eq!(m.read_file(second), b"two");

    wait_for(Duration::from_secs(5), || {
        m.namespace.child(MemoryNamespace::ROOT, "f").is_some()
            && m.fs.remote_ino(second).is_some_and(|r| r != 0)
    });
    assert_eq!(
        m.namespace.child(MemoryNamespace::ROOT, "f"),
        m.fs.remote_ino(second)
    );
}

#[test]
fn test_async_mkdir_children_reach_remote() {
    let m = TestMount::with_config(test_config().all_async());
    let creds = m.root();
    let dir = m.fs.mkdir(&creds, ROOT_INO, "queued", 0o755).unwrap();
    let sub = m.fs.mkdir(&creds, dir.attr.ino, "nested", 0o755).unwrap();
    assert_errno(m.fs.lookup(&creds, sub.attr.ino, "x"), libc::ENOENT);

    wait_for(Duration::from_secs(5), || {
        m.namespace
            .child(MemoryNamespace::ROOT, "queued")
            .and_then(|d| m.namespace.child(d, "nested"))
            .is_some()
    });
}

// ============================================================================
// Rename
// ============================================================================

#[test]
fn test_rename_within_directory() {
    let m = TestMount::new();
    let ino = m.write_file("old", b"content");
    m.fs.rename(&m.root(), ROOT_INO, "old", ROOT_INO, "new").unwrap();

    assert_errno(m.fs.lookup(&m.root(), ROOT_INO, "old"), libc::ENOENT);
    assert_eq!(m.fs.lookup(&m.root(), ROOT_INO, "new").unwrap().attr.ino, ino);
    assert_eq!(m.remote_names(), vec!["new".to_string()]);
    assert_eq!(m.read_file(ino), b"content");
}

#[test]
fn test_rename_replaces_destination() {
    let m = TestMount::new();
    let src = m.write_file("src", b"new data");
    let dst = m.write_file("dst", b"old");
    m.fs.rename(&m.root(), ROOT_INO, "src", ROOT_INO, "dst").unwrap();

    assert_eq!(m.fs.lookup(&m.root(), ROOT_INO, "dst").unwrap().attr.ino, src);
    assert!(m.fs.metadata().record(dst).is_none_or(|r| r.is_deleted()));
    assert_eq!(m.remote_names(), vec!["dst".to_string()]);
}

#[test]
fn test_rename_directory_moves_nlink() {
    let m = TestMount::new();
    let creds = m.root();
    let a = m.fs.mkdir(&creds, ROOT_INO, "a", 0o755).unwrap().attr.ino;
    let b = m.fs.mkdir(&creds, ROOT_INO, "b", 0o755).unwrap().attr.ino;
    let sub = m.fs.mkdir(&creds, a, "sub", 0o755).unwrap().attr.ino;

    m.fs.rename(&creds, a, "sub", b, "sub").unwrap();
    assert_eq!(m.fs.getattr(&creds, a).unwrap().nlink, 2);
    assert_eq!(m.fs.getattr(&creds, b).unwrap().nlink, 3);
    assert_eq!(m.fs.lookup(&creds, b, "sub").unwrap().attr.ino, sub);

    assert_errno(m.fs.rename(&creds, ROOT_INO, "b", sub, "loop"), libc::EINVAL);
}

#[test]
fn test_concurrent_cross_directory_renames_do_not_deadlock() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 50;

    let m = Arc::new(TestMount::new());
    let creds = m.root();
    let dirs: Vec<u64> = (0..THREADS)
        .map(|i| m.fs.mkdir(&creds, ROOT_INO, &format!("d{i}"), 0o755).unwrap().attr.ino)
        .collect();
    for (i, dir) in dirs.iter().enumerate() {
        let (entry, opened) = m
            .fs
            .create(&creds, *dir, &format!("t{i}"), 0o644, libc::O_RDWR)
            .unwrap();
        m.fs.release(&creds, entry.attr.ino, opened.fh).unwrap();
    }

    let (done_tx, done_rx) = mpsc::channel();
    for i in 0..THREADS {
        let m = Arc::clone(&m);
        let dirs = dirs.clone();
        let done = done_tx.clone();
        thread::spawn(move || {
            let creds = m.root();
            let name = format!("t{i}");
            let home = dirs[i];
            let away = dirs[(i + 1) % THREADS];
            let (mut here, mut there) = (home, away);
            for _ in 0..ROUNDS {
                m.fs.rename(&creds, here, &name, there, &name).unwrap();
                std::mem::swap(&mut here, &mut there);
            }
            if here != home {
                m.fs.rename(&creds, here, &name, home, &name).unwrap();
            }
            done.send(i).unwrap();
        });
    }
    drop(done_tx);

    for _ in 0..THREADS {
        done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("rename threads deadlocked");
    }

    for (i, dir) in dirs.iter().enumerate() {
        let name = format!("t{i}");
        let holders = dirs
            .iter()
            .filter(|d| m.fs.lookup(&creds, **d, &name).is_ok())
            .count();
        assert_eq!(holders, 1, "{name} found in {holders} directories");
        m.fs.lookup(&creds, *dir, &name).unwrap();
    }
}

// ============================================================================
// Hard Links
// ============================================================================

#[test]
fn test_link_then_unlink_primary_promotes_alias() {
    let m = TestMount::new();
    let creds = m.root();
    let ino = m.write_file("t", b"shared");
    let linked = m.fs.link(&creds, ino, ROOT_INO, "t2").unwrap();
    assert_eq!(linked.attr.ino, ino);
    assert_eq!(linked.attr.nlink, 2);

    m.fs.unlink(&creds, ROOT_INO, "t").unwrap();
    assert_eq!(m.fs.getattr(&creds, ino).unwrap().nlink, 1);
    assert_eq!(m.fs.lookup(&creds, ROOT_INO, "t2").unwrap().attr.ino, ino);
    assert_errno(m.fs.lookup(&creds, ROOT_INO, "t"), libc::ENOENT);
    assert!(m.notifier.saw_inode(ino));

    assert_eq!(m.remote_names(), vec!["t2".to_string()]);
    let remote = m.namespace.child(MemoryNamespace::ROOT, "t2").unwrap();
    assert_eq!(m.namespace.entry(remote).unwrap().nlink, 1);
    assert_eq!(m.read_file(ino), b"shared");

    m.fs.unlink(&creds, ROOT_INO, "t2").unwrap();
    assert!(m.fs.metadata().record(ino).is_none_or(|r| r.is_deleted()));
}

#[test]
fn test_unlink_alias_keeps_primary() {
    let m = TestMount::new();
    let creds = m.root();
    let ino = m.write_file("main", b"x");
    m.fs.link(&creds, ino, ROOT_INO, "alias").unwrap();
    m.fs.unlink(&creds, ROOT_INO, "alias").unwrap();

    assert_eq!(m.fs.getattr(&creds, ino).unwrap().nlink, 1);
    assert_eq!(m.fs.lookup(&creds, ROOT_INO, "main").unwrap().attr.ino, ino);
    assert_eq!(m.remote_names(), vec!["main".to_string()]);
}

#[test]
fn test_link_restrictions() {
    let m = TestMount::new();
    let creds = m.root();
    let dir = m.fs.mkdir(&creds, ROOT_INO, "d", 0o755).unwrap().attr.ino;
    let file = m.write_file("f", b"");

    assert_errno(m.fs.link(&creds, file, dir, "f"), libc::EXDEV);
    assert_errno(m.fs.link(&creds, dir, ROOT_INO, "d2"), libc::EPERM);
    assert_errno(m.fs.link(&creds, file, ROOT_INO, "d"), libc::EEXIST);
}

// ============================================================================
// Listings
// ============================================================================

#[test]
fn test_opendir_readdir_snapshot() {
    let m = TestMount::new();
    let creds = m.root();
    let dir = m.fs.mkdir(&creds, ROOT_INO, "list", 0o755).unwrap().attr.ino;
    for name in ["a", "b"] {
        let (entry, opened) = m.fs.create(&creds, dir, name, 0o644, libc::O_RDWR).unwrap();
        m.fs.release(&creds, entry.attr.ino, opened.fh).unwrap();
    }

    let fh = m.fs.opendir(&creds, dir).unwrap();
    let all = m.fs.readdir(&creds, dir, fh, 0).unwrap();
    let names: BTreeSet<_> = all.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, BTreeSet::from([".", "..", "a", "b"]));
    assert_eq!(all[0].ino, dir);
    assert_eq!(all[1].ino, ROOT_INO);

    // Entries created after opendir stay out of the snapshot.
    let (late, opened) = m.fs.create(&creds, dir, "late", 0o644, libc::O_RDWR).unwrap();
    m.fs.release(&creds, late.attr.ino, opened.fh).unwrap();
    let rest = m.fs.readdir(&creds, dir, fh, 2).unwrap();
    assert_eq!(rest.len(), 2);
    assert!(rest.iter().all(|e| e.kind == FileKind::RegularFile));
    assert!(m.fs.readdir(&creds, dir, fh, 4).unwrap().is_empty());

    assert_errno(m.fs.readdir(&creds, ROOT_INO, fh, 0), libc::EBADF);
    m.fs.releasedir(&creds, dir, fh).unwrap();
    assert_errno(m.fs.readdir(&creds, dir, fh, 0), libc::EBADF);
}

#[test]
fn test_listing_includes_remote_entries() {
    let ns = Arc::new(MemoryNamespace::new());
    let remote_dir = ns.seed_dir(MemoryNamespace::ROOT, "seeded", 0o755);
    ns.seed_dir(remote_dir, "one", 0o755);
    ns.seed_file(remote_dir, "two", 0o644, 0, leasefs_core::Cookie::new(1));
    let m = TestMount::with_namespace(test_config(), ns);
    let creds = m.root();

    let dir = m.fs.lookup(&creds, ROOT_INO, "seeded").unwrap().attr.ino;
    let fh = m.fs.opendir(&creds, dir).unwrap();
    let entries = m.fs.readdir(&creds, dir, fh, 2).unwrap();
    let kinds: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
    assert_eq!(
        kinds,
        vec![("one", FileKind::Directory), ("two", FileKind::RegularFile)]
    );
    m.fs.releasedir(&creds, dir, fh).unwrap();
}
