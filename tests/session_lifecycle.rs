//! Session creation, naming collisions and restoration from the snapshot.

use std::fs;
use std::path::Path;

use chrono::{TimeZone, Utc};
use labvault::Error;
use labvault::core::models::{StorageRoots, Tier};
use labvault::core::session;
use tempfile::tempdir;

fn reachable_roots(base: &Path) -> StorageRoots {
    let roots = StorageRoots::under(base);
    for tier in Tier::ALL {
        fs::create_dir_all(roots.root(tier)).unwrap();
    }
    roots
}

#[test]
fn test_reopen_restores_identical_tree() {
    let temp = tempdir().unwrap();
    let roots = reachable_roots(temp.path());

    let created = session::create("vr_learning", "A7", &roots).unwrap();
    let reopened = session::reopen(&created.path()).unwrap();

    assert_eq!(reopened, created);
    assert_eq!(
        reopened.raw_data(Tier::Archive),
        created.raw_data(Tier::Archive)
    );
}

#[test]
fn test_same_microsecond_sessions_get_distinct_names() {
    let temp = tempdir().unwrap();
    let roots = reachable_roots(temp.path());
    let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();

    let first = session::create_at("vr_learning", "A7", &roots, timestamp).unwrap();
    let second = session::create_at("vr_learning", "A7", &roots, timestamp).unwrap();

    let id = session::session_id(timestamp);
    assert_eq!(first.session_name(), id);
    assert_eq!(second.session_name(), format!("{id}_1"));
    assert!(second.raw_data(Tier::Server).is_dir());
    assert_ne!(first.path(), second.path());
}

#[test]
fn test_reopen_without_snapshot_fails() {
    let temp = tempdir().unwrap();
    fs::create_dir_all(temp.path().join("raw_data")).unwrap();

    let err = session::reopen(temp.path()).unwrap_err();
    assert!(matches!(err, Error::MissingSnapshot { .. }), "{err}");
}

#[test]
fn test_snapshot_is_written_to_every_long_term_tier() {
    let temp = tempdir().unwrap();
    let roots = reachable_roots(temp.path());
    let tree = session::create("vr_learning", "A7", &roots).unwrap();

    for tier in [Tier::Archive, Tier::Server] {
        let restored = session::reopen(&tree.session_dir(tier)).unwrap();
        assert_eq!(restored.identity, tree.identity);
    }
    assert!(!tree.snapshot_path(Tier::Capture).exists());
}
