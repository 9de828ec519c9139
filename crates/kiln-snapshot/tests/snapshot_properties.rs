//! Property tests for scanning, diffing and applying layers.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use kiln_snapshot::{FilesystemSnapshot, Scanner, apply, capture, diff};
use proptest::prelude::*;
use tempfile::tempdir;

/// Relative file path → content. Paths whose ancestor is itself a file are
/// dropped when the tree is written.
fn tree() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("[abc](/[abc]){0,2}", "[xyz]{0,4}", 0..8)
}

fn materialize(root: &Path, files: &BTreeMap<String, String>) {
    for (path, content) in files {
        let target = root.join(path);
        if target.ancestors().skip(1).any(Path::is_file) {
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        if !target.is_dir() {
            fs::write(&target, content).unwrap();
        }
    }
}

fn clear(root: &Path) {
    for entry in fs::read_dir(root).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            fs::remove_dir_all(path).unwrap();
        } else {
            fs::remove_file(path).unwrap();
        }
    }
}

fn scan(root: &Path, workers: usize) -> FilesystemSnapshot {
    Scanner::new().with_workers(workers).scan(root, None).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_scan_is_independent_of_worker_count(files in tree()) {
        let temp = tempdir().unwrap();
        materialize(temp.path(), &files);

        let serial = scan(temp.path(), 1);
        let parallel = scan(temp.path(), 8);
        prop_assert_eq!(serial.entries(), parallel.entries());
    }

    #[test]
    fn test_layer_digest_is_deterministic(before in tree(), after in tree()) {
        let digest = |workers| {
            let temp = tempdir().unwrap();
            materialize(temp.path(), &before);
            let old = scan(temp.path(), workers);
            clear(temp.path());
            materialize(temp.path(), &after);
            let new = scan(temp.path(), workers);
            capture(temp.path(), &old, &new).unwrap().digest().clone()
        };
        prop_assert_eq!(digest(1), digest(4));
    }

    #[test]
    fn test_apply_reproduces_after_state(before in tree(), after in tree()) {
        let source = tempdir().unwrap();
        materialize(source.path(), &before);
        let old = scan(source.path(), 2);
        clear(source.path());
        materialize(source.path(), &after);
        let new = scan(source.path(), 2);
        let layer = capture(source.path(), &old, &new).unwrap();

        let replica = tempdir().unwrap();
        materialize(replica.path(), &before);
        apply(&layer, replica.path()).unwrap();

        let replayed = scan(replica.path(), 2);
        prop_assert!(diff(&new, &replayed).is_empty());
        prop_assert!(diff(&replayed, &new).is_empty());
    }

    #[test]
    fn test_diff_of_identical_snapshots_is_empty(files in tree()) {
        let temp = tempdir().unwrap();
        materialize(temp.path(), &files);
        let snapshot = scan(temp.path(), 4);
        let layer = diff(&snapshot, &snapshot);
        prop_assert!(layer.is_empty());
        prop_assert_eq!(layer.digest(), &kiln_snapshot::Layer::empty_digest());
    }
}

#[test]
fn test_apply_twice_is_idempotent() {
    let source = tempdir().unwrap();
    fs::create_dir_all(source.path().join("etc/app")).unwrap();
    fs::write(source.path().join("etc/app/conf"), "a=1").unwrap();
    fs::write(source.path().join("stale"), "x").unwrap();
    let old = scan(source.path(), 2);

    fs::remove_file(source.path().join("stale")).unwrap();
    fs::write(source.path().join("etc/app/conf"), "a=2").unwrap();
    let new = scan(source.path(), 2);
    let layer = capture(source.path(), &old, &new).unwrap();

    let replica = tempdir().unwrap();
    fs::create_dir_all(replica.path().join("etc/app")).unwrap();
    fs::write(replica.path().join("etc/app/conf"), "a=1").unwrap();
    fs::write(replica.path().join("stale"), "x").unwrap();

    apply(&layer, replica.path()).unwrap();
    let once = scan(replica.path(), 2);
    apply(&layer, replica.path()).unwrap();
    let twice = scan(replica.path(), 2);

    assert!(diff(&once, &twice).is_empty());
    assert_eq!(
        fs::read_to_string(replica.path().join("etc/app/conf")).unwrap(),
        "a=2"
    );
    assert!(!replica.path().join("stale").exists());
}
