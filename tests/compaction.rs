//! # Growth, Compaction and Trim
//!
//! Exercises the append-log lifecycle under write pressure:
//! - the file grows in page multiples and never silently shrinks
//! - overwrites are drained by compaction, so the log stays bounded
//! - trim halves the file back down after the live set shrinks
//! - back-to-back compactions are idempotent on the file image

use std::path::Path;
use std::sync::{Arc, OnceLock};

use pagekv::encoding::{record, value};
use pagekv::{Store, StoreOptions};
use tempfile::TempDir;

fn root() -> &'static Path {
    static ROOT: OnceLock<TempDir> = OnceLock::new();
    let dir = ROOT.get_or_init(|| tempfile::tempdir().unwrap());
    pagekv::initialize(dir.path()).unwrap();
    dir.path()
}

fn open_small(id: &str) -> Arc<Store> {
    root();
    StoreOptions::new(id).size(1).open().unwrap()
}

#[test]
fn file_size_stays_page_aligned_while_growing() {
    let store = open_small("grow_aligned");
    let page = pagekv::page_size();
    assert_eq!(store.total_size(), page);

    let mut previous = store.total_size();
    for i in 0..5_000 {
        assert!(store.set_string(&format!("key_{i:05}"), &format!("value_{i:05}")));
        let size = store.total_size();
        assert_eq!(size % page, 0, "file size must stay a page multiple");
        assert!(size >= previous, "growth must be monotone");
        previous = size;
    }
    assert!(store.total_size() > page);
    assert_eq!(store.count(), 5_000);
}

#[test]
fn overwrites_are_drained_by_compaction() {
    let store = open_small("compact_overwrites");

    for i in 0..10_000 {
        assert!(store.set_string(&format!("k{i}"), &format!("v{i}")));
    }
    for i in 0..10_000 {
        assert!(store.set_string(&format!("k{i}"), &format!("v2{i}")));
    }

    assert_eq!(store.count(), 10_000);
    for i in (0..10_000).step_by(997) {
        assert_eq!(
            store.get_string(&format!("k{i}")).as_deref(),
            Some(format!("v2{i}").as_str())
        );
    }

    // the log may hold superseded entries, but compaction keeps it
    // bounded: well under two full images of the live mapping
    let live_image: usize = (0..10_000)
        .map(|i| {
            let data = value::encode_str(&format!("v2{i}"));
            record::entry_size(&format!("k{i}"), &data)
        })
        .sum();
    assert!(
        store.actual_size() < 2 * live_image,
        "actual_size {} must stay under twice the live image {}",
        store.actual_size(),
        live_image
    );
}

#[test]
fn trim_halves_the_file_after_shrinking() {
    let store = open_small("trim_shrink");
    let page = pagekv::page_size();

    for i in 0..10_000 {
        store.set_string(&format!("k{i}"), &format!("v{i}"));
    }
    let grown = store.total_size();
    assert!(grown > page);

    let keep: Vec<String> = (0..16).map(|i| format!("k{i}")).collect();
    let doomed: Vec<String> = (16..10_000).map(|i| format!("k{i}")).collect();
    let doomed_refs: Vec<&str> = doomed.iter().map(String::as_str).collect();
    store.remove_many(&doomed_refs);
    assert_eq!(store.count(), keep.len());

    store.trim();
    let trimmed = store.total_size();
    let needed = store.actual_size() + 4;

    assert!(trimmed < grown, "trim must shrink a mostly-empty file");
    assert_eq!(trimmed % page, 0);
    assert!(trimmed >= needed, "trim must never cut into live data");
    assert!(
        trimmed == page || trimmed <= 2 * needed,
        "trim must halve down to at most twice the live size (or one page)"
    );

    for key in &keep {
        assert!(store.contains_key(key), "trim must preserve {key}");
    }
}

#[test]
fn trim_of_an_empty_store_resets_to_one_page() {
    let store = open_small("trim_empty");
    for i in 0..3_000 {
        store.set_string(&format!("k{i}"), "some moderately sized value");
    }
    let all: Vec<String> = store.all_keys();
    let refs: Vec<&str> = all.iter().map(String::as_str).collect();
    store.remove_many(&refs);
    assert_eq!(store.count(), 0);

    store.trim();
    assert_eq!(store.total_size(), pagekv::page_size());
    assert_eq!(store.actual_size(), 0);
}

#[test]
fn back_to_back_compactions_are_idempotent() {
    root();
    let store = StoreOptions::new("compact_idempotent").open().unwrap();
    for i in 0..100 {
        store.set_string(&format!("k{i}"), &format!("v{i}"));
    }

    // removing a key that does not exist still forces a writeback
    store.remove_many(&["nope_1", "nope_2"]);
    let first = snapshot(&store);
    store.remove_many(&["nope_1", "nope_2"]);
    let second = snapshot(&store);

    assert_eq!(first, second, "a second writeback must not move bytes");
    assert_eq!(store.count(), 100);
}

fn snapshot(store: &Store) -> Vec<u8> {
    store.sync(true);
    let path = root().join(store.id());
    let bytes = std::fs::read(path).unwrap();
    bytes[..4 + store.actual_size()].to_vec()
}
