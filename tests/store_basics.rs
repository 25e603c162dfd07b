//! # Basic Store Behavior
//!
//! Covers the typed API surface and the boundary contract:
//! - empty keys and empty byte values are rejected without touching disk
//! - empty *string* values are legal (their encoding carries a length
//!   prefix)
//! - last-write-wins semantics, removal, bulk removal
//! - persistence across a close/reopen cycle after a stable sync

use std::path::Path;
use std::sync::{Arc, OnceLock};

use pagekv::{Store, StoreOptions};
use tempfile::TempDir;

fn root() -> &'static Path {
    static ROOT: OnceLock<TempDir> = OnceLock::new();
    let dir = ROOT.get_or_init(|| tempfile::tempdir().unwrap());
    pagekv::initialize(dir.path()).unwrap();
    dir.path()
}

fn open(id: &str) -> Arc<Store> {
    root();
    pagekv::open(id).unwrap()
}

mod boundary {
    use super::*;

    #[test]
    fn empty_key_and_empty_bytes_are_rejected() {
        let store = open("boundary_empty");

        assert!(!store.set_string("", "x"));
        assert!(!store.set_bytes("k", b""));
        store.remove("");

        assert_eq!(store.count(), 0);
        assert_eq!(store.actual_size(), 0, "no bytes may reach the log");
    }

    #[test]
    fn empty_string_value_is_legal() {
        let store = open("boundary_empty_string");

        assert!(store.set_string("k", ""));
        assert_eq!(store.get_string("k").as_deref(), Some(""));
        assert!(store.contains_key("k"));
        assert!(store.actual_size() > 0);
    }

    #[test]
    fn missing_keys_return_defaults() {
        let store = open("boundary_defaults");

        assert_eq!(store.get_i32("missing", -3), -3);
        assert!(store.get_bool("missing", true));
        assert_eq!(store.get_f64("missing", 1.5), 1.5);
        assert_eq!(store.get_string("missing"), None);
        assert_eq!(store.get_bytes("missing"), None);
        assert_eq!(store.value_size("missing", false), 0);
    }
}

mod typed_values {
    use super::*;

    #[test]
    fn scalars_roundtrip() {
        let store = open("typed_scalars");

        assert!(store.set_bool("b", true));
        assert!(store.set_i32("i32", -123456));
        assert!(store.set_i64("i64", 1 << 40));
        assert!(store.set_f32("f32", 2.5));
        assert!(store.set_f64("f64", -0.125));

        assert!(store.get_bool("b", false));
        assert_eq!(store.get_i32("i32", 0), -123456);
        assert_eq!(store.get_i64("i64", 0), 1 << 40);
        assert_eq!(store.get_f32("f32", 0.0), 2.5);
        assert_eq!(store.get_f64("f64", 0.0), -0.125);
    }

    #[test]
    fn bytes_and_string_lists_roundtrip() {
        let store = open("typed_compound");

        assert!(store.set_bytes("blob", &[0, 159, 146, 150]));
        assert_eq!(store.get_bytes("blob"), Some(vec![0, 159, 146, 150]));

        let list = vec!["alpha".to_owned(), String::new(), "gamma".to_owned()];
        assert!(store.set_string_list("list", &list));
        assert_eq!(store.get_string_list("list"), Some(list));
    }

    #[test]
    fn value_size_reports_payload_and_raw() {
        let store = open("typed_value_size");

        store.set_string("s", "hello");
        // raw: 1-byte length prefix + 5 payload bytes
        assert_eq!(store.value_size("s", false), 6);
        assert_eq!(store.value_size("s", true), 5);

        store.set_i32("i", 1);
        assert_eq!(store.value_size("i", false), 1);
    }
}

mod mapping_semantics {
    use super::*;

    #[test]
    fn last_write_wins() {
        let store = open("map_lww");

        store.set_string("k", "first");
        store.set_string("k", "second");
        store.set_i32("k", 7);

        assert_eq!(store.count(), 1);
        assert_eq!(store.get_i32("k", 0), 7);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = open("map_remove");

        store.set_string("k", "v");
        let after_set = store.actual_size();
        store.remove("k");
        assert!(!store.contains_key("k"));
        let after_remove = store.actual_size();
        assert!(after_remove > after_set, "removal appends a tombstone");

        store.remove("k");
        assert_eq!(
            store.actual_size(),
            after_remove,
            "removing an absent key must not append"
        );
    }

    #[test]
    fn remove_many_compacts_instead_of_appending() {
        let store = open("map_remove_many");

        for i in 0..20 {
            store.set_string(&format!("k{i}"), &format!("v{i}"));
        }
        store.remove_many(&["k0", "k1", "k2", "k3"]);

        assert_eq!(store.count(), 16);
        assert!(!store.contains_key("k0"));
        assert!(store.contains_key("k4"));
    }

    #[test]
    fn all_keys_lists_the_live_mapping() {
        let store = open("map_all_keys");

        store.set_string("a", "1");
        store.set_string("b", "2");
        store.remove("a");

        let mut keys = store.all_keys();
        keys.sort();
        assert_eq!(keys, vec!["b".to_owned()]);
    }
}

mod persistence {
    use super::*;

    #[test]
    fn reopen_after_sync_sees_the_same_mapping() {
        let store = open("persist_reopen");
        assert!(store.set_i32("answer", 42));
        store.sync(true);
        store.close();
        drop(store);

        let store = open("persist_reopen");
        assert_eq!(store.get_i32("answer", 0), 42);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn reopen_replays_tombstones() {
        let store = open("persist_tombstones");
        store.set_string("keep", "v");
        store.set_string("gone", "v");
        store.remove("gone");
        store.sync(true);
        store.close();
        drop(store);

        let store = open("persist_tombstones");
        assert_eq!(store.count(), 1);
        assert!(store.contains_key("keep"));
        assert!(!store.contains_key("gone"));
    }

    #[test]
    fn on_exit_releases_state_but_handles_reload() {
        let store = open("persist_on_exit");
        store.set_string("k", "v");
        pagekv::on_exit();

        // the handle lazily reloads from disk on its next use
        assert_eq!(store.get_string("k").as_deref(), Some("v"));
    }

    #[test]
    fn registry_returns_the_cached_handle() {
        let first = open("persist_identity");
        let second = open("persist_identity");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn relative_path_store_is_created_and_isolated() {
        let sub = root().join("elsewhere");
        std::fs::create_dir_all(&sub).unwrap();
        let store = StoreOptions::new("persist_rel")
            .relative_path(&sub)
            .open()
            .unwrap();
        store.set_string("k", "v");
        assert!(sub.join("persist_rel").exists());

        // same id under the root is a different store
        let other = open("persist_rel");
        assert!(!Arc::ptr_eq(&store, &other));
        assert!(!other.contains_key("k"));
    }

    #[test]
    fn special_characters_in_ids_are_redirected() {
        root();
        let store = StoreOptions::new("weird/id:with*chars")
            .open()
            .unwrap();
        store.set_string("k", "v");
        store.sync(true);

        assert!(root().join("specialCharacter").is_dir());
        assert_eq!(store.get_string("k").as_deref(), Some("v"));
    }
}
