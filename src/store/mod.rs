//! # Store Module
//!
//! The public handle over one memory-mapped key/value store. A `Store`
//! is a flat, last-write-wins mapping from string keys to typed values,
//! persisted as an append log in a single mmap'd file:
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │   Typed API (set_*/get_*/remove)      │
//! ├───────────────────────────────────────┤
//! │   In-memory dictionary (replayed log) │
//! ├───────────────────────────────────────┤
//! │   Write path: append → compact/grow   │
//! ├───────────────────────────────────────┤
//! │   Integrity: CRC + last-confirmed     │
//! ├───────────────────────────────────────┤
//! │   mmap'd log file + sidecar + lock    │
//! └───────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Every public operation serializes on the per-store mutex; stores
//! opened [`OpenMode::MULTI_PROCESS`](crate::OpenMode) additionally
//! coordinate through an advisory file lock on the sidecar and detect
//! foreign writes via the sidecar's sequence and CRC before touching
//! any data. Lock order is always registry → store mutex → file lock.
//!
//! ## Error Contract
//!
//! No errors cross this API. Setters return `false` on invalid input
//! (empty key, empty byte value) or when the filesystem refuses to
//! cooperate; getters return the caller's default (scalars) or `None`
//! (strings, bytes, lists). Corruption is never fatal: the store
//! recovers what the integrity protocol can vouch for, or comes up
//! empty. Failures are reported through `tracing`.
//!
//! ## Durability
//!
//! Writes land in a shared mapping and survive process crashes as soon
//! as the OS flushes them; [`Store::sync`] with `stable = true` forces
//! that flush and additionally checkpoints the current state as the
//! crash-recovery anchor.

mod core;
mod load;
mod write;

use parking_lot::Mutex;

use crate::encoding::value;

pub(crate) use self::core::StoreCore;

/// Handle to one open store. Obtained from [`StoreOptions::open`]
/// (usually via the process-wide registry), cheap to share as an
/// `Arc<Store>`.
///
/// [`StoreOptions::open`]: crate::StoreOptions::open
pub struct Store {
    id: String,
    core: Mutex<StoreCore>,
}

impl Store {
    pub(crate) fn from_core(id: String, core: StoreCore) -> Store {
        Store {
            id,
            core: Mutex::new(core),
        }
    }

    /// The registry identity of this store.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_bool(&self, key: &str, value: bool) -> bool {
        self.set_data(key, value::encode_bool(value))
    }

    pub fn set_i32(&self, key: &str, value: i32) -> bool {
        self.set_data(key, value::encode_i32(value))
    }

    pub fn set_i64(&self, key: &str, value: i64) -> bool {
        self.set_data(key, value::encode_i64(value))
    }

    pub fn set_f32(&self, key: &str, value: f32) -> bool {
        self.set_data(key, value::encode_f32(value))
    }

    pub fn set_f64(&self, key: &str, value: f64) -> bool {
        self.set_data(key, value::encode_f64(value))
    }

    /// Store a string. An empty string is a legal value (its encoding
    /// still carries the length prefix).
    pub fn set_string(&self, key: &str, value: &str) -> bool {
        self.set_data(key, value::encode_str(value))
    }

    /// Store raw bytes. Empty byte values are rejected; use
    /// [`Store::remove`] to delete a key.
    pub fn set_bytes(&self, key: &str, value: &[u8]) -> bool {
        if value.is_empty() {
            return false;
        }
        self.set_data(key, value::encode_bytes(value))
    }

    pub fn set_string_list(&self, key: &str, values: &[String]) -> bool {
        self.set_data(key, value::encode_string_list(values))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.with_value(key, |data| value::decode_bool(data, default))
            .unwrap_or(default)
    }

    pub fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.with_value(key, |data| value::decode_i32(data, default))
            .unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.with_value(key, |data| value::decode_i64(data, default))
            .unwrap_or(default)
    }

    pub fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.with_value(key, |data| value::decode_f32(data, default))
            .unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.with_value(key, |data| value::decode_f64(data, default))
            .unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.with_value(key, |data| value::decode_str(data)).flatten()
    }

    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.with_value(key, |data| value::decode_bytes(data)).flatten()
    }

    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        self.with_value(key, |data| value::decode_string_list(data))
            .flatten()
    }

    /// Size of the stored value: the raw encoded size, or with
    /// `actual = true` the payload size behind the length prefix when
    /// the value carries one.
    pub fn value_size(&self, key: &str, actual: bool) -> usize {
        self.with_value(key, |data| {
            if actual {
                value::payload_len(data).unwrap_or(data.len())
            } else {
                data.len()
            }
        })
        .unwrap_or(0)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.with_value(key, |_| ()).is_some()
    }

    pub fn count(&self) -> usize {
        let mut core = self.core.lock();
        core.check_load_data();
        core.dic.len()
    }

    /// Valid length of the log region (the bytes holding live and
    /// superseded entries).
    pub fn actual_size(&self) -> usize {
        let mut core = self.core.lock();
        core.check_load_data();
        core.actual_size
    }

    /// Current size of the primary file.
    pub fn total_size(&self) -> usize {
        let mut core = self.core.lock();
        core.check_load_data();
        core.file.as_ref().map_or(0, |f| f.size())
    }

    pub fn all_keys(&self) -> Vec<String> {
        let mut core = self.core.lock();
        core.check_load_data();
        core.dic.keys().cloned().collect()
    }

    /// Remove one key; absent keys are a no-op.
    pub fn remove(&self, key: &str) {
        self.core.lock().remove_entry(key);
    }

    /// Remove several keys with one compaction instead of a tombstone
    /// per key.
    pub fn remove_many(&self, keys: &[&str]) {
        self.core.lock().remove_entries(keys);
    }

    /// Drop every entry and shrink the file back to one page.
    pub fn clear_all(&self) {
        self.core.lock().clear_all();
    }

    /// Compact and halve the file while more than half of it is free.
    pub fn trim(&self) {
        self.core.lock().trim();
    }

    /// Flush to storage. `stable = true` blocks until the data is on
    /// disk and checkpoints the synced state for crash recovery;
    /// `stable = false` only schedules the writeback.
    pub fn sync(&self, stable: bool) {
        self.core.lock().sync(stable);
    }

    /// Install, change or (with `None`) remove the encryption key,
    /// rewriting the whole log under the new cipher.
    pub fn rekey(&self, new_key: Option<&[u8]>) -> bool {
        self.core.lock().rekey(new_key)
    }

    /// The current encryption key, if any.
    pub fn crypt_key(&self) -> Option<Vec<u8>> {
        self.core.lock().crypt_key()
    }

    /// Re-run the cross-process coherence check immediately instead of
    /// waiting for the next operation.
    pub fn check_content_changed(&self) {
        self.core.lock().check_load_data();
    }

    /// Drop this store from the process-wide registry. Outstanding
    /// `Arc` clones stay usable; the backing resources are released
    /// when the last one goes away. The shared mapping already holds
    /// every write, so closing without [`Store::sync`] loses nothing
    /// short of a machine crash.
    pub fn close(&self) {
        crate::registry::remove_instance(&self.id);
    }

    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut StoreCore) -> R) -> R {
        f(&mut self.core.lock())
    }

    fn set_data(&self, key: &str, data: Vec<u8>) -> bool {
        if key.is_empty() || data.is_empty() {
            return false;
        }
        self.core.lock().set_entry(key, data)
    }

    fn with_value<R>(&self, key: &str, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        if key.is_empty() {
            return None;
        }
        let mut core = self.core.lock();
        core.check_load_data();
        core.dic.get(key).map(|data| f(data))
    }
}
