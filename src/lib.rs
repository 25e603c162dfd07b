//! # pagekv - Embedded Memory-Mapped Key/Value Store
//!
//! pagekv persists a flat mapping from string keys to typed values in a
//! single memory-mapped file, optimized for many small writes and fast
//! reads. Writes append to a growing log; the in-memory view is the
//! last-write-wins replay of that log, rebuilt on load and compacted
//! when the file would otherwise grow.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagekv::{OpenMode, StoreOptions};
//!
//! pagekv::initialize("/var/lib/myapp")?;
//!
//! let store = StoreOptions::new("settings")
//!     .mode(OpenMode::MULTI_PROCESS)
//!     .open()?;
//!
//! store.set_string("user", "alice");
//! store.set_i32("launch_count", store.get_i32("launch_count", 0) + 1);
//! store.sync(true);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Registry (one handle per id)      │
//! ├──────────────────────────────────────────┤
//! │   Store: typed API over the dictionary   │
//! ├────────────────────┬─────────────────────┤
//! │  Write path        │  Coherence protocol │
//! │  append/compact    │  sequence+crc check │
//! ├────────────────────┴─────────────────────┤
//! │  Integrity: CRC-32, last-confirmed,      │
//! │  recovery hooks                          │
//! ├──────────────────────────────────────────┤
//! │  storage: mmap'd log file, sidecar,      │
//! │  advisory file lock                      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! Two files per store:
//!
//! ```text
//! <root>/<id>        4-byte LE length mirror ∥ append log ∥ zero fill
//! <root>/<id>.crc    one page: CRC, sizes, version, sequence, IV,
//!                    last-confirmed checkpoint
//! ```
//!
//! The primary file is always a positive multiple of the system page
//! size. Each log entry is `varint(key_len) ∥ key ∥ varint(value_len) ∥
//! value`; a zero-length value is a tombstone.
//!
//! ## Cross-Process Use
//!
//! Stores opened with [`OpenMode::MULTI_PROCESS`] coordinate through an
//! advisory file lock and detect foreign writes via the sidecar: a
//! sequence change means a wholesale rewrite (full reload), a CRC
//! change means appended entries (the new tail alone is replayed).
//!
//! ## Durability & Recovery
//!
//! Nothing is guaranteed durable until [`Store::sync`] with
//! `stable = true`, which also checkpoints the synced state. On load,
//! a store whose CRC does not match rolls back to that checkpoint, or
//! asks the host's [`StoreEventHandler`] whether to salvage the intact
//! prefix or start empty. Corruption is never fatal.
//!
//! ## Module Overview
//!
//! - [`config`]: open modes, layout constants, page size
//! - [`encoding`]: varints, the record codec, typed value codecs
//! - [`crypto`]: the AES-CFB stream cipher for at-rest encryption
//! - [`storage`]: mmap'd log file, sidecar record, advisory file lock
//! - [`store`]: validation, coherence, write path, the public handle
//! - [`registry`]: process-wide identity → handle table

pub mod config;
pub mod crypto;
pub mod encoding;
pub mod hooks;
pub mod registry;
pub mod storage;
pub mod store;

pub use config::{page_size, OpenMode, DEFAULT_STORE_ID, LEN_PREFIX_SIZE};
pub use hooks::{
    register_event_handler, set_content_change_notification, unregister_event_handler,
    RecoveryStrategy, StoreEventHandler,
};
#[cfg(unix)]
pub use registry::open_with_shared_memory;
pub use registry::{
    default_store, initialize, on_exit, open, validate_store_file, StoreOptions,
};
pub use store::Store;
