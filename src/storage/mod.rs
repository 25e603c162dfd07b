//! # Storage Module
//!
//! The three on-disk artifacts of a store:
//!
//! - [`file`]: the primary memory-mapped log file (4-byte length mirror
//!   plus the append log, page-multiple sized)
//! - [`meta`]: the one-page sidecar carrying CRC, sizes, version,
//!   sequence, IV and the last-confirmed checkpoint
//! - [`lock`]: the reference-counted advisory file lock on the sidecar
//!   fd that coordinates readers and writers across processes
//!
//! Everything here is mechanism; the policies (validation, recovery,
//! coherence, growth) live in [`crate::store`].

pub mod file;
pub mod lock;
pub mod meta;

pub use file::LogFile;
pub use lock::{FileLock, FileLockGuard, LockKind};
pub use meta::{MetaFile, MetaRecord};
