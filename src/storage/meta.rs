//! # Sidecar Metadata
//!
//! Every store carries a one-page sidecar file (`<name>.crc`) whose
//! first 40 bytes are the [`MetaRecord`]: the authoritative CRC and
//! length of the log region, a monotone format version, a sequence
//! counter advanced by structural rewrites, the cipher IV, and the
//! last-confirmed checkpoint used for crash recovery.
//!
//! ## Record Layout
//!
//! ```text
//! Offset  Size  Description
//! 0       4     crc_digest (CRC-32 of the on-disk log region, LE)
//! 4       4     actual_size (authoritative for version >= V4, LE)
//! 8       4     version (LE)
//! 12      4     sequence (LE)
//! 16      16    cipher IV (meaningful for version >= V3)
//! 32      4     last_confirmed.actual_size (LE)
//! 36      4     last_confirmed.crc_digest (LE)
//! ```
//!
//! The remainder of the page is zero. Routine appends rewrite only the
//! first eight bytes (the fast path); version changes, IV changes and
//! sequence bumps rewrite the whole record.
//!
//! ## Zerocopy Safety
//!
//! The record uses zerocopy traits (`FromBytes`, `IntoBytes`,
//! `Immutable`, `KnownLayout`, `Unaligned`) so it can be read from and
//! written to the mmap'd page without intermediate buffers, with all
//! multi-byte fields little-endian via `U32<LittleEndian>`.

use std::fs::OpenOptions;
#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::page_size;

/// Schema versions, in ascending order. A store's version never
/// decreases.
pub const V1_PLAIN: u32 = 0;
/// First version with a meaningful sequence counter.
pub const V2_SEQUENCE: u32 = 1;
/// First version whose cipher IV is drawn at random and recorded here.
pub const V3_RANDOM_IV: u32 = 2;
/// First version where `actual_size` in this record is authoritative
/// and the last-confirmed checkpoint is maintained.
pub const V4_ACTUAL_SIZE: u32 = 3;

/// Length of the cipher IV field.
pub const IV_LEN: usize = 16;

/// Serialized size of [`MetaRecord`].
pub const META_RECORD_SIZE: usize = 40;

/// Bytes covered by the fast-path write (`crc_digest` + `actual_size`).
pub const META_FAST_PATH_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaRecord {
    crc_digest: U32,
    actual_size: U32,
    version: U32,
    sequence: U32,
    iv: [u8; IV_LEN],
    last_actual_size: U32,
    last_crc_digest: U32,
}

const _: () = assert!(std::mem::size_of::<MetaRecord>() == META_RECORD_SIZE);

impl MetaRecord {
    pub fn crc_digest(&self) -> u32 {
        self.crc_digest.get()
    }

    pub fn set_crc_digest(&mut self, crc: u32) {
        self.crc_digest = U32::new(crc);
    }

    pub fn actual_size(&self) -> u32 {
        self.actual_size.get()
    }

    pub fn set_actual_size(&mut self, size: u32) {
        self.actual_size = U32::new(size);
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    /// Raise the version to at least `version`; versions never go down.
    pub fn upgrade_version(&mut self, version: u32) -> bool {
        if self.version.get() < version {
            self.version = U32::new(version);
            true
        } else {
            false
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence.get()
    }

    pub fn bump_sequence(&mut self) {
        self.sequence = U32::new(self.sequence.get().wrapping_add(1));
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn set_iv(&mut self, iv: &[u8; IV_LEN]) {
        self.iv = *iv;
    }

    pub fn last_confirmed(&self) -> (u32, u32) {
        (self.last_actual_size.get(), self.last_crc_digest.get())
    }

    pub fn set_last_confirmed(&mut self, actual_size: u32, crc: u32) {
        self.last_actual_size = U32::new(actual_size);
        self.last_crc_digest = U32::new(crc);
    }
}

/// The mmap'd sidecar file.
pub struct MetaFile {
    file: std::fs::File,
    mmap: MmapMut,
}

impl MetaFile {
    /// Open (creating if absent) the sidecar at `path`, sized to one
    /// page, and map it shared read/write.
    pub fn open(path: &Path) -> Result<MetaFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open sidecar '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat sidecar '{}'", path.display()))?
            .len();
        let page = page_size() as u64;
        if len < page {
            file.set_len(page)
                .wrap_err_with(|| format!("failed to size sidecar '{}'", path.display()))?;
        }

        Self::map(file)
    }

    /// Adopt a shared-memory sidecar fd handed in by the host.
    #[cfg(unix)]
    pub fn from_fd(fd: OwnedFd) -> Result<MetaFile> {
        let file = std::fs::File::from(fd);
        let len = file.metadata().wrap_err("failed to stat sidecar fd")?.len();
        ensure!(
            len >= META_RECORD_SIZE as u64,
            "sidecar fd too small: {} bytes",
            len
        );
        Self::map(file)
    }

    fn map(file: std::fs::File) -> Result<MetaFile> {
        // SAFETY: the sidecar is deliberately mapped shared so that other
        // processes observe meta writes; all access goes through
        // record()/write_record()/write_size_and_crc() which operate on
        // the fixed 40-byte prefix well inside the one-page mapping, and
        // cross-process write ordering is handled by the advisory file
        // lock taken on this same fd.
        let mmap = unsafe { MmapMut::map_mut(&file).wrap_err("failed to mmap sidecar")? };
        Ok(MetaFile { file, mmap })
    }

    /// Copy the current record out of the mapping.
    pub fn record(&self) -> MetaRecord {
        MetaRecord::read_from_bytes(&self.mmap[..META_RECORD_SIZE])
            .unwrap_or_else(|_| MetaRecord::new_zeroed())
    }

    /// Write the whole record.
    pub fn write_record(&mut self, record: &MetaRecord) {
        self.mmap[..META_RECORD_SIZE].copy_from_slice(record.as_bytes());
    }

    /// Fast path: write only `crc_digest` and `actual_size`.
    pub fn write_size_and_crc(&mut self, record: &MetaRecord) {
        self.mmap[..META_FAST_PATH_SIZE].copy_from_slice(&record.as_bytes()[..META_FAST_PATH_SIZE]);
    }

    /// Flush the page to stable storage (`stable`) or schedule an async
    /// writeback.
    pub fn flush(&self, stable: bool) -> Result<()> {
        if stable {
            self.mmap.flush().wrap_err("failed to msync sidecar")
        } else {
            self.mmap.flush_async().wrap_err("failed to schedule sidecar msync")
        }
    }

    pub fn file(&self) -> &std::fs::File {
        &self.file
    }
}
