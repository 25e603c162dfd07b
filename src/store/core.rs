//! # Store State
//!
//! `StoreCore` owns everything behind one store handle: the mmap'd
//! primary file, the sidecar, the cipher, the in-memory dictionary and
//! the inter-process lock. It is always driven under the per-store
//! mutex held by [`super::Store`], so its internals are free to use
//! plain fields.
//!
//! The flows split across this module's siblings:
//!
//! - construction, meta discipline and shared helpers live here
//! - validation, cold load and cross-process coherence in `load`
//! - the append/compaction/clear/trim write path in `write`

#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use eyre::Result;
use hashbrown::HashMap;
use tracing::warn;
use zerocopy::FromZeros;

use crate::config::{OpenMode, LEN_PREFIX_SIZE};
use crate::crypto::StreamCrypter;
use crate::storage::lock::LockKind;
use crate::storage::meta::{V2_SEQUENCE, V3_RANDOM_IV, V4_ACTUAL_SIZE};
use crate::storage::{FileLock, LogFile, MetaFile, MetaRecord};

/// Compute a CRC-32 from scratch.
pub(super) fn crc32_of(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Continue a running CRC-32; `crc32_append(crc32_of(a), b)` equals
/// `crc32_of(a ∥ b)`.
pub(super) fn crc32_append(initial: u32, bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(initial);
    hasher.update(bytes);
    hasher.finalize()
}

pub(crate) struct StoreCore {
    pub(super) id: String,
    pub(super) path: PathBuf,
    pub(super) meta_file: MetaFile,
    /// Cached copy of the sidecar record as this process last wrote or
    /// observed it; compared against fresh reads by the coherence check.
    pub(super) meta: MetaRecord,
    pub(super) file: Option<LogFile>,
    pub(super) dic: HashMap<String, Vec<u8>>,
    pub(super) crypter: Option<StreamCrypter>,
    /// Running CRC of the on-disk log region `[4, 4 + actual_size)`.
    pub(super) crc_digest: u32,
    /// Valid length of the log region; doubles as the output cursor.
    pub(super) actual_size: usize,
    pub(super) requested_size: usize,
    pub(super) inter_process: bool,
    pub(super) shared_memory: bool,
    pub(super) need_load_from_file: bool,
    pub(super) has_full_writeback: bool,
    pub(super) file_lock: FileLock,
}

impl StoreCore {
    pub(crate) fn open_on_disk(
        id: String,
        path: PathBuf,
        sidecar_path: PathBuf,
        requested_size: usize,
        mode: OpenMode,
        crypt_key: Option<&[u8]>,
    ) -> Result<StoreCore> {
        let meta_file = MetaFile::open(&sidecar_path)?;
        let inter_process = mode.is_inter_process();
        let file_lock = FileLock::new(meta_file.file(), inter_process);

        let mut core = StoreCore {
            id,
            path,
            meta_file,
            meta: MetaRecord::new_zeroed(),
            file: None,
            dic: HashMap::new(),
            crypter: crypt_key.filter(|k| !k.is_empty()).map(StreamCrypter::new),
            crc_digest: 0,
            actual_size: 0,
            requested_size,
            inter_process,
            shared_memory: false,
            need_load_from_file: true,
            has_full_writeback: false,
            file_lock,
        };

        core.with_file_lock(LockKind::Shared, |c| c.load_from_file());
        Ok(core)
    }

    #[cfg(unix)]
    pub(crate) fn open_shared_memory(
        id: String,
        fd: OwnedFd,
        meta_fd: OwnedFd,
        crypt_key: Option<&[u8]>,
    ) -> Result<StoreCore> {
        let meta_file = MetaFile::from_fd(meta_fd)?;
        let file = LogFile::from_fd(fd)?;
        let file_lock = FileLock::new(meta_file.file(), true);

        let mut core = StoreCore {
            id,
            path: PathBuf::new(),
            meta_file,
            meta: MetaRecord::new_zeroed(),
            file: Some(file),
            dic: HashMap::new(),
            crypter: crypt_key.filter(|k| !k.is_empty()).map(StreamCrypter::new),
            crc_digest: 0,
            actual_size: 0,
            requested_size: 0,
            inter_process: true,
            shared_memory: true,
            need_load_from_file: true,
            has_full_writeback: false,
            file_lock,
        };

        core.with_file_lock(LockKind::Shared, |c| c.load_from_file());
        Ok(core)
    }

    /// Run `f` under the inter-process file lock. The lock is
    /// reference-counted, so nesting (a structural operation syncing
    /// while already exclusive) is fine.
    pub(super) fn with_file_lock<R>(
        &mut self,
        kind: LockKind,
        f: impl FnOnce(&mut StoreCore) -> R,
    ) -> R {
        self.file_lock.lock(kind);
        let result = f(self);
        self.file_lock.unlock(kind);
        result
    }

    pub(super) fn is_file_valid(&self) -> bool {
        self.file.as_ref().is_some_and(|f| f.size() > LEN_PREFIX_SIZE)
    }

    /// Authoritative valid length of the log region: the sidecar at
    /// version `V4_ACTUAL_SIZE` and above, the 4-byte mirror otherwise.
    pub(super) fn read_actual_size(&self) -> usize {
        let Some(file) = self.file.as_ref() else {
            return 0;
        };
        let mirror = file.read_len_prefix() as usize;
        if self.meta.version() >= V4_ACTUAL_SIZE {
            let meta_size = self.meta.actual_size() as usize;
            if meta_size != mirror {
                warn!(
                    store = %self.id,
                    mirror,
                    meta_size,
                    "length mirror disagrees with sidecar"
                );
            }
            meta_size
        } else {
            mirror
        }
    }

    /// CRC-verify the first `len` log bytes against `expected`, leaving
    /// the running digest positioned at `len` on success or failure.
    pub(super) fn check_file_crc(&mut self, len: usize, expected: u32) -> bool {
        let Some(file) = self.file.as_ref() else {
            return false;
        };
        if len + LEN_PREFIX_SIZE > file.size() {
            return false;
        }
        self.crc_digest = crc32_of(&file.log()[..len]);
        if self.crc_digest == expected {
            return true;
        }
        warn!(
            store = %self.id,
            expected,
            computed = self.crc_digest,
            "crc check failed"
        );
        false
    }

    /// Update all length/CRC state in memory, the 4-byte mirror, and the
    /// sidecar.
    ///
    /// Sidecar write discipline: a version change, a new IV or a
    /// sequence bump forces a full record write; a routine append
    /// touches only the 8-byte `crc_digest`/`actual_size` fast path.
    /// A sequence bump also captures the last-confirmed checkpoint.
    pub(super) fn write_meta(
        &mut self,
        actual_size: usize,
        crc_digest: u32,
        iv: Option<&[u8; 16]>,
        increase_sequence: bool,
    ) {
        if let Some(file) = self.file.as_mut() {
            file.write_len_prefix(actual_size as u32);
        }

        self.actual_size = actual_size;
        self.crc_digest = crc_digest;
        self.meta.set_actual_size(actual_size as u32);
        self.meta.set_crc_digest(crc_digest);

        let mut full_write = self.meta.upgrade_version(V2_SEQUENCE);
        if let Some(iv) = iv {
            self.meta.set_iv(iv);
            self.meta.upgrade_version(V3_RANDOM_IV);
            full_write = true;
        }
        if increase_sequence {
            self.meta.bump_sequence();
            self.meta.set_last_confirmed(actual_size as u32, crc_digest);
            self.meta.upgrade_version(V4_ACTUAL_SIZE);
            full_write = true;
        }

        if full_write {
            self.meta_file.write_record(&self.meta);
        } else {
            self.meta_file.write_size_and_crc(&self.meta);
        }
    }

    /// Drop every piece of in-memory state so the next operation reloads
    /// from disk. The fds of a shared-memory store cannot be reopened,
    /// so its mapping is kept.
    pub(crate) fn clear_memory_state(&mut self) {
        if self.need_load_from_file {
            return;
        }
        self.need_load_from_file = true;

        self.dic.clear();
        self.has_full_writeback = false;

        if let Some(crypter) = &mut self.crypter {
            if self.meta.version() >= V3_RANDOM_IV {
                let iv = *self.meta.iv();
                crypter.reset(&iv);
            } else {
                crypter.reset_to_key_iv();
            }
        }

        if !self.shared_memory {
            self.file = None;
        }
        self.actual_size = 0;
        self.crc_digest = 0;
        self.meta.set_crc_digest(0);
    }

    /// Replace the cipher when a shared-memory store is reopened with a
    /// different key; the resident dictionary was decoded under the old
    /// key, so it has to be rebuilt from the log.
    pub(crate) fn check_reset_crypt_key(&mut self, key: Option<&[u8]>) {
        let changed = match (&self.crypter, key) {
            (Some(crypter), Some(key)) => crypter.key() != key,
            (None, None) | (None, Some(&[])) => false,
            _ => true,
        };
        if !changed {
            return;
        }
        tracing::info!(store = %self.id, "crypt key changed on reopen, reloading");
        self.crypter = key.filter(|k| !k.is_empty()).map(StreamCrypter::new);
        self.clear_memory_state();
        self.check_load_data();
    }

    pub(super) fn crypt_key(&self) -> Option<Vec<u8>> {
        self.crypter.as_ref().map(|c| c.key().to_vec())
    }
}
