//! # Write Path
//!
//! Appends are cheap: serialize at the output cursor, encrypt in place,
//! extend the running CRC, rewrite eight sidecar bytes. Everything
//! structural — compaction, growth, clear, trim, rekey — funnels
//! through a full writeback that re-encodes the dictionary, advances
//! the sequence and refreshes the last-confirmed checkpoint.
//!
//! Growth doubles the file until a compacted image plus a headroom
//! estimate fits; the estimate scales with the average entry size so
//! stores with many small entries are not resized on every other
//! write. A failed resize restores the previous file size and fails
//! the triggering operation, leaving prior state intact.

use tracing::{error, info, warn};

use crate::config::{page_size, round_up_to_page, LEN_PREFIX_SIZE};
use crate::crypto::StreamCrypter;
use crate::encoding::record::{encode_map, entry_size, write_entry};
use crate::storage::lock::LockKind;
use crate::storage::meta::{IV_LEN, V4_ACTUAL_SIZE};

use super::core::{crc32_append, crc32_of, StoreCore};

impl StoreCore {
    /// Insert or overwrite one entry. `data` is the typed-encoded value.
    pub(crate) fn set_entry(&mut self, key: &str, data: Vec<u8>) -> bool {
        if key.is_empty() || data.is_empty() {
            return false;
        }
        self.with_file_lock(LockKind::Exclusive, |core| {
            core.check_load_data();
            if core.append_record(key, &data) {
                core.dic.insert(key.to_owned(), data);
                core.has_full_writeback = false;
                true
            } else {
                false
            }
        })
    }

    /// Remove one entry by appending a tombstone. Absent keys are a
    /// no-op.
    pub(crate) fn remove_entry(&mut self, key: &str) {
        if key.is_empty() {
            return;
        }
        self.with_file_lock(LockKind::Exclusive, |core| {
            core.check_load_data();
            if core.dic.remove(key).is_some() {
                core.has_full_writeback = false;
                core.append_record(key, b"");
            }
        });
    }

    /// Remove several entries with a single compaction instead of a
    /// tombstone per key.
    pub(crate) fn remove_entries(&mut self, keys: &[&str]) {
        if keys.is_empty() {
            return;
        }
        if let [key] = keys {
            self.remove_entry(key);
            return;
        }
        self.with_file_lock(LockKind::Exclusive, |core| {
            core.check_load_data();
            for key in keys {
                core.dic.remove(*key);
            }
            core.has_full_writeback = false;
            core.full_writeback();
        });
    }

    /// Append one serialized entry at the output cursor.
    fn append_record(&mut self, key: &str, value: &[u8]) -> bool {
        let size = entry_size(key, value);
        if !self.ensure_capacity(size) {
            return false;
        }
        if !self.is_file_valid() {
            warn!(store = %self.id, "store file not valid");
            return false;
        }

        let start = self.actual_size;
        {
            let Some(file) = self.file.as_mut() else {
                return false;
            };
            let window = &mut file.log_mut()[start..start + size];
            if write_entry(window, key, value).is_err() {
                return false;
            }
            if let Some(crypter) = &mut self.crypter {
                crypter.encrypt_in_place(window);
            }
        }

        let crc = {
            let Some(file) = self.file.as_ref() else {
                return false;
            };
            crc32_append(self.crc_digest, &file.log()[start..start + size])
        };
        self.write_meta(start + size, crc, None, false);
        true
    }

    /// Make room for `incoming` bytes at the output cursor, compacting
    /// (and possibly growing the file) when the free tail is too small.
    fn ensure_capacity(&mut self, incoming: usize) -> bool {
        if !self.is_file_valid() {
            warn!(store = %self.id, "store file not valid");
            return false;
        }
        let Some(file_size) = self.file.as_ref().map(|f| f.size()) else {
            return false;
        };

        // an empty dictionary always takes the rewrite path: the first
        // write is what installs the random IV of an encrypted store
        let space_left = file_size - LEN_PREFIX_SIZE - self.actual_size;
        if incoming < space_left && !self.dic.is_empty() {
            return true;
        }

        // try a full rewrite to reclaim superseded entries
        let compacted = encode_map(&self.dic);
        let needed = compacted.len() + LEN_PREFIX_SIZE + incoming;

        if self.shared_memory {
            if needed > file_size {
                error!(
                    store = %self.id,
                    needed,
                    file_size,
                    "shared-memory store reached its size limit"
                );
                return false;
            }
        } else {
            let average_entry = needed / self.dic.len().max(1);
            let future_usage = average_entry * ((self.dic.len() + 1) / 2).max(8);
            if needed + future_usage >= file_size {
                let mut new_size = file_size;
                while needed + future_usage >= new_size {
                    new_size *= 2;
                }
                info!(
                    store = %self.id,
                    old_size = file_size,
                    new_size,
                    incoming,
                    future_usage,
                    "extending store file"
                );
                let resized = match self.file.as_mut() {
                    Some(file) => file.resize(new_size),
                    None => return false,
                };
                if let Err(err) = resized {
                    // resize() rolled the file length back already
                    error!(store = %self.id, %err, "failed to extend store file");
                    return false;
                }
            }
        }

        self.do_full_writeback(compacted)
    }

    /// Re-encode the dictionary and replace the log region, unless a
    /// previous writeback is still current.
    pub(crate) fn full_writeback(&mut self) -> bool {
        if self.has_full_writeback || self.need_load_from_file {
            return true;
        }
        if !self.is_file_valid() {
            warn!(store = %self.id, "store file not valid");
            return false;
        }
        if self.dic.is_empty() {
            self.clear_all();
            return true;
        }

        let all = encode_map(&self.dic);
        self.with_file_lock(LockKind::Exclusive, |core| {
            let Some(file_size) = core.file.as_ref().map(|f| f.size()) else {
                return false;
            };
            if all.len() + LEN_PREFIX_SIZE <= file_size {
                core.do_full_writeback(all)
            } else {
                // ensure_capacity extends the file and rewrites itself
                core.ensure_capacity(all.len() + LEN_PREFIX_SIZE - file_size)
            }
        })
    }

    /// Replace the log region with `all`, drawing a fresh IV when
    /// encrypted, recomputing the CRC from scratch and bumping the
    /// sequence.
    fn do_full_writeback(&mut self, mut all: Vec<u8>) -> bool {
        let mut new_iv = None;
        if let Some(crypter) = &mut self.crypter {
            let mut iv = [0u8; IV_LEN];
            StreamCrypter::fill_random_iv(&mut iv);
            crypter.reset(&iv);
            crypter.encrypt_in_place(&mut all);
            new_iv = Some(iv);
        }

        {
            let Some(file) = self.file.as_mut() else {
                return false;
            };
            if all.len() + LEN_PREFIX_SIZE > file.size() {
                error!(
                    store = %self.id,
                    rewrite = all.len(),
                    file_size = file.size(),
                    "rewrite does not fit the store file"
                );
                return false;
            }
            file.log_mut()[..all.len()].copy_from_slice(&all);
        }

        let crc = {
            let Some(file) = self.file.as_ref() else {
                return false;
            };
            crc32_of(&file.log()[..all.len()])
        };
        self.write_meta(all.len(), crc, new_iv.as_ref(), true);
        self.sync(true);
        self.has_full_writeback = true;
        true
    }

    /// Drop every entry, shrink the file back to one page and reload.
    pub(crate) fn clear_all(&mut self) {
        info!(store = %self.id, "clearing all entries");
        self.with_file_lock(LockKind::Exclusive, |core| {
            if core.need_load_from_file && !core.shared_memory {
                // never loaded in this process: drop the file wholesale
                let _ = std::fs::remove_file(&core.path);
                core.need_load_from_file = false;
                core.load_from_file();
                return;
            }

            if let Some(file) = core.file.as_mut() {
                if let Err(err) = file.zero_first_page() {
                    error!(store = %core.id, %err, "failed to zero first page");
                }
                if file.growable() && file.size() != page_size() {
                    info!(
                        store = %core.id,
                        old_size = file.size(),
                        new_size = page_size(),
                        "truncating store file"
                    );
                    if let Err(err) = file.resize(page_size()) {
                        error!(store = %core.id, %err, "failed to truncate store file");
                    }
                }
            }

            let mut new_iv = None;
            if let Some(crypter) = &mut core.crypter {
                let mut iv = [0u8; IV_LEN];
                StreamCrypter::fill_random_iv(&mut iv);
                crypter.reset(&iv);
                new_iv = Some(iv);
            }
            core.write_meta(0, 0, new_iv.as_ref(), true);
            if let Err(err) = core.meta_file.flush(true) {
                error!(store = %core.id, %err, "failed to msync sidecar");
            }

            core.clear_memory_state();
            core.need_load_from_file = false;
            core.load_from_file();
        });
    }

    /// Compact, then halve the file while more than half of it is free.
    /// Shared-memory stores cannot be resized, so this is a no-op there.
    pub(crate) fn trim(&mut self) {
        if self.shared_memory {
            info!(store = %self.id, "shared-memory store cannot be trimmed");
            return;
        }
        self.check_load_data();

        if self.actual_size == 0 {
            self.clear_all();
            return;
        }
        if self.file.as_ref().map_or(true, |f| f.size() <= page_size()) {
            return;
        }

        self.with_file_lock(LockKind::Exclusive, |core| {
            core.full_writeback();
            let Some(file) = core.file.as_mut() else {
                return;
            };
            let old_size = file.size();
            let mut new_size = old_size;
            while new_size > (core.actual_size + LEN_PREFIX_SIZE) * 2 {
                new_size /= 2;
            }
            new_size = round_up_to_page(new_size.max(page_size()));
            if new_size == old_size {
                info!(
                    store = %core.id,
                    file_size = old_size,
                    actual_size = core.actual_size,
                    "no need to trim"
                );
                return;
            }

            info!(
                store = %core.id,
                old_size,
                new_size,
                actual_size = core.actual_size,
                "trimming store file"
            );
            if let Err(err) = file.resize(new_size) {
                error!(store = %core.id, %err, "failed to trim store file");
            }
        });
    }

    /// Change, install or remove the encryption key, rewriting the whole
    /// log under the new cipher.
    pub(crate) fn rekey(&mut self, new_key: Option<&[u8]>) -> bool {
        self.check_load_data();

        let new_key = new_key.filter(|k| !k.is_empty());
        match (&self.crypter, new_key) {
            (Some(crypter), Some(key)) if crypter.key() == key => true,
            (None, None) => true,
            (_, key) => {
                info!(store = %self.id, encrypted = key.is_some(), "rekeying store");
                self.crypter = key.map(StreamCrypter::new);
                // the flag would short-circuit the rewrite we need
                self.has_full_writeback = false;
                self.full_writeback()
            }
        }
    }

    /// Flush the mapping (and sidecar) to storage. A stable sync also
    /// captures the last-confirmed checkpoint: everything up to
    /// `actual_size` is durable from here on, so it is a safe anchor
    /// for crash recovery.
    pub(crate) fn sync(&mut self, stable: bool) {
        if self.need_load_from_file || !self.is_file_valid() {
            return;
        }
        self.with_file_lock(LockKind::Exclusive, |core| {
            if let Some(file) = core.file.as_ref() {
                if let Err(err) = file.flush(stable) {
                    error!(store = %core.id, %err, "failed to msync store file");
                }
            }

            if stable {
                // only checkpoint a view the sidecar still agrees with;
                // a concurrent writer may have moved past us
                let fresh = core.meta_file.record();
                if fresh.sequence() == core.meta.sequence()
                    && fresh.crc_digest() == core.meta.crc_digest()
                {
                    core.meta
                        .set_last_confirmed(core.actual_size as u32, core.crc_digest);
                    core.meta.upgrade_version(V4_ACTUAL_SIZE);
                    core.meta_file.write_record(&core.meta);
                }
            }
            if let Err(err) = core.meta_file.flush(stable) {
                error!(store = %core.id, %err, "failed to msync sidecar");
            }
        });
    }
}
