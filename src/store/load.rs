//! # Validation, Cold Load and Cross-Process Coherence
//!
//! The integrity protocol decides how much of the log region can be
//! trusted, in order of preference:
//!
//! 1. the sidecar's current `(actual_size, crc_digest)` pair;
//! 2. the 4-byte length mirror, when it disagrees with a sidecar that
//!    nonetheless vouches for it (a store that was downgraded and
//!    upgraded again);
//! 3. the last-confirmed checkpoint captured at the most recent
//!    sequence bump or stable sync;
//! 4. whatever the host's recovery hook allows: a best-effort load of
//!    the intact prefix followed by a full rewrite, or a discard.
//!
//! Coherence across processes rides on two sidecar fields: a sequence
//! delta means the log was rewritten wholesale (reload everything), a
//! CRC delta with an unchanged sequence means another process appended
//! (replay just the new tail).

use tracing::{debug, error, info, warn};

use crate::config::{page_size, LEN_PREFIX_SIZE};
use crate::encoding::record::replay_into;
use crate::hooks::{self, RecoveryStrategy};
use crate::storage::lock::LockKind;
use crate::storage::meta::{V3_RANDOM_IV, V4_ACTUAL_SIZE};
use crate::storage::LogFile;

use super::core::{crc32_append, StoreCore};

impl StoreCore {
    /// Cold load: map the file, validate, decrypt, replay.
    pub(super) fn load_from_file(&mut self) {
        if self.shared_memory {
            self.load_from_shared_memory();
            return;
        }

        self.meta = self.meta_file.record();
        if let Some(crypter) = &mut self.crypter {
            if self.meta.version() >= V3_RANDOM_IV {
                let iv = *self.meta.iv();
                crypter.reset(&iv);
            }
        }

        match LogFile::open(&self.path, self.requested_size.max(page_size())) {
            Ok(file) => self.file = Some(file),
            Err(err) => {
                error!(store = %self.id, %err, "failed to open store file");
                self.need_load_from_file = false;
                return;
            }
        }

        let (load, need_full_writeback) = self.check_data_valid();
        info!(
            store = %self.id,
            actual_size = self.actual_size,
            file_size = self.file.as_ref().map_or(0, LogFile::size),
            version = self.meta.version(),
            sequence = self.meta.sequence(),
            inter_process = self.inter_process,
            "loading store"
        );

        self.need_load_from_file = false;
        if load && self.actual_size > 0 {
            self.replay_log_region();
            if need_full_writeback {
                self.full_writeback();
            }
        } else {
            // invalid or empty: reset logical state, bumping the
            // sequence only when non-zero content is being discarded
            self.with_file_lock(LockKind::Exclusive, |core| {
                let discarding = core.actual_size > 0;
                core.write_meta(0, 0, None, discarding);
                if discarding {
                    core.sync(true);
                }
            });
            self.dic.clear();
        }
        debug!(store = %self.id, values = self.dic.len(), "loaded store");
    }

    fn load_from_shared_memory(&mut self) {
        self.meta = self.meta_file.record();
        if let Some(crypter) = &mut self.crypter {
            if self.meta.version() >= V3_RANDOM_IV {
                let iv = *self.meta.iv();
                crypter.reset(&iv);
            }
        }

        self.actual_size = self.read_actual_size();
        let mut loaded = false;
        if self.actual_size > 0 {
            let (load, _) = self.check_data_valid();
            if load && self.actual_size > 0 {
                self.replay_log_region();
                loaded = true;
            }
        }
        self.need_load_from_file = false;
        if !loaded {
            self.with_file_lock(LockKind::Exclusive, |core| {
                let discarding = core.actual_size > 0;
                core.write_meta(0, 0, None, discarding);
            });
            self.dic.clear();
        }
        debug!(store = %self.id, values = self.dic.len(), "loaded shared-memory store");
    }

    /// Decrypt (if needed) and replay `[4, 4 + actual_size)` into the
    /// dictionary, leaving the output cursor at `actual_size`.
    fn replay_log_region(&mut self) {
        let plain = {
            let Some(file) = self.file.as_ref() else {
                return;
            };
            let raw = &file.log()[..self.actual_size];
            match &mut self.crypter {
                Some(crypter) => crypter.decrypt(raw),
                None => raw.to_vec(),
            }
        };
        self.dic.clear();
        replay_into(&mut self.dic, &plain);
    }

    /// Decide how much of the log is trustworthy. Returns
    /// `(load, need_full_writeback)` and leaves `self.actual_size` and
    /// `self.crc_digest` describing the range to load.
    fn check_data_valid(&mut self) -> (bool, bool) {
        let Some(file_size) = self.file.as_ref().map(LogFile::size) else {
            return (false, false);
        };

        self.actual_size = self.read_actual_size();

        if self.actual_size < file_size && self.actual_size + LEN_PREFIX_SIZE <= file_size {
            if self.check_file_crc(self.actual_size, self.meta.crc_digest()) {
                return (true, false);
            }
            if self.try_last_confirmed(file_size) {
                return (true, false);
            }
            let strategy = hooks::crc_check_fail_strategy(&self.id);
            info!(store = %self.id, ?strategy, "recovery strategy after crc failure");
            if strategy == RecoveryStrategy::Recover {
                return (true, true);
            }
        } else {
            error!(
                store = %self.id,
                actual_size = self.actual_size,
                file_size,
                "recorded length out of range"
            );
            if self.try_last_confirmed(file_size) {
                return (true, false);
            }
            let strategy = hooks::file_length_error_strategy(&self.id);
            info!(store = %self.id, ?strategy, "recovery strategy after length error");
            if strategy == RecoveryStrategy::Recover {
                // make sure we don't over-read the file
                self.actual_size = file_size - LEN_PREFIX_SIZE;
                return (true, true);
            }
        }
        (false, false)
    }

    /// Roll back to a state the sidecar can still vouch for: either the
    /// length mirror (downgrade-and-upgrade reconciliation) or the
    /// last-confirmed checkpoint.
    fn try_last_confirmed(&mut self, file_size: usize) -> bool {
        if self.meta.version() < V4_ACTUAL_SIZE {
            return false;
        }

        let mirror = self.file.as_ref().map_or(0, |f| f.read_len_prefix() as usize);
        if mirror != self.actual_size && self.check_file_crc(mirror, self.meta.crc_digest()) {
            info!(store = %self.id, mirror, "length mirror validates, store was downgraded and upgraded");
            let crc = self.meta.crc_digest();
            self.write_meta(mirror, crc, None, false);
            return true;
        }

        let (last_size, last_crc) = self.meta.last_confirmed();
        let last_size = last_size as usize;
        if last_size < file_size && last_size + LEN_PREFIX_SIZE <= file_size {
            if self.check_file_crc(last_size, last_crc) {
                warn!(store = %self.id, last_size, "rolling back to last-confirmed checkpoint");
                self.write_meta(last_size, last_crc, None, false);
                return true;
            }
            error!(store = %self.id, last_size, last_crc, "last-confirmed checkpoint does not verify");
        } else {
            error!(store = %self.id, last_size, file_size, "last-confirmed checkpoint out of range");
        }
        false
    }

    /// The coherence check run at the top of every public operation.
    pub(super) fn check_load_data(&mut self) {
        if self.need_load_from_file {
            self.need_load_from_file = false;
            self.with_file_lock(LockKind::Shared, |core| core.load_from_file());
            return;
        }
        if !self.inter_process {
            return;
        }

        let fresh = self.meta_file.record();
        if fresh.sequence() != self.meta.sequence() {
            // another process compacted, cleared or rekeyed
            info!(
                store = %self.id,
                old_sequence = self.meta.sequence(),
                new_sequence = fresh.sequence(),
                "outer process rewrote the store"
            );
            self.with_file_lock(LockKind::Shared, |core| {
                core.clear_memory_state();
                core.need_load_from_file = false;
                core.load_from_file();
            });
            hooks::notify_content_changed(&self.id);
        } else if fresh.crc_digest() != self.meta.crc_digest() {
            // another process appended
            debug!(
                store = %self.id,
                old_crc = self.meta.crc_digest(),
                new_crc = fresh.crc_digest(),
                "outer process appended to the store"
            );
            self.with_file_lock(LockKind::Shared, |core| {
                let (mapped, on_disk) = match core.file.as_ref() {
                    Some(file) if core.shared_memory => (file.size(), file.size()),
                    Some(file) => (file.size(), file.file_len().unwrap_or(file.size())),
                    None => (0, 0),
                };
                if mapped != on_disk {
                    info!(store = %core.id, mapped, on_disk, "file size changed, full reload");
                    core.clear_memory_state();
                    core.need_load_from_file = false;
                    core.load_from_file();
                } else {
                    core.partial_load_from_file();
                }
            });
            hooks::notify_content_changed(&self.id);
        }
    }

    /// Replay only the tail another process appended since our last
    /// observation; falls back to a full reload when anything about the
    /// fresh sidecar does not line up.
    fn partial_load_from_file(&mut self) {
        self.meta = self.meta_file.record();
        let old_actual_size = self.actual_size;
        self.actual_size = self.read_actual_size();
        debug!(
            store = %self.id,
            old_actual_size,
            new_actual_size = self.actual_size,
            "partial reload"
        );

        if self.actual_size > 0 && self.actual_size > old_actual_size {
            let in_range = self.file.as_ref().is_some_and(|f| {
                self.actual_size < f.size() && self.actual_size + LEN_PREFIX_SIZE <= f.size()
            });
            if in_range {
                let tail_crc = {
                    let Some(file) = self.file.as_ref() else {
                        return;
                    };
                    let raw = &file.log()[old_actual_size..self.actual_size];
                    crc32_append(self.crc_digest, raw)
                };
                if tail_crc == self.meta.crc_digest() {
                    self.crc_digest = tail_crc;
                    let plain = {
                        let Some(file) = self.file.as_ref() else {
                            return;
                        };
                        let raw = &file.log()[old_actual_size..self.actual_size];
                        match &mut self.crypter {
                            Some(crypter) => crypter.decrypt(raw),
                            None => raw.to_vec(),
                        }
                    };
                    replay_into(&mut self.dic, &plain);
                    self.has_full_writeback = false;
                    debug!(store = %self.id, values = self.dic.len(), "partially loaded");
                    return;
                }
                error!(
                    store = %self.id,
                    computed = tail_crc,
                    expected = self.meta.crc_digest(),
                    "tail crc mismatch, falling back to full reload"
                );
            }
        }

        self.clear_memory_state();
        self.need_load_from_file = false;
        self.load_from_file();
    }
}
