//! # Inter-Process File Lock
//!
//! A reference-counted advisory lock on the sidecar fd, coordinating
//! readers and writers across processes. Within a process the store
//! mutex already serializes access, so the counters only need to make
//! the lock recursive: a structural operation that holds the exclusive
//! lock may nest a `sync` that wants it again.
//!
//! ## Semantics
//!
//! - Shared and exclusive acquisitions are counted separately.
//! - Acquiring shared while any lock is held is a pure count bump.
//! - Acquiring exclusive while only shared is held converts the POSIX
//!   lock in place (`F_SETLKW` with `F_WRLCK`), which is the
//!   release-and-reacquire upgrade the coherence protocol specifies.
//! - Releasing the last exclusive count downgrades back to shared if
//!   shared counts remain, otherwise unlocks.
//!
//! The lock covers the whole sidecar file (`l_len = 0`). `EINTR` is
//! retried; other fcntl failures are logged and otherwise ignored, the
//! way every transient filesystem error is handled here — the store
//! keeps functioning with reduced cross-process safety rather than
//! poisoning itself.
//!
//! Single-process stores construct the lock disabled; every operation
//! on it is then a no-op.

use std::cell::Cell;

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

pub struct FileLock {
    #[cfg(unix)]
    fd: RawFd,
    enabled: bool,
    shared_count: Cell<u32>,
    exclusive_count: Cell<u32>,
}

/// Releases its lock kind on drop.
pub struct FileLockGuard<'a> {
    lock: &'a FileLock,
    kind: LockKind,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.kind);
    }
}

impl FileLock {
    /// Build a lock over `file`'s descriptor. A disabled lock never
    /// issues a syscall.
    pub fn new(file: &std::fs::File, enabled: bool) -> FileLock {
        #[cfg(not(unix))]
        let _ = file;
        FileLock {
            #[cfg(unix)]
            fd: file.as_raw_fd(),
            enabled,
            shared_count: Cell::new(0),
            exclusive_count: Cell::new(0),
        }
    }

    /// Acquire `kind`, blocking until granted. The returned guard
    /// releases on drop.
    pub fn acquire(&self, kind: LockKind) -> FileLockGuard<'_> {
        self.lock(kind);
        FileLockGuard { lock: self, kind }
    }

    pub(crate) fn lock(&self, kind: LockKind) {
        if !self.enabled {
            return;
        }
        match kind {
            LockKind::Shared => {
                if self.shared_count.get() == 0 && self.exclusive_count.get() == 0 {
                    self.fcntl_lock(LockOp::Shared);
                }
                self.shared_count.set(self.shared_count.get() + 1);
            }
            LockKind::Exclusive => {
                if self.exclusive_count.get() == 0 {
                    // converts an outstanding shared lock in place
                    self.fcntl_lock(LockOp::Exclusive);
                }
                self.exclusive_count.set(self.exclusive_count.get() + 1);
            }
        }
    }

    pub(crate) fn unlock(&self, kind: LockKind) {
        if !self.enabled {
            return;
        }
        match kind {
            LockKind::Shared => {
                debug_assert!(self.shared_count.get() > 0, "unbalanced shared unlock");
                self.shared_count.set(self.shared_count.get().saturating_sub(1));
                if self.shared_count.get() == 0 && self.exclusive_count.get() == 0 {
                    self.fcntl_lock(LockOp::Unlock);
                }
            }
            LockKind::Exclusive => {
                debug_assert!(self.exclusive_count.get() > 0, "unbalanced exclusive unlock");
                self.exclusive_count.set(self.exclusive_count.get().saturating_sub(1));
                if self.exclusive_count.get() == 0 {
                    if self.shared_count.get() > 0 {
                        self.fcntl_lock(LockOp::Shared);
                    } else {
                        self.fcntl_lock(LockOp::Unlock);
                    }
                }
            }
        }
    }

    #[cfg(unix)]
    fn fcntl_lock(&self, op: LockOp) {
        let lock_type = match op {
            LockOp::Shared => libc::F_RDLCK,
            LockOp::Exclusive => libc::F_WRLCK,
            LockOp::Unlock => libc::F_UNLCK,
        };
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = lock_type as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = 0;
        fl.l_len = 0; // the whole file

        loop {
            // SAFETY: fd is owned by the enclosing store for the lifetime
            // of this lock, and fl points at a properly initialized flock
            // on the stack.
            let rc = unsafe { libc::fcntl(self.fd, libc::F_SETLKW, &fl) };
            if rc == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            error!(?op, %err, "fcntl file lock failed");
            return;
        }
    }

    #[cfg(not(unix))]
    fn fcntl_lock(&self, _op: LockOp) {}
}

#[derive(Debug, Clone, Copy)]
enum LockOp {
    Shared,
    Exclusive,
    Unlock,
}
