//! # Open Modes
//!
//! Bit set selecting how a store coordinates with the outside world.
//! `MULTI_PROCESS` enables the advisory file lock and the cross-process
//! coherence checks; `SHARED_MEMORY` marks a store backed by fds handed
//! in from the host (always multi-process, never growable).

use std::ops::{BitOr, BitOrAssign};

/// How a store is opened. Combine flags with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenMode(u32);

impl OpenMode {
    /// The store is only touched by this process; no file locking.
    pub const SINGLE_PROCESS: OpenMode = OpenMode(1 << 0);

    /// Other processes may mutate the same files; every public operation
    /// re-validates against the sidecar and takes the advisory file lock.
    pub const MULTI_PROCESS: OpenMode = OpenMode(1 << 1);

    /// Backed by shared-memory fds from the host. Implies multi-process
    /// coordination; the file can never grow past its initial size.
    pub const SHARED_MEMORY: OpenMode = OpenMode(1 << 2);

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether this mode requires inter-process coordination.
    pub fn is_inter_process(self) -> bool {
        self.contains(OpenMode::MULTI_PROCESS) || self.contains(OpenMode::SHARED_MEMORY)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::SINGLE_PROCESS
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: OpenMode) {
        self.0 |= rhs.0;
    }
}
