//! # Store Configuration Constants
//!
//! Centralizes the on-disk layout constants shared between the storage
//! layer and the store state machine. Constants that depend on each other
//! are co-located to prevent mismatch bugs.
//!
//! ```text
//! LEN_PREFIX_SIZE (4 bytes)
//!       │
//!       ├─> log region starts at file offset 4
//!       │
//!       └─> actual_size never exceeds file_size - LEN_PREFIX_SIZE
//!
//! page_size() (queried once from the OS)
//!       │
//!       ├─> primary file size is always a positive multiple of it
//!       │
//!       └─> the sidecar file is exactly one page
//! ```

use std::sync::OnceLock;

/// Size of the little-endian `u32` length header that mirrors
/// `actual_size` at the start of the primary file.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Extension appended to the primary file path to form the sidecar path.
pub const SIDECAR_EXTENSION: &str = "crc";

/// Directory (under the root) that holds stores whose ids contain
/// characters some filesystems reject.
pub const SPECIAL_CHARACTER_DIRECTORY_NAME: &str = "specialCharacter";

/// Characters that force a store id to be redirected into
/// [`SPECIAL_CHARACTER_DIRECTORY_NAME`].
pub const SPECIAL_CHARACTERS: &str = "\\/:*?\"<>|";

/// Id used by [`crate::default_store`](crate::default_store).
pub const DEFAULT_STORE_ID: &str = "pagekv.default";

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// System page size, queried once.
///
/// Primary files are grown in multiples of this and the sidecar file is
/// exactly one page long.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: sysconf takes no pointers and cannot fault; a
            // non-positive return means the value is indeterminate.
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 {
                sz as usize
            } else {
                4096
            }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    })
}

/// Round `size` up to the next positive multiple of the page size.
pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    if size == 0 || size % page != 0 {
        ((size / page) + 1) * page
    } else {
        size
    }
}
