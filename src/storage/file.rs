//! # Memory-Mapped Log File
//!
//! `LogFile` wraps the primary store file: a 4-byte little-endian length
//! header followed by the append log, mapped shared read/write. The file
//! size is always a positive multiple of the system page size.
//!
//! ## Safety Model
//!
//! Memory-mapped regions become invalid when remapped (during
//! [`LogFile::resize`]). The borrow checker enforces that no slice
//! borrowed from the mapping survives a resize:
//!
//! ```text
//! log(&self) -> &[u8]              // immutable borrow of self
//! log_mut(&mut self) -> &mut [u8]  // mutable borrow of self
//! resize(&mut self)                // mutable borrow (exclusive)
//! ```
//!
//! Since `resize` requires `&mut self`, no page references can exist
//! when the old mapping is dropped; dangling-slice bugs are caught at
//! compile time rather than with hazard pointers or epochs.
//!
//! ## Growth
//!
//! `set_len` extension zero-fills the new range (POSIX `ftruncate`
//! semantics), which keeps the free space past `actual_size` all-zero.
//! A failed resize restores the previous file length so the caller's
//! view of the world stays consistent.

use std::fs::OpenOptions;
#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::{page_size, round_up_to_page, LEN_PREFIX_SIZE};

pub struct LogFile {
    file: std::fs::File,
    mmap: MmapMut,
    size: usize,
    growable: bool,
}

impl LogFile {
    /// Open (creating if absent) the primary file at `path`, stretch it
    /// to the next page multiple ≥ `requested` (minimum one page), and
    /// map it shared read/write.
    pub fn open(path: &Path, requested: usize) -> Result<LogFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let on_disk = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat store file '{}'", path.display()))?
            .len() as usize;

        let mut size = on_disk.max(requested);
        if size < page_size() || size % page_size() != 0 {
            size = round_up_to_page(size);
            file.set_len(size as u64).wrap_err_with(|| {
                format!("failed to stretch '{}' to {} bytes", path.display(), size)
            })?;
        }

        // SAFETY: the mapping is shared because other processes legally
        // mutate the same file; coherence is handled above this layer by
        // the advisory file lock and the sidecar sequence/CRC protocol.
        // The mapping's lifetime is tied to LogFile and all access goes
        // through bounds-checked slices of self.mmap.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to mmap store file '{}'", path.display()))?
        };

        Ok(LogFile {
            file,
            mmap,
            size,
            growable: true,
        })
    }

    /// Adopt a shared-memory fd handed in by the host. The region keeps
    /// its current size forever.
    #[cfg(unix)]
    pub fn from_fd(fd: OwnedFd) -> Result<LogFile> {
        let file = std::fs::File::from(fd);
        let size = file.metadata().wrap_err("failed to stat shared-memory fd")?.len() as usize;
        ensure!(
            size >= page_size(),
            "shared-memory region too small: {} bytes",
            size
        );

        // SAFETY: same sharing rationale as open(); the host guarantees
        // the fd refers to a mappable region of at least one page.
        let mmap = unsafe {
            MmapMut::map_mut(&file).wrap_err("failed to mmap shared-memory region")?
        };

        Ok(LogFile {
            file,
            mmap,
            size,
            growable: false,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the file can be resized (false for shared-memory regions).
    pub fn growable(&self) -> bool {
        self.growable
    }

    /// Current length of the backing file, read from the filesystem.
    /// Another process may have grown the file past our mapping.
    pub fn file_len(&self) -> Result<usize> {
        Ok(self.file.metadata().wrap_err("failed to stat store file")?.len() as usize)
    }

    /// The little-endian length mirror in the first four bytes.
    pub fn read_len_prefix(&self) -> u32 {
        let mut bytes = [0u8; LEN_PREFIX_SIZE];
        bytes.copy_from_slice(&self.mmap[..LEN_PREFIX_SIZE]);
        u32::from_le_bytes(bytes)
    }

    pub fn write_len_prefix(&mut self, value: u32) {
        self.mmap[..LEN_PREFIX_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    /// The log region: everything after the length header.
    pub fn log(&self) -> &[u8] {
        &self.mmap[LEN_PREFIX_SIZE..]
    }

    pub fn log_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[LEN_PREFIX_SIZE..]
    }

    /// Resize the file and remap. On failure the previous length is
    /// restored and the mapping left untouched.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        ensure!(self.growable, "shared-memory store cannot be resized");
        if new_size == self.size {
            return Ok(());
        }

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mmap before resize")?;

        self.file
            .set_len(new_size as u64)
            .wrap_err_with(|| format!("failed to resize store file to {} bytes", new_size))?;

        // SAFETY: resize() holds &mut self, so no borrowed slices of the
        // old mapping exist; the file was resized before remapping and
        // the old mapping is dropped on assignment.
        match unsafe { MmapMut::map_mut(&self.file) } {
            Ok(mmap) => {
                self.mmap = mmap;
                self.size = new_size;
                Ok(())
            }
            Err(err) => {
                let _ = self.file.set_len(self.size as u64);
                Err(err).wrap_err("failed to remap store file after resize")
            }
        }
    }

    /// Zero the first page and flush it, the first step of `clear_all`.
    pub fn zero_first_page(&mut self) -> Result<()> {
        let page = page_size().min(self.size);
        self.mmap[..page].fill(0);
        self.mmap
            .flush_range(0, page)
            .wrap_err("failed to msync zeroed first page")
    }

    /// Flush the whole mapping, synchronously (`stable`) or not.
    pub fn flush(&self, stable: bool) -> Result<()> {
        if stable {
            self.mmap.flush().wrap_err("failed to msync store file")
        } else {
            self.mmap
                .flush_async()
                .wrap_err("failed to schedule store file msync")
        }
    }
}
