//! # Process-Wide Registry
//!
//! One `Store` instance per identity per process. The registry maps a
//! composite identity — the store id, or `md5(relative_path + "/" + id)`
//! when the store lives outside the configured root — to a live
//! `Arc<Store>`, so concurrent `open` calls for the same files share a
//! handle instead of racing on the sidecar.
//!
//! [`initialize`] must be called once before the first `open`; later
//! calls only move the root directory. Ids containing characters some
//! filesystems reject (`\ / : * ? " < > |`) are redirected into a
//! `specialCharacter/` subdirectory and stored under their md5.

#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use tracing::info;

use crate::config::{
    page_size, OpenMode, DEFAULT_STORE_ID, LEN_PREFIX_SIZE, SIDECAR_EXTENSION,
    SPECIAL_CHARACTERS, SPECIAL_CHARACTER_DIRECTORY_NAME,
};
use crate::storage::meta::{MetaRecord, META_RECORD_SIZE};
use crate::store::{Store, StoreCore};
use zerocopy::FromBytes;

struct Registry {
    root: Mutex<Option<PathBuf>>,
    stores: Mutex<HashMap<String, Arc<Store>>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        root: Mutex::new(None),
        stores: Mutex::new(HashMap::new()),
    })
}

/// Set (or move) the root directory and create it. Must be called
/// before the first [`StoreOptions::open`]; calling it again only
/// updates the root.
pub fn initialize(root_dir: impl AsRef<Path>) -> Result<()> {
    let root_dir = root_dir.as_ref();
    std::fs::create_dir_all(root_dir)
        .wrap_err_with(|| format!("failed to create root dir '{}'", root_dir.display()))?;
    *registry().root.lock() = Some(root_dir.to_path_buf());
    info!(root = %root_dir.display(), page_size = page_size(), "store root initialized");
    Ok(())
}

/// Open the default store with default options.
pub fn default_store() -> Result<Arc<Store>> {
    StoreOptions::new(DEFAULT_STORE_ID).open()
}

/// Open `id` with default options.
pub fn open(id: &str) -> Result<Arc<Store>> {
    StoreOptions::new(id).open()
}

/// Configuration for opening a store.
///
/// ```ignore
/// pagekv::initialize("/var/lib/myapp")?;
/// let store = pagekv::StoreOptions::new("settings")
///     .mode(OpenMode::MULTI_PROCESS)
///     .crypt_key(b"secret")
///     .open()?;
/// ```
pub struct StoreOptions {
    id: String,
    size: usize,
    mode: OpenMode,
    crypt_key: Option<Vec<u8>>,
    relative_path: Option<PathBuf>,
}

impl StoreOptions {
    pub fn new(id: &str) -> StoreOptions {
        StoreOptions {
            id: id.to_owned(),
            size: 0,
            mode: OpenMode::default(),
            crypt_key: None,
            relative_path: None,
        }
    }

    /// Requested initial file size; rounded up to a page multiple, at
    /// least one page.
    pub fn size(mut self, size: usize) -> StoreOptions {
        self.size = size;
        self
    }

    pub fn mode(mut self, mode: OpenMode) -> StoreOptions {
        self.mode = mode;
        self
    }

    pub fn crypt_key(mut self, key: &[u8]) -> StoreOptions {
        self.crypt_key = Some(key.to_vec());
        self
    }

    /// Place the files in `dir` instead of the configured root.
    pub fn relative_path(mut self, dir: impl AsRef<Path>) -> StoreOptions {
        self.relative_path = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Return the cached handle for this identity, or construct one.
    pub fn open(self) -> Result<Arc<Store>> {
        ensure!(!self.id.is_empty(), "store id must not be empty");
        let reg = registry();
        let root = reg
            .root
            .lock()
            .clone()
            .ok_or_else(|| eyre::eyre!("initialize() must be called before open()"))?;

        let key = instance_key(&self.id, self.relative_path.as_deref(), &root);
        let mut stores = reg.stores.lock();
        if let Some(store) = stores.get(&key) {
            return Ok(store.clone());
        }

        let dir = self.relative_path.clone().unwrap_or(root);
        let path = encoded_store_path(&dir, &self.id)?;
        if self.relative_path.is_some() && !path.exists() {
            std::fs::File::create(&path)
                .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
            info!(id = %self.id, path = %path.display(), "created store file under relative path");
        }

        let core = StoreCore::open_on_disk(
            key.clone(),
            path.clone(),
            sidecar_path(&path),
            self.size,
            self.mode,
            self.crypt_key.as_deref(),
        )?;
        let store = Arc::new(Store::from_core(key.clone(), core));
        stores.insert(key, store.clone());
        Ok(store)
    }
}

/// Open a store over shared-memory fds handed in by the host. The
/// identity is `id` alone. On a cache hit the crypt key is re-checked
/// (a changed key swaps the cipher and reloads) and the duplicate fds
/// are dropped.
#[cfg(unix)]
pub fn open_with_shared_memory(
    id: &str,
    fd: OwnedFd,
    meta_fd: OwnedFd,
    crypt_key: Option<&[u8]>,
) -> Result<Arc<Store>> {
    ensure!(!id.is_empty(), "store id must not be empty");
    let reg = registry();
    let mut stores = reg.stores.lock();
    if let Some(store) = stores.get(id) {
        store.with_core(|core| core.check_reset_crypt_key(crypt_key));
        // fd and meta_fd close on drop; the cached store keeps its own
        return Ok(store.clone());
    }

    let core = StoreCore::open_shared_memory(id.to_owned(), fd, meta_fd, crypt_key)?;
    let store = Arc::new(Store::from_core(id.to_owned(), core));
    stores.insert(id.to_owned(), store.clone());
    Ok(store)
}

/// Sync every cached store and release its in-memory state. Handles
/// stay registered and reload lazily on their next use; meant for the
/// host's shutdown path.
pub fn on_exit() {
    let stores: Vec<Arc<Store>> = registry().stores.lock().values().cloned().collect();
    for store in stores {
        store.sync(true);
        store.with_core(|core| core.clear_memory_state());
    }
}

pub(crate) fn remove_instance(key: &str) {
    registry().stores.lock().remove(key);
}

/// CRC-check the files of `id` under the root without opening a store.
/// A store that was never created passes; a missing or mismatching
/// sidecar fails.
pub fn validate_store_file(id: &str) -> bool {
    let Some(root) = registry().root.lock().clone() else {
        return false;
    };
    let Ok(path) = encoded_store_path(&root, id) else {
        return false;
    };
    if !path.exists() {
        return true;
    }

    let Ok(meta_bytes) = std::fs::read(sidecar_path(&path)) else {
        return false;
    };
    if meta_bytes.len() < META_RECORD_SIZE {
        return false;
    }
    let Ok(meta) = MetaRecord::read_from_bytes(&meta_bytes[..META_RECORD_SIZE]) else {
        return false;
    };

    let Ok(file) = std::fs::read(&path) else {
        return false;
    };
    if file.len() < LEN_PREFIX_SIZE {
        return false;
    }
    let mut mirror = [0u8; LEN_PREFIX_SIZE];
    mirror.copy_from_slice(&file[..LEN_PREFIX_SIZE]);
    let actual_size = u32::from_le_bytes(mirror) as usize;
    if actual_size > file.len() - LEN_PREFIX_SIZE {
        return false;
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&file[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + actual_size]);
    hasher.finalize() == meta.crc_digest()
}

fn md5_hex(input: &[u8]) -> String {
    let digest = Md5::digest(input);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Registry identity: the id itself, or the md5 of `dir/id` when the
/// store lives outside the root.
fn instance_key(id: &str, relative_path: Option<&Path>, root: &Path) -> String {
    match relative_path {
        Some(dir) if dir != root => {
            md5_hex(format!("{}/{}", dir.display(), id).as_bytes())
        }
        _ => id.to_owned(),
    }
}

/// Where the primary file of `id` lives under `dir`, redirecting ids
/// with reserved characters into `specialCharacter/md5(id)`.
fn encoded_store_path(dir: &Path, id: &str) -> Result<PathBuf> {
    if id.is_empty() {
        bail!("store id must not be empty");
    }
    if id.chars().any(|c| SPECIAL_CHARACTERS.contains(c)) {
        let special_dir = dir.join(SPECIAL_CHARACTER_DIRECTORY_NAME);
        std::fs::create_dir_all(&special_dir).wrap_err_with(|| {
            format!("failed to create '{}'", special_dir.display())
        })?;
        Ok(special_dir.join(md5_hex(id.as_bytes())))
    } else {
        Ok(dir.join(id))
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(SIDECAR_EXTENSION);
    PathBuf::from(os)
}
