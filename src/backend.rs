//! Places where we can put a backup repository.
//!
//! The core never talks to a filesystem or network socket directly - it
//! talks to a small capability set (`save`, `load`, `stat`, `remove`,
//! `list`, `connections`, `is_not_exist`) generalized to the file kinds
//! this repository format actually has. Remote backends (S3, SFTP, B2,
//! ...) are out of scope; only the local filesystem and an in-memory test
//! double are implemented here.

use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail, ensure};

use crate::hashing::ObjectId;

pub mod fs;
pub mod memory;
pub mod semaphored;

/// The kinds of objects a repository stores, each with its own naming and
/// sharding convention on the backend (see §6 of the design).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FileKind {
    Config,
    Key,
    Snapshot,
    Index,
    Pack,
    Lock,
}

impl FileKind {
    /// The directory (or key prefix) this kind lives under.
    fn dir(self) -> &'static str {
        match self {
            FileKind::Config => "",
            FileKind::Key => "keys",
            FileKind::Snapshot => "snapshots",
            FileKind::Index => "index",
            FileKind::Pack => "data",
            FileKind::Lock => "locks",
        }
    }

    /// Builds the backend-relative path for an object of this kind.
    /// Packs are sharded into two-hex-character directories by the first
    /// byte of their ID to keep any one directory from growing unbounded.
    pub fn path(self, name: &str) -> String {
        match self {
            FileKind::Config => "config".to_string(),
            FileKind::Pack => {
                let shard = &name[0..2.min(name.len())];
                format!("data/{shard}/{name}")
            }
            other => format!("{}/{name}", other.dir()),
        }
    }
}

/// The capability set the core consumes. Implementations must make `save`
/// atomic against partial writes (rename-from-temp, multipart-complete,
/// ...); `load` ranges must be exact; `list` order is never assumed.
pub trait Backend: Send + Sync {
    /// Atomically creates `kind/name`, failing if it already exists.
    fn save(&self, kind: FileKind, name: &str, reader: &mut dyn Read) -> Result<()>;

    /// Ranged read. `length == 0` means "to the end of the object."
    fn load(&self, kind: FileKind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Size of the named object.
    fn stat(&self, kind: FileKind, name: &str) -> Result<u64>;

    /// Removes the named object. Idempotent: removing something already
    /// gone is not an error at this layer (callers distinguish via
    /// `is_not_exist` before calling if they care).
    fn remove(&self, kind: FileKind, name: &str) -> Result<()>;

    /// Lists every object of the given kind. May be lazily paged by an
    /// implementation; the core never assumes a particular order.
    fn list(&self, kind: FileKind) -> Result<Vec<String>>;

    /// Parallelism hint: the core never issues more than this many
    /// concurrent calls against this backend.
    fn connections(&self) -> usize;

    /// True if `err` represents "the object doesn't exist."
    fn is_not_exist(&self, err: &anyhow::Error) -> bool;
}

/// A thin, cloneable handle to a [`Backend`], with the repository's
/// file-kind naming baked in so the rest of the crate never builds a path
/// by hand.
#[derive(Clone)]
pub struct CachedBackend {
    inner: Arc<dyn Backend>,
}

impl CachedBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self { inner }
    }

    pub fn connections(&self) -> usize {
        self.inner.connections()
    }

    pub fn is_not_exist(&self, err: &anyhow::Error) -> bool {
        self.inner.is_not_exist(err)
    }

    fn save_bytes(&self, kind: FileKind, name: &str, bytes: &[u8]) -> Result<()> {
        let mut reader = bytes;
        self.inner.save(kind, name, &mut reader)
    }

    fn load_all(&self, kind: FileKind, name: &str) -> Result<Vec<u8>> {
        self.inner.load(kind, name, 0, 0)
    }

    // --- Config ---
    pub fn read_config(&self) -> Result<Vec<u8>> {
        self.load_all(FileKind::Config, "config")
    }
    pub fn write_config(&self, bytes: &[u8]) -> Result<()> {
        self.save_bytes(FileKind::Config, "config", bytes)
    }
    pub fn config_exists(&self) -> bool {
        self.inner.stat(FileKind::Config, "config").is_ok()
    }

    // --- Keys ---
    pub fn list_keys(&self) -> Result<Vec<String>> {
        self.inner.list(FileKind::Key)
    }
    pub fn read_key(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.load_all(FileKind::Key, &id.to_string())
    }
    pub fn write_key(&self, id: &ObjectId, bytes: &[u8]) -> Result<()> {
        self.save_bytes(FileKind::Key, &id.to_string(), bytes)
    }

    // --- Snapshots ---
    pub fn list_snapshots(&self) -> Result<Vec<String>> {
        self.inner.list(FileKind::Snapshot)
    }
    pub fn read_snapshot(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.load_all(FileKind::Snapshot, &id.to_string())
    }
    pub fn write_snapshot(&self, id: &ObjectId, bytes: &[u8]) -> Result<()> {
        self.save_bytes(FileKind::Snapshot, &id.to_string(), bytes)
    }
    pub fn remove_snapshot(&self, id: &ObjectId) -> Result<()> {
        self.inner.remove(FileKind::Snapshot, &id.to_string())
    }

    // --- Indexes ---
    pub fn list_indexes(&self) -> Result<Vec<String>> {
        self.inner.list(FileKind::Index)
    }
    pub fn read_index(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.load_all(FileKind::Index, &id.to_string())
    }
    pub fn write_index(&self, id: &ObjectId, bytes: &[u8]) -> Result<()> {
        self.save_bytes(FileKind::Index, &id.to_string(), bytes)
    }
    pub fn remove_index(&self, id: &ObjectId) -> Result<()> {
        self.inner.remove(FileKind::Index, &id.to_string())
    }

    // --- Packs ---
    pub fn list_packs(&self) -> Result<Vec<String>> {
        self.inner.list(FileKind::Pack)
    }
    pub fn stat_pack(&self, id: &ObjectId) -> Result<u64> {
        self.inner.stat(FileKind::Pack, &id.to_string())
    }
    pub fn read_pack_range(&self, id: &ObjectId, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.inner
            .load(FileKind::Pack, &id.to_string(), offset, length)
    }
    pub fn read_pack(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.load_all(FileKind::Pack, &id.to_string())
    }
    pub fn write_pack(&self, id: &ObjectId, bytes: &[u8]) -> Result<()> {
        self.save_bytes(FileKind::Pack, &id.to_string(), bytes)
    }
    /// Streams a pack in from `reader` without buffering it all in memory first.
    pub fn write_pack_reader(&self, id: &ObjectId, reader: &mut dyn Read) -> Result<()> {
        self.inner.save(FileKind::Pack, &id.to_string(), reader)
    }
    pub fn remove_pack(&self, id: &ObjectId) -> Result<()> {
        self.inner.remove(FileKind::Pack, &id.to_string())
    }

    // --- Locks ---
    pub fn list_locks(&self) -> Result<Vec<String>> {
        self.inner.list(FileKind::Lock)
    }
    pub fn read_lock(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.load_all(FileKind::Lock, &id.to_string())
    }
    pub fn write_lock(&self, id: &ObjectId, bytes: &[u8]) -> Result<()> {
        self.save_bytes(FileKind::Lock, &id.to_string(), bytes)
    }
    pub fn remove_lock(&self, id: &ObjectId) -> Result<()> {
        self.inner.remove(FileKind::Lock, &id.to_string())
    }
}

/// Opens the filesystem backend rooted at `repository`.
pub fn open(repository: &Path) -> Result<CachedBackend> {
    tracing::info!("Opening repository '{}'", repository.display());
    ensure!(
        repository.is_dir(),
        crate::error::VaultError::NotExist {
            kind: "repository".to_string(),
            name: repository.display().to_string(),
        }
    );
    let backend = fs::FilesystemBackend::open(repository)?;
    Ok(CachedBackend::new(Arc::new(backend)))
}

/// Creates a fresh, empty repository layout at `repository`.
pub fn initialize(repository: &Path) -> Result<CachedBackend> {
    let backend = fs::FilesystemBackend::initialize(repository)?;
    Ok(CachedBackend::new(Arc::new(backend)))
}

/// A backend for tests that never touches disk.
pub fn open_memory() -> CachedBackend {
    CachedBackend::new(Arc::new(memory::MemoryBackend::default()))
}

/// Extracts an object's ID from its `some/components/<ID>[.ext]` name.
pub fn id_from_path<P: AsRef<Path>>(path: P) -> Result<ObjectId> {
    let path = path.as_ref();
    let stem = path
        .file_stem()
        .ok_or_else(|| anyhow!("Couldn't determine ID from {}", path.display()))?;
    let stem = stem
        .to_str()
        .ok_or_else(|| anyhow!("{} isn't UTF-8", path.display()))?;
    ObjectId::from_str(stem)
}

pub(crate) fn not_found_error(kind: FileKind, name: &str) -> anyhow::Error {
    anyhow::Error::new(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}/{} not found", kind.dir(), name),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pack_paths_are_sharded_by_first_byte() {
        let id = "abcdef0000000000000000000000000000000000000000000000000000";
        let path = FileKind::Pack.path(id);
        assert_eq!(path, format!("data/ab/{id}"));
    }

    #[test]
    fn config_path_is_a_singleton() {
        assert_eq!(FileKind::Config.path("config"), "config");
    }
}
