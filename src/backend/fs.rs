//! The local filesystem as a backend.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};

use super::{Backend, FileKind};

pub struct FilesystemBackend {
    root: PathBuf,
    connections: usize,
}

impl FilesystemBackend {
    /// Lays out an empty repository directory structure.
    pub fn initialize(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Couldn't create repository directory {}", root.display()))?;
        for kind in [
            FileKind::Key,
            FileKind::Snapshot,
            FileKind::Index,
            FileKind::Pack,
            FileKind::Lock,
        ] {
            fs::create_dir_all(root.join(kind.dir()))
                .with_context(|| format!("Couldn't create {} directory", kind.dir()))?;
        }
        Ok(Self {
            root: root.to_owned(),
            connections: num_cpus::get().max(1),
        })
    }

    pub fn open(root: &Path) -> Result<Self> {
        ensure!(
            root.join(FileKind::Key.dir()).is_dir(),
            "{} doesn't look like a vaultpak repository (no keys/ directory)",
            root.display()
        );
        Ok(Self {
            root: root.to_owned(),
            connections: num_cpus::get().max(1),
        })
    }
}

impl Backend for FilesystemBackend {
    fn save(&self, kind: FileKind, name: &str, reader: &mut dyn Read) -> Result<()> {
        let dest = self.root.join(kind.path(name));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create {}", parent.display()))?;
        }
        ensure!(
            !dest.exists(),
            "Refusing to overwrite existing object {}",
            dest.display()
        );

        let mut tmp = tempfile::Builder::new()
            .prefix("vaultpak-")
            .tempfile_in(dest.parent().unwrap())
            .with_context(|| format!("Couldn't create a temp file near {}", dest.display()))?;
        std::io::copy(reader, tmp.as_file_mut())
            .with_context(|| format!("Couldn't write {}", dest.display()))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest)
            .with_context(|| format!("Couldn't persist {}", dest.display()))?;
        Ok(())
    }

    fn load(&self, kind: FileKind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let path = self.root.join(kind.path(name));
        let mut fh =
            fs::File::open(&path).with_context(|| format!("Couldn't open {}", path.display()))?;
        fh.seek(SeekFrom::Start(offset))?;

        let mut buf = if length == 0 {
            let mut buf = Vec::new();
            fh.read_to_end(&mut buf)?;
            buf
        } else {
            let mut buf = vec![0u8; length as usize];
            fh.read_exact(&mut buf)
                .with_context(|| format!("Short read of {} at offset {offset}", path.display()))?;
            buf
        };
        buf.shrink_to_fit();
        Ok(buf)
    }

    fn stat(&self, kind: FileKind, name: &str) -> Result<u64> {
        let path = self.root.join(kind.path(name));
        Ok(fs::metadata(&path)
            .with_context(|| format!("Couldn't stat {}", path.display()))?
            .len())
    }

    fn remove(&self, kind: FileKind, name: &str) -> Result<()> {
        let path = self.root.join(kind.path(name));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Couldn't remove {}", path.display())),
        }
    }

    fn list(&self, kind: FileKind) -> Result<Vec<String>> {
        let dir = self.root.join(kind.dir());
        if kind == FileKind::Config {
            return Ok(if dir.is_file() || self.root.join("config").is_file() {
                vec!["config".to_string()]
            } else {
                vec![]
            });
        }
        let mut names = Vec::new();
        if kind == FileKind::Pack {
            // Packs live one shard-directory deeper.
            if !dir.is_dir() {
                return Ok(names);
            }
            for shard in fs::read_dir(&dir)
                .with_context(|| format!("Couldn't list {}", dir.display()))?
            {
                let shard = shard?;
                if !shard.file_type()?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(shard.path())? {
                    let entry = entry?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        } else {
            if !dir.is_dir() {
                return Ok(names);
            }
            for entry in
                fs::read_dir(&dir).with_context(|| format!("Couldn't list {}", dir.display()))?
            {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        Ok(names)
    }

    fn connections(&self) -> usize {
        self.connections
    }

    fn is_not_exist(&self, err: &anyhow::Error) -> bool {
        err.chain()
            .find_map(|c| c.downcast_ref::<std::io::Error>())
            .map(|e| e.kind() == std::io::ErrorKind::NotFound)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn save_then_load_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FilesystemBackend::initialize(dir.path())?;

        let mut data: &[u8] = b"hello vault";
        backend.save(FileKind::Lock, "somelock", &mut data)?;

        let loaded = backend.load(FileKind::Lock, "somelock", 0, 0)?;
        assert_eq!(loaded, b"hello vault");
        Ok(())
    }

    #[test]
    fn save_refuses_to_overwrite() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FilesystemBackend::initialize(dir.path())?;

        let mut data: &[u8] = b"first";
        backend.save(FileKind::Lock, "samename", &mut data)?;

        let mut data2: &[u8] = b"second";
        assert!(backend.save(FileKind::Lock, "samename", &mut data2).is_err());
        Ok(())
    }

    #[test]
    fn ranged_load_reads_exactly_the_requested_span() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FilesystemBackend::initialize(dir.path())?;

        let mut data: &[u8] = b"0123456789";
        backend.save(FileKind::Lock, "ranged", &mut data)?;

        let span = backend.load(FileKind::Lock, "ranged", 3, 4)?;
        assert_eq!(span, b"3456");
        Ok(())
    }

    #[test]
    fn pack_paths_are_sharded_on_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FilesystemBackend::initialize(dir.path())?;
        let id = "ab".to_string() + &"0".repeat(62);

        let mut data: &[u8] = b"pack bytes";
        backend.save(FileKind::Pack, &id, &mut data)?;

        assert!(dir.path().join("data").join("ab").join(&id).exists());
        assert_eq!(backend.list(FileKind::Pack)?, vec![id]);
        Ok(())
    }
}
