//! An in-memory backend, used by unit and integration tests so they don't
//! have to round-trip through a real filesystem.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

use anyhow::{Result, ensure};

use super::{Backend, FileKind};

#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<(FileKind, String), Vec<u8>>>,
}

impl Backend for MemoryBackend {
    fn save(&self, kind: FileKind, name: &str, reader: &mut dyn Read) -> Result<()> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        let mut objects = self.objects.lock().unwrap();
        let key = (kind, name.to_string());
        ensure!(
            !objects.contains_key(&key),
            "Refusing to overwrite existing object {name}"
        );
        objects.insert(key, bytes);
        Ok(())
    }

    fn load(&self, kind: FileKind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let objects = self.objects.lock().unwrap();
        let bytes = objects
            .get(&(kind, name.to_string()))
            .ok_or_else(|| super::not_found_error(kind, name))?;

        let offset = offset as usize;
        ensure!(offset <= bytes.len(), "Offset past end of object {name}");
        let end = if length == 0 {
            bytes.len()
        } else {
            (offset + length as usize).min(bytes.len())
        };
        ensure!(
            length == 0 || end - offset == length as usize,
            "Short read of {name}"
        );
        Ok(bytes[offset..end].to_vec())
    }

    fn stat(&self, kind: FileKind, name: &str) -> Result<u64> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(&(kind, name.to_string()))
            .map(|b| b.len() as u64)
            .ok_or_else(|| super::not_found_error(kind, name))
    }

    fn remove(&self, kind: FileKind, name: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(&(kind, name.to_string()));
        Ok(())
    }

    fn list(&self, kind: FileKind) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect())
    }

    fn connections(&self) -> usize {
        4
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
    fn save_then_load_round_trips() {
        let backend = MemoryBackend::default();
        let mut data: &[u8] = b"hello vault";
        backend.save(FileKind::Lock, "x", &mut data).unwrap();
        assert_eq!(backend.load(FileKind::Lock, "x", 0, 0).unwrap(), b"hello vault");
    }

    #[test]
    fn missing_object_is_reported_as_not_exist() {
        let backend = MemoryBackend::default();
        let err = backend.load(FileKind::Lock, "nope", 0, 0).unwrap_err();
        assert!(backend.is_not_exist(&err));
    }
}
