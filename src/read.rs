//! Tools to traverse a repository, reading blobs.
//!
//! This is ultimately how we read backups back out for restore, repack, etc.
//! Unlike a streaming pack format, every pack manifest records each blob's
//! offset, so reads here are genuinely random-access: no skipping past
//! blobs we don't want, no restarting a decompression stream.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use rustc_hash::FxHashMap;
use tracing::*;

use crate::backend;
use crate::counters;
use crate::crypto::MasterKey;
use crate::hashing::ObjectId;
use crate::index;
use crate::pack;

/// Reads blobs out of a repository by pack + offset, caching each pack's
/// manifest after its first use so repeated reads from the same pack don't
/// re-fetch its header.
pub struct BlobReader<'a> {
    cached_backend: &'a backend::CachedBackend,
    master: &'a MasterKey,
    blob_map: &'a index::BlobMap,
    manifests: FxHashMap<ObjectId, Arc<pack::PackManifest>>,
}

impl<'a> BlobReader<'a> {
    pub fn new(
        cached_backend: &'a backend::CachedBackend,
        master: &'a MasterKey,
        blob_map: &'a index::BlobMap,
    ) -> Self {
        Self {
            cached_backend,
            master,
            blob_map,
            manifests: FxHashMap::default(),
        }
    }

    pub fn read_blob(&mut self, blob_id: &ObjectId) -> Result<Vec<u8>> {
        let pack_id = *self
            .blob_map
            .get(blob_id)
            .ok_or_else(|| anyhow!("Blob {blob_id} not found in any pack"))?;

        let manifest = self.manifest_for(pack_id)?;
        counters::bump(counters::Op::PackLoad);
        let bytes = pack::extract_blob(&pack_id, blob_id, &manifest, self.cached_backend, self.master)
            .with_context(|| format!("Couldn't read blob {blob_id} from pack {pack_id}"))?;
        Ok(bytes)
    }

    fn manifest_for(&mut self, pack_id: ObjectId) -> Result<Arc<pack::PackManifest>> {
        if let Some(m) = self.manifests.get(&pack_id) {
            return Ok(m.clone());
        }
        debug!("Loading manifest for pack {pack_id}");
        let manifest = Arc::new(pack::load_manifest(&pack_id, self.cached_backend, self.master)?);
        self.manifests.insert(pack_id, manifest.clone());
        Ok(manifest)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::BTreeSet;

    use tokio::sync::mpsc::{channel, unbounded_channel};
    use tokio::task::spawn_blocking;

    use crate::blob;
    use crate::chunk;

    #[tokio::test]
    async fn smoke() -> Result<()> {
        let backup_dir = tempfile::tempdir().expect("Failed to create temp test directory");
        let backend = backend::initialize(backup_dir.path())?;

        let mut chunks = Vec::new();
        chunks.extend(chunk::chunk_file("tests/references/sr71.txt")?);
        chunks.extend(chunk::chunk_file("tests/references/README.md")?);
        assert_eq!(chunks.len(), 2);

        let master = Arc::new(MasterKey::generate());

        let (chunk_tx, chunk_rx) = unbounded_channel();
        let (pack_tx, mut pack_rx) = unbounded_channel();
        let (upload_tx, mut upload_rx) = channel(1);

        let packer_key = master.clone();
        let chunk_packer =
            spawn_blocking(move || pack::pack(packer_key, 2, chunk_rx, pack_tx, upload_tx));

        let uploader = spawn_blocking(move || -> Result<Vec<(ObjectId, tempfile::NamedTempFile)>> {
            let mut packs = Vec::new();
            while let Some((id, fh)) = upload_rx.blocking_recv() {
                packs.push((id, fh));
            }
            Ok(packs)
        });

        for chunk in &chunks {
            chunk_tx.send(chunk.clone())?;
        }
        drop(chunk_tx);

        let mut metadatas = Vec::new();
        while let Some(metadata) = pack_rx.recv().await {
            metadatas.push(metadata);
        }
        chunk_packer.await.unwrap()?;

        for (id, fh) in uploader.await.unwrap()? {
            let bytes = std::fs::read(fh.path())?;
            backend.write_pack_reader(&id, &mut bytes.as_slice())?;
        }

        let mut index_map = index::PackMap::new();
        for metadata in metadatas {
            index_map.insert(metadata.id, metadata.manifest);
        }
        let index = index::Index {
            packs: index_map,
            supersedes: BTreeSet::new(),
        };
        let blob_map = index::blob_to_pack_map(&index)?;

        let mut reader = BlobReader::new(&backend, &master, &blob_map);
        for chunk in &chunks {
            let bytes = reader.read_blob(&chunk.id)?;
            assert_eq!(&bytes, chunk.bytes());
        }
        // Read again to exercise the manifest cache.
        for chunk in chunks.iter().rev() {
            let bytes = reader.read_blob(&chunk.id)?;
            assert_eq!(&bytes, chunk.bytes());
        }
        let _ = blob::Type::Data;
        Ok(())
    }
}
