//! Build, read, and write encrypted packs of [blobs](blob::Blob),
//! suitable for storing in a [backend](crate::backend).
//!
//! A pack file is laid out as:
//!
//! ```text
//! MAGIC (8 bytes)
//! enc(blob_0) enc(blob_1) ... enc(blob_n-1)   <- body
//! enc(manifest)                               <- header
//! header_length: u32 LE                       <- trailer
//! ```
//!
//! where `enc(x) = nonce(12) || ciphertext || tag(16)`. Each blob may be
//! zstd-compressed before sealing (format version 2+); when it is,
//! `uncompressed_length` records its original size. The pack's own ID is the
//! hash of the manifest's plaintext CBOR, so a pack can be named and
//! verified without ever decrypting its body.

use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use serde_derive::*;
use tempfile::NamedTempFile;
use tokio::sync::mpsc::{Sender, UnboundedReceiver, UnboundedSender};
use tracing::*;

use crate::DEFAULT_TARGET_SIZE;
use crate::backend::CachedBackend;
use crate::blob::{self, Blob};
use crate::crypto::MasterKey;
use crate::hashing::ObjectId;
use crate::tree;

const MAGIC_BYTES: &[u8] = b"VAULTPK1";

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PackManifestEntry {
    #[serde(rename = "type")]
    pub blob_type: blob::Type,
    /// Absolute byte offset of this blob's sealed form within the pack.
    pub offset: u64,
    /// Length of the sealed (and possibly compressed) form, nonce and tag included.
    pub length: u32,
    /// Set when the blob was zstd-compressed before sealing.
    pub uncompressed_length: Option<u32>,
    pub id: ObjectId,
}

pub type PackManifest = Vec<PackManifestEntry>;

#[derive(Debug, Clone)]
pub struct PackMetadata {
    pub id: ObjectId,
    pub manifest: PackManifest,
}

/// Serializes a pack's manifest and gets its ID.
///
/// A pack file is identified by the hash of its (plaintext) manifest.
fn serialize_and_hash(manifest: &[PackManifestEntry]) -> Result<(Vec<u8>, ObjectId)> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(manifest, &mut buf)?;
    let id = ObjectId::hash(&buf);
    Ok((buf, id))
}

/// Packs blobs received from the given channel.
pub fn pack(
    master: std::sync::Arc<MasterKey>,
    format_version: u32,
    mut rx: UnboundedReceiver<Blob>,
    to_index: UnboundedSender<PackMetadata>,
    to_upload: Sender<(ObjectId, NamedTempFile)>,
) -> Result<()> {
    let mut writer = PackfileWriter::new(master.clone(), format_version)?;

    while let Some(blob) = rx.blocking_recv() {
        writer.write_blob(blob)?;

        if writer.body_bytes_written >= DEFAULT_TARGET_SIZE {
            trace!(
                "Pack has grown to {} bytes, finishing it",
                writer.body_bytes_written
            );
            let (metadata, persisted) = writer.finalize()?;
            to_upload
                .blocking_send((metadata.id, persisted))
                .context("packer -> uploader channel exited early")?;
            to_index
                .send(metadata)
                .context("packer -> indexer channel exited early")?;

            writer = PackfileWriter::new(master.clone(), format_version)?;
        }
    }

    if writer.body_bytes_written > MAGIC_BYTES.len() as u64 {
        let (metadata, persisted) = writer.finalize()?;
        to_upload
            .blocking_send((metadata.id, persisted))
            .context("packer -> uploader channel exited early")?;
        to_index
            .send(metadata)
            .context("packer -> indexer channel exited early")?;
    }
    Ok(())
}

struct PackfileWriter {
    master: std::sync::Arc<MasterKey>,
    compress: bool,
    body: NamedTempFile,
    body_bytes_written: u64,
    manifest: PackManifest,
}

impl PackfileWriter {
    fn new(master: std::sync::Arc<MasterKey>, format_version: u32) -> Result<Self> {
        let mut fh = tempfile::Builder::new()
            .prefix("vaultpak-")
            .suffix(".pack")
            .tempfile()
            .context("Couldn't open temporary packfile for writing")?;
        fh.write_all(MAGIC_BYTES)?;

        Ok(Self {
            master,
            compress: format_version >= 2,
            body: fh,
            body_bytes_written: MAGIC_BYTES.len() as u64,
            manifest: Vec::new(),
        })
    }

    /// Writes the given blob's sealed form to the packfile and records it in the manifest.
    fn write_blob(&mut self, blob: Blob) -> Result<()> {
        trace!("Writing {:?} {}", blob.kind, blob.id);

        let plaintext = blob.bytes();
        assert!(plaintext.len() <= u32::MAX as usize);

        let (to_seal, uncompressed_length): (std::borrow::Cow<[u8]>, Option<u32>) = if self.compress {
            let compressed = zstd::block::compress(plaintext, 0)
                .context("Couldn't compress blob before sealing")?;
            if compressed.len() < plaintext.len() {
                (
                    std::borrow::Cow::Owned(compressed),
                    Some(plaintext.len() as u32),
                )
            } else {
                (std::borrow::Cow::Borrowed(plaintext), None)
            }
        } else {
            (std::borrow::Cow::Borrowed(plaintext), None)
        };

        let sealed = self.master.seal(&to_seal);
        let offset = self.body_bytes_written;
        self.body.write_all(&sealed)?;
        self.body_bytes_written += sealed.len() as u64;

        self.manifest.push(PackManifestEntry {
            blob_type: blob.kind,
            offset,
            length: sealed.len() as u32,
            uncompressed_length,
            id: blob.id,
        });
        Ok(())
    }

    /// Finalizes the packfile, appending its sealed header and trailer and
    /// returning the manifest & ID with a handle to the persisted file (so
    /// the uploader doesn't have to reopen it).
    fn finalize(mut self) -> Result<(PackMetadata, NamedTempFile)> {
        let (manifest_plaintext, id) = serialize_and_hash(&self.manifest)?;
        let sealed_header = self.master.seal(&manifest_plaintext);

        self.body.write_all(&sealed_header)?;
        let header_length = sealed_header.len() as u32;
        self.body.write_all(&header_length.to_le_bytes())?;
        self.body.as_file().sync_all()?;

        debug!(
            "Pack {} finished ({} blobs, {} bytes)",
            id,
            self.manifest.len(),
            self.body.as_file().metadata()?.len(),
        );

        Ok((
            PackMetadata {
                id,
                manifest: self.manifest,
            },
            self.body,
        ))
    }
}

/// Reads and decrypts the header of the pack with the given ID, verifying it
/// hashes to `id`. Only touches the tail of the pack (stat + two ranged
/// reads), never the (potentially huge) body.
pub fn load_manifest(
    id: &ObjectId,
    cached_backend: &CachedBackend,
    master: &MasterKey,
) -> Result<PackManifest> {
    debug!("Loading pack header {id}");

    let size = cached_backend.stat_pack(id)?;
    ensure!(
        size > MAGIC_BYTES.len() as u64 + 4,
        "Pack {id} is too small to contain a header"
    );

    let trailer = cached_backend.read_pack_range(id, size - 4, 4)?;
    let header_length = u32::from_le_bytes(trailer.try_into().unwrap()) as u64;
    ensure!(
        size >= MAGIC_BYTES.len() as u64 + 4 + header_length,
        "Pack {id}'s header length is corrupt"
    );

    let sealed_header =
        cached_backend.read_pack_range(id, size - 4 - header_length, header_length)?;
    let manifest_plaintext = master
        .open(&sealed_header)
        .with_context(|| format!("Couldn't decrypt header of pack {id}"))?;

    let calculated_id = ObjectId::hash(&manifest_plaintext);
    ensure!(
        *id == calculated_id,
        "Pack {id}'s header changed! Now hashes to {calculated_id}"
    );

    let manifest: PackManifest = ciborium::de::from_reader(manifest_plaintext.as_slice())
        .with_context(|| format!("CBOR decoding of pack {id}'s header failed"))?;
    Ok(manifest)
}

/// Checks that the first bytes of the pack are our magic number.
pub fn check_magic(id: &ObjectId, cached_backend: &CachedBackend) -> Result<()> {
    let magic = cached_backend.read_pack_range(id, 0, MAGIC_BYTES.len() as u64)?;
    ensure!(magic == MAGIC_BYTES, "Pack {id} has the wrong magic bytes");
    Ok(())
}

/// Reads and decrypts a single blob's sealed form, verifying it hashes to its ID.
fn open_entry(
    entry: &PackManifestEntry,
    pack_id: &ObjectId,
    cached_backend: &CachedBackend,
    master: &MasterKey,
) -> Result<Vec<u8>> {
    let sealed = cached_backend.read_pack_range(pack_id, entry.offset, entry.length as u64)?;
    let stored = master
        .open(&sealed)
        .with_context(|| format!("Couldn't decrypt blob {} in pack {pack_id}", entry.id))?;

    let plaintext = match entry.uncompressed_length {
        Some(len) => zstd::block::decompress(&stored, len as usize)
            .with_context(|| format!("Couldn't decompress blob {}", entry.id))?,
        None => stored,
    };

    let hash = ObjectId::hash(&plaintext);
    ensure!(
        entry.id == hash,
        "Calculated hash of blob ({hash}) doesn't match its ID ({})",
        entry.id
    );
    Ok(plaintext)
}

/// Verifies every blob in the given manifest matches its ID.
pub fn verify(
    pack_id: &ObjectId,
    manifest_from_index: &[PackManifestEntry],
    cached_backend: &CachedBackend,
    master: &MasterKey,
) -> Result<()> {
    check_magic(pack_id, cached_backend)?;
    for entry in manifest_from_index {
        open_entry(entry, pack_id, cached_backend, master)?;
        trace!("Blob {} matches its ID", entry.id);
    }
    Ok(())
}

/// Extracts a single blob from a packfile. Useful for `cat blob`.
pub fn extract_blob(
    pack_id: &ObjectId,
    blob_id: &ObjectId,
    manifest_from_index: &[PackManifestEntry],
    cached_backend: &CachedBackend,
    master: &MasterKey,
) -> Result<Vec<u8>> {
    let entry = manifest_from_index
        .iter()
        .find(|e| e.id == *blob_id)
        .with_context(|| format!("Blob {blob_id} isn't in pack {pack_id}'s manifest"))?;
    open_entry(entry, pack_id, cached_backend, master)
}

/// Reads in a pack (presumably of all trees) and appends them to the given forest.
pub fn append_to_forest(
    pack_id: &ObjectId,
    manifest_from_index: &[PackManifestEntry],
    cached_backend: &CachedBackend,
    master: &MasterKey,
    forest: &mut tree::Forest,
) -> Result<()> {
    for entry in manifest_from_index {
        if entry.blob_type != blob::Type::Tree {
            warn!(
                "Blob {} found in pack {pack_id} where we expected only trees",
                entry.id
            );
            continue;
        }
        if forest.contains_key(&entry.id) {
            trace!("Tree {} is already in the forest, skipping", entry.id);
            continue;
        }

        let plaintext = open_entry(entry, pack_id, cached_backend, master)?;
        let to_add: tree::Tree = ciborium::de::from_reader(plaintext.as_slice())
            .with_context(|| format!("CBOR decoding of tree {} failed", entry.id))?;

        assert!(
            forest
                .insert(entry.id, std::sync::Arc::new(to_add))
                .is_none()
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;

    use tokio::sync::mpsc::{channel, unbounded_channel};
    use tokio::task::spawn_blocking;

    use crate::chunk;

    fn test_key() -> Arc<MasterKey> {
        Arc::new(MasterKey::generate())
    }

    #[test]
    fn stability() -> Result<()> {
        let manifest = vec![
            PackManifestEntry {
                blob_type: blob::Type::Data,
                offset: 8,
                length: 42,
                uncompressed_length: None,
                id: ObjectId::hash(b"first"),
            },
            PackManifestEntry {
                blob_type: blob::Type::Tree,
                offset: 50,
                length: 22,
                uncompressed_length: Some(30),
                id: ObjectId::hash(b"second"),
            },
        ];

        let (bytes, id) = serialize_and_hash(&manifest)?;
        // Re-parsing what we just serialized should round-trip exactly.
        let reparsed: PackManifest = ciborium::de::from_reader(bytes.as_slice())?;
        assert_eq!(reparsed, manifest);
        assert_eq!(id, ObjectId::hash(&bytes));
        Ok(())
    }

    #[tokio::test]
    async fn smoke() -> Result<()> {
        let master = test_key();

        let chunks = chunk::chunk_file("tests/references/sr71.txt")
            .context("Couldn't chunk reference file")?;
        let (chunk_tx, chunk_rx) = unbounded_channel();
        let (pack_tx, mut pack_rx) = unbounded_channel();
        let (upload_tx, mut upload_rx) = channel(1);

        let packer_key = master.clone();
        let chunk_packer =
            spawn_blocking(move || pack(packer_key, 2, chunk_rx, pack_tx, upload_tx));

        let upload_chucker = spawn_blocking(move || {
            let mut packs = Vec::new();
            while let Some((id, fh)) = upload_rx.blocking_recv() {
                packs.push((id, fh));
            }
            packs
        });

        for chunk in &chunks {
            chunk_tx.send(chunk.clone())?
        }
        drop(chunk_tx);

        let mut merged_manifest: PackManifest = Vec::new();
        let mut pack_ids = Vec::new();
        while let Some(metadata) = pack_rx.recv().await {
            pack_ids.push(metadata.id);
            merged_manifest.extend(metadata.manifest);
        }

        chunk_packer.await.unwrap()?;
        let uploaded = upload_chucker.await.unwrap();

        assert_eq!(chunks.len(), merged_manifest.len());
        assert_eq!(uploaded.len(), pack_ids.len());
        for (chunk, entry) in chunks.iter().zip(merged_manifest.iter()) {
            assert_eq!(entry.blob_type, blob::Type::Data);
            assert_eq!(entry.id, chunk.id);
        }
        Ok(())
    }
}
