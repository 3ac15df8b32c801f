//! Uploads finished packs and indexes to a [backend](crate::backend).
//!
//! Both arrive from their writer tasks already spooled to a temp file on
//! disk; this just hands each to the backend under its final name. Meant to
//! run on a blocking thread - [`CachedBackend`] talks straight to the
//! filesystem, never `.await`s.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tempfile::NamedTempFile;
use tokio::sync::mpsc::Receiver;
use tracing::*;

use crate::backend::CachedBackend;
use crate::hashing::ObjectId;

/// Uploads finished packfiles as they arrive from the packer.
pub fn upload_packs(
    cached_backend: &CachedBackend,
    mut rx: Receiver<(ObjectId, NamedTempFile)>,
) -> Result<()> {
    while let Some((id, mut fh)) = rx.blocking_recv() {
        fh.as_file_mut().seek(SeekFrom::Start(0))?;
        cached_backend
            .write_pack_reader(&id, fh.as_file_mut())
            .with_context(|| format!("Couldn't upload pack {id}"))?;
        debug!("Uploaded pack {id}");
    }
    Ok(())
}

/// Uploads a finished index as it arrives from the indexer, under the
/// `<id>.index` name it was given when persisted to disk.
pub fn upload_indexes(cached_backend: &CachedBackend, mut rx: Receiver<(String, File)>) -> Result<()> {
    while let Some((name, mut fh)) = rx.blocking_recv() {
        fh.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        fh.read_to_end(&mut bytes)
            .with_context(|| format!("Couldn't read {name} back in for upload"))?;

        let id: ObjectId = Path::new(&name)
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("Bad index name {name}"))?
            .parse()
            .with_context(|| format!("Bad index name {name}"))?;

        cached_backend
            .write_index(&id, &bytes)
            .with_context(|| format!("Couldn't upload index {id}"))?;
        debug!("Uploaded index {id}");

        // Best-effort; the WIP copy already did its job once it's on the backend.
        let _ = std::fs::remove_file(&name);
    }
    Ok(())
}
