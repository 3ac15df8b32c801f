//! Common backup machinery exposed as channel-chomping tasks.
//!
//! Various commands (backup, prune rewrites, etc.) can walk data, existing
//! or new, and send blobs to this machinery: chunk and tree packers feed a
//! shared indexer, and both packs and indexes flow out to their own upload
//! tasks. Packing, indexing, and uploading all talk straight to the
//! filesystem/backend, so they run on blocking threads; only the plumbing
//! between them is async.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use anyhow::{Result, bail};
use tempfile::NamedTempFile;
use tokio::sync::mpsc::{
    Receiver, Sender, UnboundedReceiver, UnboundedSender, channel, unbounded_channel,
};
use tokio::task::{JoinHandle, spawn, spawn_blocking};
use tracing::*;

use crate::backend;
use crate::blob::Blob;
use crate::crypto::MasterKey;
use crate::hashing::ObjectId;
use crate::index;
use crate::pack::{self, PackMetadata};
use crate::upload;

/// Running tallies of bytes seen while walking and packing a backup's
/// source trees, for progress reporting. New (as opposed to deduplicated)
/// bytes only - [`crate::rcu`]-published "current file" state lives
/// alongside this in the UI layer.
#[derive(Debug, Default)]
pub struct BackupStatistics {
    pub chunk_bytes: AtomicU64,
    pub tree_bytes: AtomicU64,
}

pub struct Backup {
    pub chunk_tx: UnboundedSender<Blob>,
    pub tree_tx: UnboundedSender<Blob>,
    pub tasks: JoinHandle<Result<()>>,
}

impl Backup {
    /// Convenience function to join the tasks,
    /// assuming the channels haven't been moved out.
    pub async fn join(self) -> Result<()> {
        drop(self.chunk_tx);
        drop(self.tree_tx);
        self.tasks.await.unwrap()
    }
}

pub fn spawn_backup_tasks(
    cached_backend: Arc<backend::CachedBackend>,
    master: Arc<MasterKey>,
    format_version: u32,
    starting_index: index::Index,
) -> Backup {
    let (chunk_tx, chunk_rx) = unbounded_channel();
    let (tree_tx, tree_rx) = unbounded_channel();

    let tasks = spawn(backup_master_task(
        chunk_rx,
        tree_rx,
        cached_backend,
        master,
        format_version,
        starting_index,
    ));

    Backup {
        chunk_tx,
        tree_tx,
        tasks,
    }
}

async fn backup_master_task(
    chunk_rx: UnboundedReceiver<Blob>,
    tree_rx: UnboundedReceiver<Blob>,
    cached_backend: Arc<backend::CachedBackend>,
    master: Arc<MasterKey>,
    format_version: u32,
    starting_index: index::Index,
) -> Result<()> {
    // Chunk and tree packers share one indexer, since an index just lists
    // which packs hold which blobs - it doesn't care what kind wrote them.
    let (pack_to_index_tx, pack_to_index_rx) = unbounded_channel::<PackMetadata>();
    let tree_to_index_tx = pack_to_index_tx.clone();

    let (pack_upload_tx, pack_upload_rx) = channel::<(ObjectId, NamedTempFile)>(1);
    let tree_pack_upload_tx = pack_upload_tx.clone();

    let (index_upload_tx, index_upload_rx) = channel::<(String, File)>(1);

    let chunk_master = master.clone();
    let chunk_packer = spawn_blocking(move || {
        pack::pack(
            chunk_master,
            format_version,
            chunk_rx,
            pack_to_index_tx,
            pack_upload_tx,
        )
    });

    let tree_master = master.clone();
    let tree_packer = spawn_blocking(move || {
        pack::pack(
            tree_master,
            format_version,
            tree_rx,
            tree_to_index_tx,
            tree_pack_upload_tx,
        )
    });

    let index_master = master.clone();
    let indexer = spawn(index::index(
        starting_index,
        index_master,
        pack_to_index_rx,
        index_upload_tx,
    ));

    let pack_backend = cached_backend.clone();
    let pack_uploader = spawn_blocking(move || upload::upload_packs(&pack_backend, pack_upload_rx));

    let index_backend = cached_backend;
    let index_uploader =
        spawn_blocking(move || upload::upload_indexes(&index_backend, index_upload_rx));

    let mut errors: Vec<anyhow::Error> = Vec::new();
    let mut append_error = |result: Result<()>| {
        if let Err(e) = result {
            errors.push(e);
        }
    };

    append_error(pack_uploader.await.unwrap());
    append_error(index_uploader.await.unwrap());
    append_error(chunk_packer.await.unwrap());
    append_error(tree_packer.await.unwrap());
    append_error(indexer.await.unwrap().map(|_wrote_anything| ()));

    if errors.is_empty() {
        Ok(())
    } else {
        for e in &errors {
            error!("{:?}", e);
        }
        bail!("backup failed");
    }
}
