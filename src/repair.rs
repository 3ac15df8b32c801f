//! Salvages what's left of a damaged repository.
//!
//! `repair packs` re-reads suspect packs blob-by-blob, keeping everything
//! that still MAC-verifies and writing it into fresh packs; the damaged
//! packs are then dropped from the index. `repair snapshots` rewrites tree
//! DAGs to route around references to blobs that turned out to be gone,
//! producing new snapshots that stand in for the damaged ones.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::*;

use crate::backend::CachedBackend;
use crate::backup;
use crate::blob;
use crate::cancel::CancellationToken;
use crate::crypto::MasterKey;
use crate::hashing::ObjectId;
use crate::index::{self, Index};
use crate::pack;
use crate::prune;
use crate::snapshot::{self, Snapshot};
use crate::tree::{self, Node, NodeContents, Tree};

#[derive(Debug, Default, Clone)]
pub struct RepairPacksReport {
    pub packs_examined: usize,
    pub packs_dropped: usize,
    pub blobs_salvaged: u64,
    pub blobs_lost: u64,
}

/// Re-reads `suspect_packs` blob-by-blob, keeping everything that still
/// MAC-verifies against its ID and writing it into fresh packs; every
/// suspect pack is then marked obsolete in a rebuilt index and deleted,
/// whether or not anything was salvaged from it.
pub async fn repair_packs(
    cached_backend: Arc<CachedBackend>,
    master: Arc<MasterKey>,
    format_version: u32,
    suspect_packs: &[ObjectId],
    cancel: &CancellationToken,
) -> Result<RepairPacksReport> {
    let mut report = RepairPacksReport {
        packs_examined: suspect_packs.len(),
        ..Default::default()
    };
    if suspect_packs.is_empty() {
        return Ok(report);
    }

    let index = index::build_master_index(&cached_backend, &master)?;

    let backup = backup::spawn_backup_tasks(
        cached_backend.clone(),
        master.clone(),
        format_version,
        Index::default(),
    );
    let chunk_tx = backup.chunk_tx.clone();
    let tree_tx = backup.tree_tx.clone();

    let read_backend = cached_backend.clone();
    let read_master = master.clone();
    let suspects = suspect_packs.to_vec();
    let salvage = tokio::task::spawn_blocking(move || -> Result<(u64, u64, usize)> {
        let mut salvaged = 0u64;
        let mut lost = 0u64;
        let mut unreadable_manifests = 0usize;
        for pack_id in &suspects {
            let manifest = match pack::load_manifest(pack_id, &read_backend, &read_master) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Pack {pack_id}'s header is unreadable, dropping it entirely: {e:#}");
                    unreadable_manifests += 1;
                    continue;
                }
            };

            for entry in &manifest {
                match pack::extract_blob(pack_id, &entry.id, &manifest, &read_backend, &read_master) {
                    Ok(plaintext) => {
                        let sent = blob::Blob {
                            contents: blob::Contents::Buffer(plaintext),
                            id: entry.id,
                            kind: entry.blob_type,
                        };
                        match entry.blob_type {
                            blob::Type::Data => chunk_tx.send(sent)?,
                            blob::Type::Tree => tree_tx.send(sent)?,
                        }
                        salvaged += 1;
                    }
                    Err(e) => {
                        warn!("Lost blob {} in pack {pack_id}: {e:#}", entry.id);
                        lost += 1;
                    }
                }
            }
        }
        Ok((salvaged, lost, unreadable_manifests))
    });

    cancel.check()?;
    let (salvaged, lost, unreadable) = salvage.await.context("Pack salvage task panicked")??;
    backup.join().await.context("Writing salvaged blobs into new packs failed")?;

    report.blobs_salvaged = salvaged;
    report.blobs_lost = lost;
    report.packs_dropped = suspect_packs.len();
    let _ = unreadable; // folded into packs_dropped; every suspect pack is obsolete either way.

    cancel.check()?;
    let obsolete: FxHashSet<ObjectId> = suspect_packs.iter().copied().collect();
    prune::rebuild_index(&cached_backend, master.clone(), &index, &obsolete).await?;

    cancel.check()?;
    for pack_id in suspect_packs {
        cached_backend.remove_pack(pack_id).ok();
    }

    Ok(report)
}

#[derive(Debug, Default, Clone)]
pub struct RepairSnapshotsReport {
    pub snapshots_examined: usize,
    pub snapshots_rewritten: usize,
    pub snapshots_dropped: usize,
    pub files_trimmed: u64,
    pub subtrees_replaced: u64,
}

/// Per-blob plaintext length, looked up without reading the blob itself:
/// the manifest already records either the original length (if it was
/// compressed) or the sealed length, which is the plaintext length plus
/// the fixed AEAD nonce+tag overhead.
fn plaintext_len(entry: &pack::PackManifestEntry) -> u64 {
    const AEAD_OVERHEAD: u32 = 12 + 16;
    entry
        .uncompressed_length
        .unwrap_or_else(|| entry.length.saturating_sub(AEAD_OVERHEAD)) as u64
}

struct RewriteContext<'a> {
    cache: tree::Cache<'a>,
    blob_lengths: &'a FxHashMap<ObjectId, u64>,
    live_blobs: &'a FxHashSet<ObjectId>,
    subtrees_replaced: u64,
    files_trimmed: u64,
    new_trees: Vec<(ObjectId, Vec<u8>)>,
}

/// Rewrites the tree rooted at `tree_id`, trimming file content that
/// references a blob the index no longer has and recursing into
/// subdirectories. A subtree that can't be read at all (its own blob is
/// gone, or reading it errors) is replaced by the empty tree. Returns the
/// ID of the (possibly unchanged) rewritten tree.
fn rewrite_tree(tree_id: &ObjectId, ctx: &mut RewriteContext) -> ObjectId {
    let tree = match ctx.cache.read(tree_id) {
        Ok(t) => t,
        Err(e) => {
            warn!("Couldn't read tree {tree_id}, replacing with an empty directory: {e:#}");
            ctx.subtrees_replaced += 1;
            return *tree::EMPTY_ID;
        }
    };

    let mut changed = false;
    let mut new_tree: Tree = Tree::new();
    for (path, node) in tree.iter() {
        let new_node = match &node.contents {
            NodeContents::Dir { subtree } => {
                let new_subtree = rewrite_tree(subtree, ctx);
                if new_subtree == *subtree {
                    node.clone()
                } else {
                    changed = true;
                    Node {
                        contents: NodeContents::Dir { subtree: new_subtree },
                        metadata: node.metadata.clone(),
                    }
                }
            }
            NodeContents::File { size, content, inode } => {
                if content.iter().all(|id| ctx.live_blobs.contains(id)) {
                    node.clone()
                } else {
                    changed = true;
                    ctx.files_trimmed += 1;
                    let kept: Vec<ObjectId> = content
                        .iter()
                        .filter(|id| ctx.live_blobs.contains(*id))
                        .copied()
                        .collect();
                    let new_size: u64 = kept
                        .iter()
                        .map(|id| ctx.blob_lengths.get(id).copied().unwrap_or(0))
                        .sum();
                    info!(
                        "Trimming file at {path}: {} of {} chunks survived (size {size} -> {new_size})",
                        kept.len(),
                        content.len()
                    );
                    Node {
                        contents: NodeContents::File {
                            size: new_size,
                            content: kept,
                            inode: *inode,
                        },
                        metadata: node.metadata.clone(),
                    }
                }
            }
            _ => node.clone(),
        };
        new_tree.insert(path.clone(), new_node);
    }

    if !changed {
        return *tree_id;
    }

    let (serialized, new_id) = match tree::serialize_and_hash(&new_tree) {
        Ok(v) => v,
        Err(e) => {
            warn!("Couldn't re-serialize rewritten tree under {tree_id}, dropping it: {e:#}");
            ctx.subtrees_replaced += 1;
            return *tree::EMPTY_ID;
        }
    };
    ctx.new_trees.push((new_id, serialized));
    new_id
}

/// Rewrites every snapshot to route around blobs the index no longer has,
/// uploading a new snapshot wherever anything changed. Snapshots whose
/// root tree can't be salvaged at all are dropped outright. When `forget`
/// is set, snapshots that were successfully replaced are deleted after
/// their replacement is durable; `original` is carried forward so a
/// repaired snapshot still traces back to its first backed-up ancestor.
pub async fn repair_snapshots(
    cached_backend: Arc<CachedBackend>,
    master: Arc<MasterKey>,
    format_version: u32,
    forget: bool,
    cancel: &CancellationToken,
) -> Result<RepairSnapshotsReport> {
    let mut report = RepairSnapshotsReport::default();

    let index = index::build_master_index(&cached_backend, &master)?;
    let blob_map = index::blob_to_pack_map(&index)?;
    let live_blobs = index::blob_set(&index)?;

    let mut blob_lengths: FxHashMap<ObjectId, u64> = FxHashMap::default();
    for manifest in index.packs.values() {
        for entry in manifest {
            blob_lengths.insert(entry.id, plaintext_len(entry));
        }
    }

    let snapshots = snapshot::load_chronologically(&cached_backend, &master)?;
    report.snapshots_examined = snapshots.len();

    let backup = backup::spawn_backup_tasks(
        cached_backend.clone(),
        master.clone(),
        format_version,
        Index::default(),
    );
    let tree_tx = backup.tree_tx.clone();

    let mut replaced: Vec<(ObjectId, Snapshot)> = Vec::new();
    let mut dropped: Vec<ObjectId> = Vec::new();

    for (snap, old_id) in snapshots {
        cancel.check()?;
        let mut ctx = RewriteContext {
            cache: tree::Cache::new(&index, &blob_map, &cached_backend, &master),
            blob_lengths: &blob_lengths,
            live_blobs: &live_blobs,
            subtrees_replaced: 0,
            files_trimmed: 0,
            new_trees: Vec::new(),
        };

        let new_root = rewrite_tree(&snap.tree, &mut ctx);
        report.subtrees_replaced += ctx.subtrees_replaced;
        report.files_trimmed += ctx.files_trimmed;

        if new_root == *tree::EMPTY_ID && snap.tree != *tree::EMPTY_ID {
            warn!("Snapshot {old_id}'s root is unsalvageable, dropping it");
            report.snapshots_dropped += 1;
            dropped.push(old_id);
            continue;
        }

        if new_root == snap.tree {
            continue;
        }

        for (id, bytes) in ctx.new_trees {
            tree_tx.send(blob::Blob {
                contents: blob::Contents::Buffer(bytes),
                id,
                kind: blob::Type::Tree,
            })?;
        }

        let mut new_snapshot = snap.clone();
        new_snapshot.tree = new_root;
        new_snapshot.original = Some(snap.original.unwrap_or(old_id));
        replaced.push((old_id, new_snapshot));
    }

    drop(tree_tx);
    backup.join().await.context("Writing rewritten trees failed")?;

    for (old_id, new_snapshot) in &replaced {
        let new_id = snapshot::upload(new_snapshot, &cached_backend, &master)?;
        info!("Snapshot {old_id} repaired as {new_id}");
        report.snapshots_rewritten += 1;
        if forget {
            cached_backend.remove_snapshot(old_id).ok();
        }
    }
    for old_id in &dropped {
        if forget {
            cached_backend.remove_snapshot(old_id).ok();
        }
    }

    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(id: ObjectId, length: u32, uncompressed: Option<u32>) -> pack::PackManifestEntry {
        pack::PackManifestEntry {
            blob_type: blob::Type::Data,
            offset: 0,
            length,
            uncompressed_length: uncompressed,
            id,
        }
    }

    #[test]
    fn plaintext_len_uses_uncompressed_length_when_present() {
        let e = entry(ObjectId::hash(b"a"), 40, Some(100));
        assert_eq!(plaintext_len(&e), 100);
    }

    #[test]
    fn plaintext_len_subtracts_aead_overhead_when_uncompressed() {
        let e = entry(ObjectId::hash(b"a"), 128, None);
        assert_eq!(plaintext_len(&e), 128 - 28);
    }
}
