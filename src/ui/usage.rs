//! Show how much space each snapshot uses and uniquely owns.

use anyhow::Result;
use camino::Utf8Path;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cancel::CancellationToken;
use crate::config::{self, Configuration};
use crate::file_util::nice_size;
use crate::{backend, blob, index, key, snapshot, tree};

pub fn run(config: Configuration, repository: &Utf8Path) -> Result<()> {
    let password = config::resolve_password(&config)?;
    let cached_backend = backend::open(repository.as_std_path())?;
    let master = key::open_any(&cached_backend, &password)?;
    let cancel = CancellationToken::new();

    let snapshots = snapshot::load_chronologically(&cached_backend, &master)?;
    if snapshots.is_empty() {
        println!("0 snapshots");
        return Ok(());
    }
    println!(
        "{} snapshots, from {} to {}",
        snapshots.len(),
        snapshots.first().unwrap().0.time,
        snapshots.last().unwrap().0.time
    );

    let index = index::build_master_index(&cached_backend, &master)?;
    let blob_map = index::blob_to_pack_map(&index)?;
    let all_blobs = index::blob_set(&index)?;

    // Stored (post-compression) length of every data blob, keyed by its own
    // ID rather than whatever pack happens to hold it.
    let mut data_lengths: FxHashMap<_, u64> = FxHashMap::default();
    for manifest in index.packs.values() {
        for entry in manifest {
            if entry.blob_type == blob::Type::Data {
                data_lengths.insert(entry.id, entry.length as u64);
            }
        }
    }

    let mut cache = tree::Cache::new(&index, &blob_map, &cached_backend, &master);
    let mut used_blobs = FxHashSet::default();
    let mut unique_chunks = FxHashSet::default();
    let mut total_with_duplicates: u64 = 0;

    for (snap, _id) in &snapshots {
        cancel.check()?;
        let forest = tree::forest_from_root(&snap.tree, &mut cache)?;
        used_blobs.extend(forest.keys().copied());

        let chunks = tree::chunks_in_forest(&forest);
        for chunk in &chunks {
            if let Some(len) = data_lengths.get(*chunk) {
                total_with_duplicates += len;
            }
        }
        unique_chunks.extend(chunks.into_iter().copied());
    }
    used_blobs.extend(unique_chunks.iter().copied());

    let unique_bytes: u64 = unique_chunks
        .iter()
        .filter_map(|id| data_lengths.get(id))
        .sum();
    let reused_bytes = total_with_duplicates.saturating_sub(unique_bytes);

    println!(
        "contain {} unique data, saving {} by reuse",
        nice_size(unique_bytes),
        nice_size(reused_bytes)
    );
    println!("saved in {} pack(s)", index.packs.len());

    let unused_bytes: u64 = all_blobs
        .iter()
        .filter(|b| !used_blobs.contains(*b))
        .filter_map(|id| data_lengths.get(id))
        .sum();
    if unused_bytes > 0 {
        println!(
            "{} are no longer used, consider running `vaultpak prune`",
            nice_size(unused_bytes)
        );
    }

    Ok(())
}
