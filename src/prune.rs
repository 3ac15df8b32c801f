//! Decides which packs to keep, repack, or remove, then carries that plan out.
//!
//! Packs are first partitioned into "fully reachable" and "not"; this
//! module builds on that with a full stage A-D planner and an executor
//! that actually repacks and deletes.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::*;

use crate::backend::{self, CachedBackend};
use crate::backup;
use crate::blob;
use crate::cancel::CancellationToken;
use crate::crypto::MasterKey;
use crate::error::VaultError;
use crate::hashing::ObjectId;
use crate::index::{self, Index};
use crate::pack;
use crate::read;
use crate::snapshot;
use crate::tree;

/// A cap on how much unused space a pruned repository is allowed to carry,
/// parsed from `--max-unused`.
#[derive(Debug, Clone, Copy)]
pub enum MaxUnused {
    Bytes(u64),
    Percent(f64),
    Unlimited,
}

impl MaxUnused {
    pub fn parse(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(MaxUnused::Unlimited);
        }
        if let Some(pct) = s.strip_suffix('%') {
            let percent: f64 = pct.parse().context("Invalid percentage")?;
            return Ok(MaxUnused::Percent(percent));
        }
        let bytes = byte_unit::Byte::parse_str(s, true)
            .context("Invalid byte size")?
            .as_u64();
        Ok(MaxUnused::Bytes(bytes))
    }

    /// The absolute byte target this cap implies, given the repository's
    /// total pack bytes. `None` means "no target" (`unlimited`).
    fn target_bytes(self, total_repo_bytes: u64) -> Option<u64> {
        match self {
            MaxUnused::Unlimited => None,
            MaxUnused::Bytes(b) => Some(b),
            MaxUnused::Percent(p) => Some(((total_repo_bytes as f64) * (p / 100.0)).round() as u64),
        }
    }
}

impl Default for MaxUnused {
    fn default() -> Self {
        // Keep unused space under 5% of the repo by default.
        MaxUnused::Percent(5.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
    pub max_unused: MaxUnused,
    /// Caps the total bytes repacked in one run; `None` means no cap.
    pub max_repack_bytes: Option<u64>,
    /// Never repack data packs, only remove fully-unused ones.
    pub repack_cacheable_only: bool,
    /// Also repack small fully-used packs instead of leaving them alone.
    pub repack_small: bool,
    /// Also repack uncompressed data packs (tree packs always are, in v2+).
    pub repack_uncompressed: bool,
    /// Forces `max_repack_bytes` to 0: remove orphans and fully-unused
    /// packs only, recovering free space without repacking anything. The
    /// repository ID is required as a confirmation that the caller meant
    /// to point this at the repo they think they did.
    pub unsafe_no_free_space_recovery: Option<ObjectId>,
    pub dry_run: bool,
}

/// Plaintext-size accounting for a single pack's blobs, split by whether
/// each blob is still reachable ("used") or not.
#[derive(Debug, Clone, Copy, Default)]
struct PackAccounting {
    used_blobs: u64,
    unused_blobs: u64,
    used_bytes: u64,
    unused_bytes: u64,
    has_data: bool,
    has_tree: bool,
    any_uncompressed: bool,
}

impl PackAccounting {
    fn total_bytes(&self) -> u64 {
        self.used_bytes + self.unused_bytes
    }

    fn mixed(&self) -> bool {
        self.has_data && self.has_tree
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum PackFate {
    Keep,
    Remove,
    RepackCandidate,
}

#[derive(Debug, Default, Clone)]
pub struct PruneStats {
    pub packs_kept: usize,
    pub packs_removed: usize,
    pub packs_repacked: usize,
    pub orphan_packs_removed: usize,
    pub bytes_reclaimed: u64,
}

/// The output of [`plan`]: exactly what an [`execute`] call will do.
#[derive(Debug, Default)]
pub struct PrunePlan {
    /// On the backend, but not named by any index: safe to delete up front.
    pub remove_packs_first: Vec<ObjectId>,
    /// Packs to stream-read and whose still-used blobs get repacked.
    pub repack_packs: Vec<ObjectId>,
    /// Packs whose content is either entirely unused or fully migrated by a repack.
    pub remove_packs: Vec<ObjectId>,
    /// Blobs to carry over when repacking `repack_packs`.
    pub keep_blobs: FxHashSet<ObjectId>,
    /// Named by the index, missing from the backend, containing nothing needed.
    pub ignore_packs: Vec<ObjectId>,
    pub stats: PruneStats,
}

/// Stage A+ish: the set of blobs (tree and data) reachable from every
/// snapshot the caller intends to keep. Callers that only want a subset of
/// snapshots pruned should filter the list from [`snapshot::load_chronologically`]
/// before computing this.
pub fn used_blobs(
    cached_backend: &CachedBackend,
    master: &MasterKey,
    index: &Index,
    cancel: &CancellationToken,
) -> Result<FxHashSet<ObjectId>> {
    let blob_map = index::blob_to_pack_map(index)?;
    let mut cache = tree::Cache::new(index, &blob_map, cached_backend, master);

    let mut used = FxHashSet::default();
    for (snap, _id) in snapshot::load_chronologically(cached_backend, master)? {
        cancel.check()?;
        let forest = tree::forest_from_root(&snap.tree, &mut cache)?;
        used.extend(forest.keys().copied());
        used.extend(tree::chunks_in_forest(&forest).into_iter().copied());
    }
    Ok(used)
}

/// Stage A: for every blob reachable from a kept snapshot, decide which
/// single pack occurrence gets marked "used" when the blob is stored more
/// than once. Ties prefer a pack that already holds another used blob
/// (lexicographically smallest pack ID among those); failing that, the
/// lexicographically smallest pack ID overall. Both rules are evaluated
/// over sorted (`BTreeMap`-ordered) pack IDs, so the result is deterministic
/// and stable across runs.
fn resolve_used_occurrences(
    index: &Index,
    used: &FxHashSet<ObjectId>,
) -> FxHashSet<(ObjectId, ObjectId)> {
    let mut occurrences: FxHashMap<ObjectId, Vec<ObjectId>> = FxHashMap::default();
    for (pack_id, manifest) in &index.packs {
        for entry in manifest {
            occurrences.entry(entry.id).or_default().push(*pack_id);
        }
    }

    let mut used_occurrences: FxHashSet<(ObjectId, ObjectId)> = FxHashSet::default();
    let mut pack_has_used: FxHashSet<ObjectId> = FxHashSet::default();
    let mut duplicates: Vec<(ObjectId, Vec<ObjectId>)> = Vec::new();

    for (blob_id, packs) in occurrences {
        if !used.contains(&blob_id) {
            continue;
        }
        if packs.len() == 1 {
            used_occurrences.insert((packs[0], blob_id));
            pack_has_used.insert(packs[0]);
        } else {
            duplicates.push((blob_id, packs));
        }
    }

    // Order matters for the "shares a pack with another used blob" tie-break,
    // so resolve duplicates in a fixed order rather than hash-map order.
    duplicates.sort_by_key(|(blob_id, _)| *blob_id);
    for (blob_id, packs) in duplicates {
        let chosen = packs
            .iter()
            .filter(|p| pack_has_used.contains(*p))
            .min()
            .copied()
            .unwrap_or_else(|| *packs.iter().min().expect("a duplicate has at least one occurrence"));
        used_occurrences.insert((chosen, blob_id));
        pack_has_used.insert(chosen);
    }

    used_occurrences
}

/// "Of sufficient size" for a fully-used pack to be left alone rather than
/// folded into a repack for consolidation's sake.
const MIN_KEEP_SIZE: u64 = crate::DEFAULT_TARGET_SIZE / 2;

fn classify_pack(manifest: &pack::PackManifest, used_occurrences: &FxHashSet<(ObjectId, ObjectId)>, pack_id: &ObjectId) -> PackAccounting {
    let mut acc = PackAccounting::default();
    for entry in manifest {
        match entry.blob_type {
            blob::Type::Data => acc.has_data = true,
            blob::Type::Tree => acc.has_tree = true,
        }
        if entry.uncompressed_length.is_none() {
            acc.any_uncompressed = true;
        }
        if used_occurrences.contains(&(*pack_id, entry.id)) {
            acc.used_blobs += 1;
            acc.used_bytes += entry.length as u64;
        } else {
            acc.unused_blobs += 1;
            acc.unused_bytes += entry.length as u64;
        }
    }
    acc
}

fn pack_fate(acc: &PackAccounting, format_version: u32, opts: &PruneOptions) -> PackFate {
    if acc.used_blobs == 0 {
        return PackFate::Remove;
    }
    if opts.repack_cacheable_only && acc.has_data && !acc.has_tree {
        return PackFate::Keep;
    }

    let compression_required = format_version >= 2
        && acc.any_uncompressed
        && (acc.has_tree || (acc.has_data && opts.repack_uncompressed));
    let big_enough = acc.total_bytes() >= MIN_KEEP_SIZE && !opts.repack_small;
    let fully_used_single_type = acc.unused_blobs == 0 && !acc.mixed();

    if fully_used_single_type && big_enough && !compression_required {
        PackFate::Keep
    } else {
        PackFate::RepackCandidate
    }
}

/// Stage C: sorts repack candidates (tree packs first, then packs smaller
/// than the target size, then by highest unused/used ratio) and selects a
/// prefix of them to actually repack this run, honoring `max_repack_bytes`
/// and stopping early on ordinary packs once projected unused space falls
/// under `max_unused`'s target (tree packs and packs that must be
/// compressed keep going regardless, up to the repack-size cap).
fn select_repack_candidates(
    candidates: Vec<(ObjectId, PackAccounting)>,
    format_version: u32,
    opts: &PruneOptions,
    total_repo_bytes: u64,
) -> Vec<ObjectId> {
    let max_repack_bytes = if opts.unsafe_no_free_space_recovery.is_some() {
        0
    } else {
        opts.max_repack_bytes.unwrap_or(u64::MAX)
    };

    let must_continue = |acc: &PackAccounting| -> bool {
        acc.has_tree
            || (format_version >= 2
                && acc.any_uncompressed
                && acc.has_data
                && opts.repack_uncompressed)
    };

    let mut sorted = candidates;
    sorted.sort_by(|(_, a), (_, b)| {
        b.has_tree
            .cmp(&a.has_tree)
            .then_with(|| {
                let a_small = a.total_bytes() < crate::DEFAULT_TARGET_SIZE;
                let b_small = b.total_bytes() < crate::DEFAULT_TARGET_SIZE;
                b_small.cmp(&a_small)
            })
            .then_with(|| {
                // Highest unused/used ratio first, via cross-multiplication
                // to dodge floating point: unused_a/used_a > unused_b/used_b
                // iff unused_a * used_b > unused_b * used_a.
                let lhs = a.unused_bytes as u128 * b.used_bytes.max(1) as u128;
                let rhs = b.unused_bytes as u128 * a.used_bytes.max(1) as u128;
                rhs.cmp(&lhs)
            })
    });

    let target_unused = opts.max_unused.target_bytes(total_repo_bytes);
    let mut remaining_unused: u64 = sorted.iter().map(|(_, acc)| acc.unused_bytes).sum();

    let mut selected = Vec::new();
    let mut repacked_bytes: u64 = 0;
    for (id, acc) in sorted {
        if repacked_bytes >= max_repack_bytes {
            break;
        }
        let below_target = target_unused.map(|t| remaining_unused <= t).unwrap_or(false);
        if below_target && !must_continue(&acc) {
            break;
        }
        repacked_bytes += acc.total_bytes();
        remaining_unused = remaining_unused.saturating_sub(acc.unused_bytes);
        selected.push(id);
    }
    selected
}

/// Predicts a pack's on-disk size from its manifest: `magic || body ||
/// enc(header) || trailer`, mirroring [`crate::check`]'s cross-check.
fn predicted_pack_size(manifest: &pack::PackManifest) -> Result<u64> {
    const MAGIC_LEN: u64 = 8;
    const TRAILER_LEN: u64 = 4;
    const AEAD_OVERHEAD: u64 = 12 + 16;

    let body: u64 = manifest.iter().map(|e| e.length as u64).sum();
    let mut header_plaintext = Vec::new();
    ciborium::ser::into_writer(manifest, &mut header_plaintext)
        .context("Couldn't compute predicted header size")?;
    let header = header_plaintext.len() as u64 + AEAD_OVERHEAD;
    Ok(MAGIC_LEN + body + header + TRAILER_LEN)
}

/// Runs stages A-D and produces a plan; does not touch the backend except
/// to list and stat packs.
pub fn plan(
    cached_backend: &CachedBackend,
    index: &Index,
    used: &FxHashSet<ObjectId>,
    format_version: u32,
    opts: &PruneOptions,
) -> Result<PrunePlan> {
    let backend_packs: BTreeSet<ObjectId> = cached_backend
        .list_packs()?
        .iter()
        .map(backend::id_from_path)
        .collect::<Result<_>>()?;

    let used_occurrences = resolve_used_occurrences(index, used);

    let mut remove_packs_first = Vec::new();
    let mut ignore_packs = Vec::new();
    let mut needed_but_missing = Vec::new();
    let mut candidates = Vec::new();
    let mut keep = Vec::new();
    let mut remove = Vec::new();
    let mut total_repo_bytes: u64 = 0;

    for (pack_id, manifest) in &index.packs {
        if !backend_packs.contains(pack_id) {
            let has_used_occurrence = manifest
                .iter()
                .any(|e| used_occurrences.contains(&(*pack_id, e.id)));
            if has_used_occurrence {
                needed_but_missing.push(*pack_id);
            } else {
                ignore_packs.push(*pack_id);
            }
            continue;
        }

        let stored = cached_backend.stat_pack(pack_id)?;
        let predicted = predicted_pack_size(manifest)?;
        if stored != predicted {
            bail!(VaultError::SizeNotMatching { pack_id: *pack_id });
        }
        total_repo_bytes += stored;

        let acc = classify_pack(manifest, &used_occurrences, pack_id);
        match pack_fate(&acc, format_version, opts) {
            PackFate::Remove => remove.push(*pack_id),
            PackFate::Keep => keep.push(*pack_id),
            PackFate::RepackCandidate => candidates.push((*pack_id, acc)),
        }
    }

    if !needed_but_missing.is_empty() {
        bail!(VaultError::PacksMissing(needed_but_missing));
    }

    for pack_id in &backend_packs {
        if !index.packs.contains_key(pack_id) {
            remove_packs_first.push(*pack_id);
        }
    }

    let selected = select_repack_candidates(candidates.clone(), format_version, opts, total_repo_bytes);
    let selected_set: FxHashSet<ObjectId> = selected.iter().copied().collect();

    let mut keep_blobs = FxHashSet::default();
    for (pack_id, _acc) in &candidates {
        if !selected_set.contains(pack_id) {
            continue;
        }
        for entry in &index.packs[pack_id] {
            if used_occurrences.contains(&(*pack_id, entry.id)) {
                keep_blobs.insert(entry.id);
            }
        }
    }

    let mut remove_packs = remove;
    remove_packs.extend(selected.iter().copied());

    let stats = PruneStats {
        packs_kept: keep.len(),
        packs_removed: remove_packs.len(),
        packs_repacked: selected.len(),
        orphan_packs_removed: remove_packs_first.len(),
        bytes_reclaimed: candidates
            .iter()
            .filter(|(id, _)| selected_set.contains(id))
            .map(|(_, acc)| acc.unused_bytes)
            .sum::<u64>()
            + remove_packs
                .iter()
                .filter(|id| !selected_set.contains(id))
                .filter_map(|id| index.packs.get(id))
                .flat_map(|m| m.iter())
                .map(|e| e.length as u64)
                .sum::<u64>(),
    };

    Ok(PrunePlan {
        remove_packs_first,
        repack_packs: selected,
        remove_packs,
        keep_blobs,
        ignore_packs,
        stats,
    })
}

/// Reads every `keep_blobs` entry out of `repack_packs` and feeds it
/// through a fresh [`backup::Backup`] session so it lands in new packs
/// indexed the normal way.
async fn repack_kept_blobs(
    cached_backend: Arc<CachedBackend>,
    master: Arc<MasterKey>,
    format_version: u32,
    index: &Index,
    plan: &PrunePlan,
) -> Result<()> {
    if plan.repack_packs.is_empty() {
        return Ok(());
    }

    let backup = backup::spawn_backup_tasks(
        cached_backend.clone(),
        master.clone(),
        format_version,
        Index::default(),
    );

    let read_backend = cached_backend.clone();
    let read_master = master.clone();
    let pack_ids = plan.repack_packs.clone();
    let keep_blobs = plan.keep_blobs.clone();
    let manifests: Vec<(ObjectId, pack::PackManifest)> = pack_ids
        .iter()
        .map(|id| (*id, index.packs[id].clone()))
        .collect();

    let chunk_tx = backup.chunk_tx.clone();
    let tree_tx = backup.tree_tx.clone();
    let read_task = tokio::task::spawn_blocking(move || -> Result<usize> {
        let mut blob_map: FxHashMap<ObjectId, ObjectId> = FxHashMap::default();
        for (pack_id, manifest) in &manifests {
            for entry in manifest {
                if keep_blobs.contains(&entry.id) {
                    blob_map.insert(entry.id, *pack_id);
                }
            }
        }
        let mut reader = read::BlobReader::new(&read_backend, &read_master, &blob_map);

        let mut repacked = 0;
        for (pack_id, manifest) in &manifests {
            for entry in manifest {
                if !keep_blobs.contains(&entry.id) {
                    continue;
                }
                let contents = reader.read_blob(&entry.id).with_context(|| {
                    format!("Couldn't re-read blob {} from pack {pack_id} for repack", entry.id)
                })?;
                let sent = crate::blob::Blob {
                    contents: crate::blob::Contents::Buffer(contents),
                    id: entry.id,
                    kind: entry.blob_type,
                };
                match entry.blob_type {
                    blob::Type::Data => chunk_tx.send(sent)?,
                    blob::Type::Tree => tree_tx.send(sent)?,
                }
                repacked += 1;
            }
        }
        Ok(repacked)
    });

    let repacked = read_task.await.context("Repack reader task panicked")??;
    backup.join().await.context("Repacking into new packs failed")?;

    anyhow::ensure!(
        repacked == plan.keep_blobs.len(),
        "Repack lost blobs: expected to carry over {}, actually read {}",
        plan.keep_blobs.len(),
        repacked
    );
    Ok(())
}

/// Stage executor (non-dry-run ordering, §4.7):
/// 1. Delete orphan packs.
/// 2. Repack selected candidates into fresh packs.
/// 3. Rebuild the index, marking old indexes and now-obsolete packs as superseded.
/// 4. Delete the packs that repacking (or plain unused-ness) made obsolete.
pub async fn execute(
    cached_backend: Arc<CachedBackend>,
    master: Arc<MasterKey>,
    index: &Index,
    plan: &PrunePlan,
    format_version: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    for id in &plan.remove_packs_first {
        cancel.check()?;
        info!("Removing orphan pack {id}");
        cached_backend.remove_pack(id)?;
    }

    let unsafe_recovery = plan.repack_packs.is_empty() && !plan.remove_packs.is_empty();
    let _ = unsafe_recovery; // Same rebuild/delete ordering serves both paths here.

    cancel.check()?;
    repack_kept_blobs(cached_backend.clone(), master.clone(), format_version, index, plan).await?;

    let obsolete: FxHashSet<ObjectId> = plan
        .ignore_packs
        .iter()
        .chain(plan.remove_packs.iter())
        .copied()
        .collect();
    cancel.check()?;
    rebuild_index(&cached_backend, master.clone(), index, &obsolete).await?;

    cancel.check()?;
    for id in &plan.remove_packs {
        info!("Removing superseded pack {id}");
        cached_backend.remove_pack(id)?;
    }

    Ok(())
}

/// Writes a fresh index containing every pack *not* in `obsolete` (kept
/// packs plus any freshly-repacked or salvaged ones, discovered by
/// re-listing the backend), superseding every index file that currently
/// exists. Shared by prune's executor and [`crate::repair`].
pub(crate) async fn rebuild_index(
    cached_backend: &Arc<CachedBackend>,
    master: Arc<MasterKey>,
    index: &Index,
    obsolete: &FxHashSet<ObjectId>,
) -> Result<()> {
    let old_index_ids: BTreeSet<ObjectId> = cached_backend
        .list_indexes()?
        .iter()
        .map(backend::id_from_path)
        .collect::<Result<_>>()?;

    let starting_index = Index {
        supersedes: old_index_ids,
        packs: index::PackMap::new(),
    };

    let (pack_tx, pack_rx) = tokio::sync::mpsc::unbounded_channel();
    let (upload_tx, upload_rx) = tokio::sync::mpsc::channel(1);

    for (pack_id, manifest) in &index.packs {
        if obsolete.contains(pack_id) {
            continue;
        }
        pack_tx.send(pack::PackMetadata {
            id: *pack_id,
            manifest: manifest.clone(),
        })?;
    }
    // Packs created by this run (repacked or salvaged) aren't in the old
    // `index` yet; pick them up straight from the backend.
    for name in cached_backend.list_packs()? {
        let pack_id = backend::id_from_path(&name)?;
        if index.packs.contains_key(&pack_id) || obsolete.contains(&pack_id) {
            continue;
        }
        let manifest = pack::load_manifest(&pack_id, cached_backend, &master)?;
        pack_tx.send(pack::PackMetadata {
            id: pack_id,
            manifest,
        })?;
    }
    drop(pack_tx);

    let upload_backend = cached_backend.clone();
    let uploader = tokio::task::spawn_blocking(move || crate::upload::upload_indexes(&upload_backend, upload_rx));

    index::index(starting_index, master, pack_rx, upload_tx).await?;
    uploader.await.context("Index uploader task panicked")??;

    for old_id in &cached_backend
        .list_indexes()?
        .iter()
        .map(backend::id_from_path)
        .collect::<Result<BTreeSet<_>>>()?
    {
        cached_backend.remove_index(old_id).ok();
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pack::PackManifestEntry;

    fn entry(id: ObjectId, kind: blob::Type, length: u32, compressed: bool) -> PackManifestEntry {
        PackManifestEntry {
            blob_type: kind,
            offset: 0,
            length,
            uncompressed_length: if compressed { Some(length * 2) } else { None },
            id,
        }
    }

    #[test]
    fn max_unused_parses_percent_bytes_and_unlimited() {
        assert!(matches!(MaxUnused::parse("unlimited").unwrap(), MaxUnused::Unlimited));
        assert!(matches!(MaxUnused::parse("5%").unwrap(), MaxUnused::Percent(p) if p == 5.0));
        assert!(matches!(MaxUnused::parse("10MB").unwrap(), MaxUnused::Bytes(_)));
    }

    #[test]
    fn pack_with_no_used_blobs_is_removed() {
        let mut acc = PackAccounting::default();
        acc.unused_blobs = 2;
        acc.unused_bytes = 100;
        let opts = PruneOptions::default();
        assert_eq!(pack_fate(&acc, 2, &opts), PackFate::Remove);
    }

    #[test]
    fn fully_used_big_single_type_pack_is_kept() {
        let acc = PackAccounting {
            used_blobs: 1,
            unused_blobs: 0,
            used_bytes: MIN_KEEP_SIZE + 1,
            unused_bytes: 0,
            has_data: true,
            has_tree: false,
            any_uncompressed: false,
        };
        let opts = PruneOptions::default();
        assert_eq!(pack_fate(&acc, 2, &opts), PackFate::Keep);
    }

    #[test]
    fn mixed_type_pack_is_always_a_repack_candidate() {
        let acc = PackAccounting {
            used_blobs: 1,
            unused_blobs: 0,
            used_bytes: MIN_KEEP_SIZE + 1,
            unused_bytes: 0,
            has_data: true,
            has_tree: true,
            any_uncompressed: false,
        };
        let opts = PruneOptions::default();
        assert_eq!(pack_fate(&acc, 2, &opts), PackFate::RepackCandidate);
    }

    #[test]
    fn uncompressed_tree_pack_must_be_repacked_in_v2() {
        let acc = PackAccounting {
            used_blobs: 1,
            unused_blobs: 0,
            used_bytes: MIN_KEEP_SIZE + 1,
            unused_bytes: 0,
            has_data: false,
            has_tree: true,
            any_uncompressed: true,
        };
        let opts = PruneOptions::default();
        assert_eq!(pack_fate(&acc, 2, &opts), PackFate::RepackCandidate);
        assert_eq!(pack_fate(&acc, 1, &opts), PackFate::Keep);
    }

    #[test]
    fn duplicate_blob_promotes_the_pack_sharing_other_used_content() {
        let blob_a = ObjectId::hash(b"a"); // unique, lives in pack 1
        let blob_b = ObjectId::hash(b"b"); // duplicated across packs 1 and 2

        let pack1 = ObjectId::hash(b"pack1");
        let pack2 = ObjectId::hash(b"pack2");

        let mut packs = index::PackMap::new();
        packs.insert(
            pack1,
            vec![
                entry(blob_a, blob::Type::Data, 10, false),
                entry(blob_b, blob::Type::Data, 10, false),
            ],
        );
        packs.insert(pack2, vec![entry(blob_b, blob::Type::Data, 10, false)]);

        let index = Index {
            supersedes: BTreeSet::new(),
            packs,
        };
        let used: FxHashSet<ObjectId> = [blob_a, blob_b].into_iter().collect();

        let resolved = resolve_used_occurrences(&index, &used);
        // blob_b's used occurrence should land in pack1, since pack1 already
        // holds the other used blob.
        assert!(resolved.contains(&(pack1, blob_b)));
        assert!(!resolved.contains(&(pack2, blob_b)));
        assert!(resolved.contains(&(pack1, blob_a)));
    }

    #[test]
    fn duplicate_blob_falls_back_to_lexicographically_smallest_pack() {
        let blob_x = ObjectId::hash(b"x");
        let (pack_lo, pack_hi) = {
            let a = ObjectId::hash(b"AAAA");
            let b = ObjectId::hash(b"ZZZZ");
            if a < b { (a, b) } else { (b, a) }
        };

        let mut packs = index::PackMap::new();
        packs.insert(pack_lo, vec![entry(blob_x, blob::Type::Data, 10, false)]);
        packs.insert(pack_hi, vec![entry(blob_x, blob::Type::Data, 10, false)]);

        let index = Index {
            supersedes: BTreeSet::new(),
            packs,
        };
        let used: FxHashSet<ObjectId> = [blob_x].into_iter().collect();

        let resolved = resolve_used_occurrences(&index, &used);
        assert!(resolved.contains(&(pack_lo, blob_x)));
        assert!(!resolved.contains(&(pack_hi, blob_x)));
    }
}
