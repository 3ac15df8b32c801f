//! Integrity checker: cross-references the index against the backend and,
//! optionally, re-reads and MAC-verifies pack contents.

use std::collections::BTreeSet;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use tracing::*;

use crate::backend::{self, CachedBackend};
use crate::cancel::CancellationToken;
use crate::crypto::MasterKey;
use crate::error::VaultError;
use crate::hashing::ObjectId;
use crate::index::{self, Index};
use crate::pack;
use crate::snapshot;
use crate::tree;

/// How much pack data to actually re-read and MAC-verify, beyond the cheap
/// index/size cross-checks that always run.
#[derive(Debug, Clone, Copy, Default)]
pub enum DataCheck {
    /// Only cross-check index/backend consistency and stored sizes.
    #[default]
    None,
    /// Re-read and verify every pack.
    All,
    /// Re-read and verify a deterministic or randomized subset of packs.
    Subset(Subset),
}

#[derive(Debug, Clone, Copy)]
pub enum Subset {
    /// `n/m`: select packs whose `pack_id`'s first byte, taken mod `m`,
    /// equals `n - 1`.
    Fraction { n: u8, m: u8 },
    /// Roughly `percent`% of packs, chosen by count.
    Percent(f64),
    /// Roughly `bytes` worth of pack data, randomized by approximate pack count.
    Bytes(u64),
}

const MAX_BUCKET_MODULUS: u32 = 256;

impl Subset {
    /// Parses the `--read-data-subset` argument: `n/m`, `x%`, or a byte size
    /// (`"500M"`, `"2G"`, etc, via [`byte_unit`]).
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(pct) = s.strip_suffix('%') {
            let percent: f64 = pct.parse().context("Invalid percentage")?;
            return Ok(Subset::Percent(percent));
        }
        if let Some((n, m)) = s.split_once('/') {
            let n: u32 = n.parse().context("Invalid subset numerator")?;
            let m: u32 = m.parse().context("Invalid subset denominator")?;
            anyhow::ensure!(
                m >= 1 && m <= MAX_BUCKET_MODULUS,
                "Subset denominator must be 1..=256"
            );
            anyhow::ensure!(n >= 1 && n <= m, "Subset numerator must be 1..=denominator");
            return Ok(Subset::Fraction {
                n: n as u8,
                m: m as u8,
            });
        }
        let bytes = byte_unit::Byte::parse_str(s, true)
            .context("Invalid byte size")?
            .as_u64();
        Ok(Subset::Bytes(bytes))
    }

    fn selects(&self, pack_id: &ObjectId, pack_count: usize, index_in_order: usize, total_bytes: u64) -> bool {
        match *self {
            Subset::Fraction { n, m } => {
                let bucket = pack_id.as_bytes()[0] % m;
                bucket == n - 1
            }
            Subset::Percent(percent) => {
                // "Randomized by count": spread selections evenly rather
                // than reaching for an RNG, so repeated runs against the
                // same index pick the same packs.
                if pack_count == 0 {
                    return false;
                }
                let wanted = (((pack_count as f64) * (percent / 100.0)).round() as usize)
                    .max(if percent > 0.0 { 1 } else { 0 });
                let stride = (pack_count / wanted.max(1)).max(1);
                index_in_order % stride == 0
            }
            Subset::Bytes(bytes) => {
                if total_bytes == 0 {
                    return false;
                }
                let fraction = (bytes as f64 / total_bytes as f64).clamp(0.0, 1.0);
                let wanted = ((pack_count as f64) * fraction).round().max(1.0) as usize;
                let stride = (pack_count / wanted.max(1)).max(1);
                index_in_order % stride == 0
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct CheckReport {
    /// Packs named by the index but absent from the backend and empty;
    /// tolerated, but noted. A missing pack that still contains a needed
    /// blob fails earlier as [`VaultError::PacksMissing`].
    pub missing_ignorable_packs: Vec<ObjectId>,
    /// Packs present on the backend but not named by any index; informative only.
    pub orphaned_packs: Vec<ObjectId>,
    /// Packs whose stored size didn't match what the index implies.
    pub size_mismatches: Vec<ObjectId>,
    /// Packs that failed MAC verification when their data was read.
    pub corrupt_packs: Vec<(ObjectId, anyhow::Error)>,
    /// Blobs in the index that no snapshot's tree references; informative only.
    pub unused_blobs: BTreeSet<ObjectId>,
    pub packs_checked: usize,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.size_mismatches.is_empty() && self.corrupt_packs.is_empty()
    }
}

/// Runs the full integrity check against the repository.
pub fn check(
    cached_backend: &CachedBackend,
    master: &MasterKey,
    data_check: DataCheck,
    cancel: &CancellationToken,
) -> Result<CheckReport> {
    cancel.check()?;
    let index = index::build_master_index(cached_backend, master)?;

    let mut report = cross_check_packs(cached_backend, &index)?;
    cancel.check()?;

    report.unused_blobs = find_unused_blobs(cached_backend, master, &index, cancel)?;

    let to_verify = select_packs_for_verification(&index, data_check);
    report.packs_checked = to_verify.len();

    cancel.check()?;
    let errors = Mutex::new(Vec::new());
    to_verify.par_iter().for_each(|(pack_id, manifest)| {
        if cancel.is_cancelled() {
            return;
        }
        debug!("Verifying pack {pack_id}");
        if let Err(e) = pack::verify(pack_id, manifest, cached_backend, master) {
            errors.lock().unwrap().push((*pack_id, e));
        }
    });
    cancel.check()?;
    report.corrupt_packs = errors.into_inner().unwrap();

    if !report.is_ok() {
        error!(
            "{} size mismatch(es), {} corrupt pack(s)",
            report.size_mismatches.len(),
            report.corrupt_packs.len()
        );
    }
    if !report.unused_blobs.is_empty() {
        info!(
            "{} unused blob(s) - informative only",
            report.unused_blobs.len()
        );
    }

    Ok(report)
}

fn cross_check_packs(cached_backend: &CachedBackend, index: &Index) -> Result<CheckReport> {
    let mut report = CheckReport::default();

    let backend_packs: BTreeSet<ObjectId> = cached_backend
        .list_packs()?
        .iter()
        .map(backend::id_from_path)
        .collect::<Result<_>>()?;

    let mut needed_but_missing = Vec::new();
    for (pack_id, manifest) in &index.packs {
        if !backend_packs.contains(pack_id) {
            if manifest.is_empty() {
                report.missing_ignorable_packs.push(*pack_id);
            } else {
                needed_but_missing.push(*pack_id);
            }
            continue;
        }

        let stored = cached_backend.stat_pack(pack_id)?;
        let predicted = predicted_pack_size(manifest)?;
        if stored != predicted {
            report.size_mismatches.push(*pack_id);
        }
    }

    if !needed_but_missing.is_empty() {
        bail!(VaultError::PacksMissing(needed_but_missing));
    }

    report.orphaned_packs = backend_packs
        .into_iter()
        .filter(|id| !index.packs.contains_key(id))
        .collect();

    Ok(report)
}

/// Predicts a pack's on-disk size from its manifest, per the format
/// documented in [`pack`]: `magic || body || enc(header) || trailer`.
fn predicted_pack_size(manifest: &[pack::PackManifestEntry]) -> Result<u64> {
    const MAGIC_LEN: u64 = 8;
    const TRAILER_LEN: u64 = 4;
    const AEAD_OVERHEAD: u64 = 12 + 16; // nonce + tag

    let body: u64 = manifest.iter().map(|e| e.length as u64).sum();

    let mut header_plaintext = Vec::new();
    ciborium::ser::into_writer(manifest, &mut header_plaintext)
        .context("Couldn't compute predicted header size")?;
    let header = header_plaintext.len() as u64 + AEAD_OVERHEAD;

    Ok(MAGIC_LEN + body + header + TRAILER_LEN)
}

fn select_packs_for_verification(
    index: &Index,
    data_check: DataCheck,
) -> Vec<(ObjectId, pack::PackManifest)> {
    match data_check {
        DataCheck::None => Vec::new(),
        DataCheck::All => index
            .packs
            .iter()
            .map(|(id, manifest)| (*id, manifest.clone()))
            .collect(),
        DataCheck::Subset(subset) => {
            let pack_count = index.packs.len();
            let total_bytes: u64 = index
                .packs
                .values()
                .flat_map(|m| m.iter())
                .map(|e| e.length as u64)
                .sum();
            index
                .packs
                .iter()
                .enumerate()
                .filter(|(i, (id, _))| subset.selects(id, pack_count, *i, total_bytes))
                .map(|(_, (id, manifest))| (*id, manifest.clone()))
                .collect()
        }
    }
}

/// Walks every snapshot's tree forest to find which blobs are actually
/// referenced, so `report.unused_blobs` can flag the rest.
fn find_unused_blobs(
    cached_backend: &CachedBackend,
    master: &MasterKey,
    index: &Index,
    cancel: &CancellationToken,
) -> Result<BTreeSet<ObjectId>> {
    let blob_map = index::blob_to_pack_map(index)?;
    let all_blobs = index::blob_set(index)?;

    let mut cache = tree::Cache::new(index, &blob_map, cached_backend, master);
    let mut used = BTreeSet::new();

    for (snap, _id) in snapshot::load_chronologically(cached_backend, master)? {
        cancel.check()?;
        let forest = tree::forest_from_root(&snap.tree, &mut cache)?;
        used.extend(forest.keys().copied());
        used.extend(tree::chunks_in_forest(&forest).into_iter().copied());
    }

    Ok(all_blobs.into_iter().filter(|b| !used.contains(b)).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fraction_subset_respects_bucket_modulus() {
        assert!(Subset::parse("1/4").is_ok());
        assert!(Subset::parse("0/4").is_err());
        assert!(Subset::parse("1/0").is_err());
        assert!(Subset::parse("1/257").is_err());
    }

    #[test]
    fn percent_subset_parses() {
        match Subset::parse("25%").unwrap() {
            Subset::Percent(p) => assert_eq!(p, 25.0),
            _ => panic!("expected a percentage"),
        }
    }

    #[test]
    fn byte_subset_parses() {
        match Subset::parse("10MB").unwrap() {
            Subset::Bytes(b) => assert_eq!(b, 10_000_000),
            _ => panic!("expected a byte size"),
        }
    }

    #[test]
    fn fraction_selection_is_deterministic_on_pack_id() {
        let id_a = ObjectId::hash(b"a");
        let selects_0 = Subset::Fraction { n: 1, m: 4 }.selects(&id_a, 100, 0, 0);
        let selects_1 = Subset::Fraction { n: 1, m: 4 }.selects(&id_a, 100, 0, 0);
        assert_eq!(selects_0, selects_1);
    }
}
