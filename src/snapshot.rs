//! Build, read, and write snapshots of the filesystem to create our backups.

use std::collections::BTreeSet;
use std::fs;
use std::io::prelude::*;

use anyhow::{Context, Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use jiff::Timestamp;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::backend;
use crate::crypto::MasterKey;
use crate::file_util::check_magic;
use crate::hashing::ObjectId;

/// Statistics gathered while walking the source tree for a backup.
/// Entirely optional - omitted for snapshots we can't or don't want to
/// tally (e.g. ones produced by `copy`).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub dirs_new: u64,
    pub dirs_changed: u64,
    pub dirs_unmodified: u64,
    pub data_blobs_written: u64,
    pub tree_blobs_written: u64,
    pub data_bytes_written: u64,
    pub total_bytes_processed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(with = "crate::prettify::date_time")]
    pub time: Timestamp,
    pub tree: ObjectId,
    pub paths: BTreeSet<Utf8PathBuf>,
    pub hostname: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub excludes: Vec<String>,
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<ObjectId>,
    /// Preserves identity across tag/description edits: editing a snapshot
    /// produces a new one whose `original` points back to the first ancestor
    /// that was actually backed up (not just edited).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<Summary>,
}

const MAGIC_BYTES: &[u8] = b"VAULTSNP";

fn to_file(fh: &mut fs::File, snapshot: &Snapshot, master: &MasterKey) -> Result<ObjectId> {
    fh.write_all(MAGIC_BYTES)?;

    let mut plaintext = Vec::new();
    ciborium::ser::into_writer(snapshot, &mut plaintext)?;
    let id = ObjectId::hash(&plaintext);

    let sealed = master.seal(&plaintext);
    fh.write_all(&sealed)?;
    fh.sync_all()?;

    Ok(id)
}

/// Upload a snapshot, finishing a backup.
pub fn upload(snapshot: &Snapshot, backend: &backend::CachedBackend, master: &MasterKey) -> Result<ObjectId> {
    let mut fh = tempfile::Builder::new()
        .prefix("temp-vaultpak-")
        .suffix(".snapshot")
        .tempfile()
        .context("Couldn't open temporary snapshot for writing")?;

    let id = to_file(fh.as_file_mut(), snapshot, master).context("Couldn't save snapshot")?;

    let mut bytes = Vec::new();
    fh.seek(std::io::SeekFrom::Start(0))?;
    fh.read_to_end(&mut bytes)?;

    backend.write_snapshot(&id, &bytes)?;
    Ok(id)
}

/// Loads the snapshot from the given reader, also returning its calculated ID.
fn from_reader<R: Read>(r: &mut R, master: &MasterKey) -> Result<(Snapshot, ObjectId)> {
    check_magic(r, MAGIC_BYTES).context("Wrong magic bytes for snapshot file")?;

    let mut sealed = Vec::new();
    r.read_to_end(&mut sealed)?;
    let plaintext = master.open(&sealed).context("Couldn't decrypt snapshot")?;
    let id = ObjectId::hash(&plaintext);

    let snapshot: Snapshot = ciborium::de::from_reader(plaintext.as_slice())
        .context("CBOR decoding of snapshot file failed")?;
    Ok((snapshot, id))
}

pub fn find_and_load(
    id_prefix: &str,
    cached_backend: &backend::CachedBackend,
    master: &MasterKey,
) -> Result<(Snapshot, ObjectId)> {
    let id = find(id_prefix, cached_backend, master)?;
    Ok((load(&id, cached_backend, master)?, id))
}

/// Loads the snapshot with the given ID from the backend,
/// verifying its contents match its ID.
pub fn load(id: &ObjectId, cached_backend: &backend::CachedBackend, master: &MasterKey) -> Result<Snapshot> {
    debug!("Loading snapshot {id}");
    let (snapshot, calculated_id) =
        from_reader(&mut cached_backend.read_snapshot(id)?.as_slice(), master)
            .with_context(|| format!("Couldn't load snapshot {id}"))?;
    ensure!(
        *id == calculated_id,
        "Snapshot {id}'s contents changed! Now hashes to {calculated_id}"
    );
    Ok(snapshot)
}

/// Load all snapshots from the given backend and sort them by date taken.
pub fn load_chronologically(
    cached_backend: &backend::CachedBackend,
    master: &MasterKey,
) -> Result<Vec<(Snapshot, ObjectId)>> {
    debug!("Reading snapshots");
    let mut snapshots = cached_backend
        .list_snapshots()?
        .par_iter()
        .map(|file| {
            let snapshot_id = backend::id_from_path(file)?;
            let snap = load(&snapshot_id, cached_backend, master)?;
            Ok((snap, snapshot_id))
        })
        .collect::<Result<Vec<(Snapshot, ObjectId)>>>()?;
    snapshots.sort_by_key(|(snap, _)| snap.time);
    Ok(snapshots)
}

/// Resolves a snapshot ID prefix, or the special name `"latest"`, to a full ID.
pub fn find(prefix: &str, cached_backend: &backend::CachedBackend, master: &MasterKey) -> Result<ObjectId> {
    if prefix == "latest" {
        return load_chronologically(cached_backend, master)?
            .pop()
            .map(|(_snap, id)| id)
            .ok_or_else(|| anyhow::anyhow!("No snapshots taken yet"));
    }

    // Like Git, require at least a few digits of an ID.
    if prefix.len() < 4 {
        bail!("Provide a snapshot ID with at least 4 digits!");
    }

    let mut matches = cached_backend
        .list_snapshots()?
        .into_iter()
        .filter(|snap| Utf8Path::new(snap).file_stem().unwrap().starts_with(prefix))
        .collect::<Vec<_>>();

    match matches.len() {
        0 => bail!("No snapshots start with {prefix}"),
        1 => backend::id_from_path(matches.pop().unwrap()),
        multiple => bail!("{multiple} different snapshots start with {prefix}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_key() -> MasterKey {
        MasterKey::generate()
    }

    fn build_test_snapshot() -> Snapshot {
        Snapshot {
            time: "1969-07-20T20:17:40Z".parse().unwrap(),
            tree: ObjectId::hash(b"One small step"),
            paths: ["moon/orbit", "moon/tranquility-base"]
                .iter()
                .map(Utf8PathBuf::from)
                .collect::<BTreeSet<_>>(),
            hostname: "eagle".to_string(),
            username: "neil".to_string(),
            uid: 1,
            gid: 1,
            excludes: vec!["*.tmp".to_string()],
            tags: ["Apollo", "NASA"]
                .iter()
                .map(|s| String::from(*s))
                .collect::<BTreeSet<_>>(),
            parent: None,
            original: None,
            description: None,
            summary: Some(Summary::default()),
        }
    }

    #[test]
    fn round_trip() -> Result<()> {
        let master = test_key();
        let snapshot = build_test_snapshot();
        let mut fh = tempfile::tempfile()?;
        let written_id = to_file(&mut fh, &snapshot, &master)?;

        fh.seek(std::io::SeekFrom::Start(0))?;
        let (read_snapshot, read_id) = from_reader(&mut fh, &master)?;

        assert_eq!(snapshot, read_snapshot);
        assert_eq!(written_id, read_id);
        Ok(())
    }

    #[test]
    fn editing_a_snapshot_preserves_original() {
        let base = build_test_snapshot();
        let edited = Snapshot {
            description: Some("now with a description".to_string()),
            original: Some(ObjectId::hash(b"stand-in for base's real id")),
            ..base.clone()
        };
        assert_eq!(base.tree, edited.tree);
        assert_ne!(base.description, edited.description);
        assert!(edited.original.is_some());
    }
}
