//! Build, read, and write [indexes](Index) of packs' contents.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::prelude::*;
use std::sync::Mutex;

use anyhow::{Context, Result, bail, ensure};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_derive::*;
use tempfile::NamedTempFile;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tracing::*;

use crate::backend;
use crate::counters;
use crate::crypto::MasterKey;
use crate::file_util::check_magic;
use crate::hashing::ObjectId;
use crate::pack::{PackManifest, PackMetadata};

const MAGIC_BYTES: &[u8] = b"VAULTIDX";

// Persist WIP (but valid) indexes to a known name so that an interrupted
// backup can read it in and know what we've already backed up.
const WIP_NAME: &str = "vaultpak-wip.index";

pub type PackMap = BTreeMap<ObjectId, PackManifest>;

/// Maps packs to the blobs they contain,
/// and lists any previous indexes they supersede.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub supersedes: BTreeSet<ObjectId>,
    pub packs: PackMap,
}

impl Index {
    #[inline]
    fn is_empty(&self) -> bool {
        self.supersedes.is_empty() && self.packs.is_empty()
    }
}

/// Gather metadata for completed packs from `rx` into an index file,
/// and upload the index files when they reach a sufficient size.
pub async fn index(
    starting_index: Index,
    master: std::sync::Arc<MasterKey>,
    mut rx: UnboundedReceiver<PackMetadata>,
    to_upload: Sender<(String, File)>,
) -> Result<bool> {
    let mut index = starting_index;
    let mut index_id = None;
    let mut persisted = None;

    // If we're given a non-empty index, write that out to start with.
    // (For example, it could be an index from `prune` that omits packs
    // we no longer need. If we don't write it but delete those packs anyways...)
    if !index.is_empty() {
        let (id, temp_file) = to_temp_file(&index, &master)?;
        index_id = Some(id);

        persisted = Some(
            temp_file
                .persist(WIP_NAME)
                .with_context(|| format!("Couldn't persist WIP index to {WIP_NAME}"))?,
        );
    }

    // For each pack...
    while let Some(PackMetadata { id, manifest }) = rx.recv().await {
        ensure!(
            index.packs.insert(id, manifest).is_none(),
            "Duplicate pack received: {id}"
        );

        trace!("Wrote {} packs into index", index.packs.len());

        // Rewrite the index every time we get a pack.
        // That way the temp index should always contain a complete list of packs,
        // allowing us to resume a backup from the last finished pack.
        let (id, temp_file) = to_temp_file(&index, &master)?;
        index_id = Some(id);

        persisted = Some(
            temp_file
                .persist(WIP_NAME)
                .with_context(|| format!("Couldn't persist WIP index to {WIP_NAME}"))?,
        );
    }

    if let Some(mut persisted) = persisted {
        let index_id = index_id.unwrap();
        let index_name = format!("{index_id}.index");

        // On Windows, we can't move an open file. Boo, Windows.
        if cfg!(target_family = "windows") {
            persisted
                .sync_all()
                .with_context(|| format!("Couldn't close {WIP_NAME} to rename it"))?;
            drop(persisted);
            fs::rename(WIP_NAME, &index_name)
                .with_context(|| format!("Couldn't rename {WIP_NAME} to {index_name}"))?;
            persisted =
                File::open(&index_name).with_context(|| format!("Couldn't reopen {index_name}"))?;
        } else {
            fs::rename(WIP_NAME, &index_name)
                .with_context(|| format!("Couldn't rename {WIP_NAME} to {index_name}"))?;
        }
        debug!(
            "Index {} finished ({} bytes)",
            index_id,
            persisted.metadata()?.len()
        );

        to_upload
            .send((index_name, persisted))
            .await
            .context("indexer -> uploader channel exited early")?;
        Ok(true)
    } else {
        debug!("No new indexes created - nothing changed");
        Ok(false)
    }
}

fn to_temp_file(index: &Index, master: &MasterKey) -> Result<(ObjectId, NamedTempFile)> {
    let mut fh = tempfile::Builder::new()
        .prefix("temp-vaultpak-")
        .suffix(".index")
        .tempfile()
        .context("Couldn't open temporary index for writing")?;

    let id = to_file(fh.as_file_mut(), index, master)?;
    Ok((id, fh))
}

/// Writes a sealed index to `fh`: `MAGIC || nonce || ciphertext || tag`.
/// The index's ID is the hash of its plaintext CBOR, so it's stable
/// regardless of the (randomized) nonce chosen when sealing it.
fn to_file(fh: &mut File, index: &Index, master: &MasterKey) -> Result<ObjectId> {
    fh.write_all(MAGIC_BYTES)?;

    let mut plaintext = Vec::new();
    ciborium::ser::into_writer(index, &mut plaintext)?;
    let id = ObjectId::hash(&plaintext);

    let sealed = master.seal(&plaintext);
    fh.write_all(&sealed)?;
    fh.sync_all()?;

    Ok(id)
}

/// Load all indexes from the provided backend and combine them into a master
/// index, removing any superseded ones.
pub fn build_master_index(
    cached_backend: &backend::CachedBackend,
    master: &MasterKey,
) -> Result<Index> {
    info!("Building a master index");

    #[derive(Debug, Default)]
    struct Results {
        bad_indexes: BTreeSet<ObjectId>,
        superseded_indexes: BTreeSet<ObjectId>,
        loaded_indexes: BTreeMap<ObjectId, PackMap>,
    }

    let shared = Mutex::new(Results::default());

    cached_backend
        .list_indexes()?
        .par_iter()
        .try_for_each_with(&shared, |shared, index_file| {
            let index_id = backend::id_from_path(index_file)?;
            let mut loaded_index = match load(&index_id, cached_backend, master) {
                Ok(l) => l,
                Err(e) => {
                    error!("{e:?}");
                    shared.lock().unwrap().bad_indexes.insert(index_id);
                    return Ok(());
                }
            };
            let mut guard = shared.lock().unwrap();
            guard
                .superseded_indexes
                .append(&mut loaded_index.supersedes);
            ensure!(
                guard
                    .loaded_indexes
                    .insert(index_id, loaded_index.packs)
                    .is_none(),
                "Duplicate index {index_file} read from backend!"
            );
            Ok(())
        })?;

    let mut shared = shared.into_inner().unwrap();

    if !shared.bad_indexes.is_empty() {
        bail!(
            "Errors loading indexes {:?}. Consider running vaultpak rebuild-index.",
            shared.bad_indexes
        );
    }

    // Strip out superseded indexes.
    for superseded in &shared.superseded_indexes {
        if shared.loaded_indexes.remove(superseded).is_some() {
            debug!("Index {superseded} is superseded and can be deleted.");
        }
    }

    let mut master_pack_map = BTreeMap::new();
    for index in shared.loaded_indexes.values_mut() {
        master_pack_map.append(index);
    }

    Ok(Index {
        supersedes: shared.superseded_indexes,
        packs: master_pack_map,
    })
}

pub type BlobMap = FxHashMap<ObjectId, ObjectId>;

/// Given an index, produce a mapping that relates blobs -> their packs.
pub fn blob_to_pack_map(index: &Index) -> Result<BlobMap> {
    debug!("Building a blob -> pack map");
    let mut mapping = FxHashMap::default();

    for (pack_id, manifest) in &index.packs {
        for blob in manifest {
            if let Some(other_pack) = mapping.insert(blob.id, *pack_id) {
                bail!(
                    "Duplicate blob {} in pack {pack_id}, previously seen in pack {other_pack}",
                    blob.id
                );
            }
        }
    }

    Ok(mapping)
}

/// Gather the set of all blobs in a given index.
pub fn blob_set(index: &Index) -> Result<FxHashSet<ObjectId>> {
    debug!("Building a set of all blobs");
    let mut blobs = FxHashSet::default();

    for (pack_id, manifest) in &index.packs {
        for blob in manifest {
            if !blobs.insert(blob.id) {
                bail!("Duplicate blob {} in pack {pack_id}", blob.id);
            }
        }
    }

    Ok(blobs)
}

/// Load the index from the given reader, also returning its calculated ID.
fn from_reader<R: Read>(r: &mut R, master: &MasterKey) -> Result<(Index, ObjectId)> {
    check_magic(r, MAGIC_BYTES).context("Wrong magic bytes for index file")?;

    let mut sealed = Vec::new();
    r.read_to_end(&mut sealed)?;
    let plaintext = master.open(&sealed).context("Couldn't decrypt index")?;
    let id = ObjectId::hash(&plaintext);

    let index: Index = ciborium::de::from_reader(plaintext.as_slice())
        .context("CBOR decoding of index file failed")?;
    Ok((index, id))
}

/// Load the index with the given ID from the backend,
/// verifying its contents match its ID.
pub fn load(
    id: &ObjectId,
    cached_backend: &backend::CachedBackend,
    master: &MasterKey,
) -> Result<Index> {
    debug!("Loading index {id}");
    let (index, calculated_id) = from_reader(&mut cached_backend.read_index(id)?.as_slice(), master)
        .with_context(|| format!("Couldn't load index {id}"))?;
    ensure!(
        *id == calculated_id,
        "Index {id}'s contents changed! Now hashes to {calculated_id}"
    );
    counters::bump(counters::Op::IndexLoad);
    Ok(index)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::blob;
    use crate::pack::*;

    fn test_key() -> MasterKey {
        MasterKey::generate()
    }

    fn build_test_index() -> Index {
        let mut supersedes = BTreeSet::new();
        supersedes.insert(ObjectId::hash(b"Some previous index"));
        supersedes.insert(ObjectId::hash(b"Another previous index"));

        let mut packs = BTreeMap::new();
        packs.insert(
            ObjectId::hash(b"pack o' chunks"),
            vec![
                PackManifestEntry {
                    blob_type: blob::Type::Data,
                    offset: 8,
                    length: 42,
                    uncompressed_length: None,
                    id: ObjectId::hash(b"a chunk"),
                },
                PackManifestEntry {
                    blob_type: blob::Type::Data,
                    offset: 50,
                    length: 9001,
                    uncompressed_length: Some(9500),
                    id: ObjectId::hash(b"another chunk"),
                },
            ],
        );
        packs.insert(
            ObjectId::hash(b"pack o'trees"),
            vec![
                PackManifestEntry {
                    blob_type: blob::Type::Tree,
                    offset: 8,
                    length: 182,
                    uncompressed_length: None,
                    id: ObjectId::hash(b"first tree"),
                },
                PackManifestEntry {
                    blob_type: blob::Type::Tree,
                    offset: 190,
                    length: 22,
                    uncompressed_length: None,
                    id: ObjectId::hash(b"second tree"),
                },
            ],
        );
        Index { supersedes, packs }
    }

    #[test]
    fn blob_map_and_set_reject_duplicates() -> Result<()> {
        let index = build_test_index();
        let map = blob_to_pack_map(&index)?;
        assert_eq!(map.len(), 4);
        let set = blob_set(&index)?;
        assert_eq!(set.len(), 4);
        Ok(())
    }

    #[test]
    fn round_trip() -> Result<()> {
        let master = test_key();
        let index = build_test_index();

        let mut fh = tempfile::tempfile()?;
        let written_id = to_file(&mut fh, &index, &master)?;

        fh.seek(std::io::SeekFrom::Start(0))?;
        let (read_index, read_id) = from_reader(&mut fh, &master)?;

        assert_eq!(index, read_index);
        assert_eq!(written_id, read_id);
        Ok(())
    }

    #[test]
    fn wrong_key_fails_to_decrypt() -> Result<()> {
        let master = test_key();
        let other = test_key();
        let index = build_test_index();

        let mut fh = tempfile::tempfile()?;
        to_file(&mut fh, &index, &master)?;

        fh.seek(std::io::SeekFrom::Start(0))?;
        assert!(from_reader(&mut fh, &other).is_err());
        Ok(())
    }
}
