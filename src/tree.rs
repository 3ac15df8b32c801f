//! Uniquely ID and store directories and their metadata.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, anyhow, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use jiff::Timestamp;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::backend;
use crate::counters;
use crate::hashing::ObjectId;
use crate::index;
use crate::pack;
use crate::prettify;

/// The contents of a directory entry.
///
/// Files carry an ordered list of data-blob IDs; a directory carries the ID
/// of its subtree; the rest just carry what's needed to recreate them.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum NodeContents {
    File {
        /// Logical (plaintext) size of the file.
        size: u64,
        /// Concatenating these blobs' plaintext reconstructs the file.
        content: Vec<ObjectId>,
        /// Hint for hardlink detection only - never trusted for anything else.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        inode: Option<u64>,
    },
    Dir {
        subtree: ObjectId,
    },
    Symlink {
        link_target: Utf8PathBuf,
    },
    Device {
        device_number: u64,
    },
    Fifo,
    Socket,
}

impl NodeContents {
    // Convenience methods for when we know the type already.

    #[inline]
    pub fn content(&self) -> &[ObjectId] {
        match self {
            NodeContents::File { content, .. } => content,
            _ => panic!("Expected a file"),
        }
    }

    #[inline]
    pub fn subtree(&self) -> &ObjectId {
        match self {
            NodeContents::Dir { subtree } => subtree,
            _ => panic!("Expected a directory"),
        }
    }

    #[inline]
    pub fn link_target(&self) -> &Utf8Path {
        match self {
            NodeContents::Symlink { link_target } => link_target,
            _ => panic!("Expected a symlink"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NodeType {
    File,
    Dir,
    Symlink,
    Device,
    Fifo,
    Socket,
}

/// Whether a backup follows symlinks or stores them as-is.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Symlink {
    Read,
    Dereference,
}

/// Metadata common to every node, taken from a `stat()`-like call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Resolved owner name, when available - best-effort, never load-bearing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub group: Option<String>,
    #[serde(with = "prettify::date_time")]
    pub access_time: Timestamp,
    #[serde(with = "prettify::date_time")]
    pub mod_time: Timestamp,
    #[serde(with = "prettify::date_time")]
    pub change_time: Timestamp,
    /// Extended attributes. We store and restore the bytes faithfully, but
    /// never depend on their meaning (xattr *restoration semantics* are
    /// someone else's problem).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

// Access time changes just by looking at a file - don't let it break
// equivalence between two stats of (logically) the same node.
impl PartialEq for Metadata {
    fn eq(&self, o: &Self) -> bool {
        self.mode == o.mode
            && self.uid == o.uid
            && self.gid == o.gid
            && self.mod_time == o.mod_time
            && self.xattrs == o.xattrs
    }
}

impl Eq for Metadata {}

#[cfg(unix)]
pub fn get_metadata(path: &Utf8Path) -> Result<Metadata> {
    get_metadata_at(path, false)
}

/// Like [`get_metadata`], but `follow_symlinks` chooses `stat()` over `lstat()`.
#[cfg(unix)]
pub fn get_metadata_at(path: &Utf8Path, follow_symlinks: bool) -> Result<Metadata> {
    use std::os::unix::fs::MetadataExt;

    let meta = if follow_symlinks {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    }
    .with_context(|| format!("Couldn't stat {path}"))?;

    Ok(Metadata {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        user: None,
        group: None,
        access_time: Timestamp::new(meta.atime(), meta.atime_nsec() as i32)
            .with_context(|| format!("Bad access time on {path}"))?,
        mod_time: Timestamp::new(meta.mtime(), meta.mtime_nsec() as i32)
            .with_context(|| format!("Bad modification time on {path}"))?,
        change_time: Timestamp::new(meta.ctime(), meta.ctime_nsec() as i32)
            .with_context(|| format!("Bad change time on {path}"))?,
        xattrs: BTreeMap::new(),
    })
}

#[cfg(windows)]
pub fn get_metadata(path: &Utf8Path) -> Result<Metadata> {
    get_metadata_at(path, false)
}

#[cfg(windows)]
pub fn get_metadata_at(path: &Utf8Path, follow_symlinks: bool) -> Result<Metadata> {
    use std::os::windows::fs::MetadataExt;

    let meta = if follow_symlinks {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    }
    .with_context(|| format!("Couldn't stat {path}"))?;

    let to_timestamp = |ticks: u64| -> Result<Timestamp> {
        // Windows returns 100ns intervals since 1601-01-01; jiff counts
        // nanoseconds since 1970-01-01.
        const TICKS_PER_SECOND: i64 = 1_000_000_000 / 100;
        const EPOCH_OFFSET_SECONDS: i64 = 11_644_473_600;

        let ticks = ticks as i64;
        let seconds = ticks / TICKS_PER_SECOND - EPOCH_OFFSET_SECONDS;
        let nanos = (ticks % TICKS_PER_SECOND) * 100;
        Ok(Timestamp::new(seconds, nanos as i32)?)
    };

    Ok(Metadata {
        mode: meta.file_attributes(),
        uid: 0,
        gid: 0,
        user: None,
        group: None,
        access_time: to_timestamp(meta.last_access_time())?,
        mod_time: to_timestamp(meta.last_write_time())?,
        change_time: to_timestamp(meta.creation_time())?,
        xattrs: BTreeMap::new(),
    })
}

/// A single file or directory and its metadata.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(flatten)]
    pub contents: NodeContents,
    pub metadata: Metadata,
}

impl Node {
    pub fn kind(&self) -> NodeType {
        match &self.contents {
            NodeContents::File { .. } => NodeType::File,
            NodeContents::Dir { .. } => NodeType::Dir,
            NodeContents::Symlink { .. } => NodeType::Symlink,
            NodeContents::Device { .. } => NodeType::Device,
            NodeContents::Fifo => NodeType::Fifo,
            NodeContents::Socket => NodeType::Socket,
        }
    }
}

/// A tree represents a single directory of files (with contents),
/// directories (with subtrees), and their metadata, addressed by entry name.
/// Entries sort lexicographically by name, which is part of the hash input.
pub type Tree = BTreeMap<Utf8PathBuf, Node>;

/// Serialize the tree into its on-disk CBOR representation and return its ID (hash).
pub fn serialize_and_hash(tree: &Tree) -> Result<(Vec<u8>, ObjectId)> {
    let mut tree_cbor = Vec::new();
    ciborium::ser::into_writer(tree, &mut tree_cbor)?;
    let id = ObjectId::hash(&tree_cbor);
    Ok((tree_cbor, id))
}

/// A collection of trees (which can reference each other as subtrees),
/// used to represent a directory hierarchy.
///
/// We use a FxHashMap because we never serialize a whole forest as a single object,
/// so we'll take constant-time lookup over deterministic order.
/// We use an `Arc<Tree>` so that a Forest can be used as a tree cache,
/// doling out references to its trees.
/// We use Arc and not Rc so that functions can operate in parallel on all
/// trees in the forest.
pub type Forest = FxHashMap<ObjectId, Arc<Tree>>;

/// The ID an empty directory tree always hashes to. Lets callers special-case
/// "nothing changed here" without serializing and packing an empty blob.
pub static EMPTY_ID: LazyLock<ObjectId> =
    LazyLock::new(|| serialize_and_hash(&Tree::default()).expect("can't fail").1);

/// A read-through cache of trees that extracts them from packs on-demand.
pub struct Cache<'a> {
    /// The master index, used to look up a pack's manifest from its ID.
    index: &'a index::Index,

    /// Finds the pack that contains a given blob.
    blob_to_pack_map: &'a index::BlobMap,

    /// Gets packs on-demand from the backend.
    pack_cache: &'a backend::CachedBackend,

    master: &'a crate::crypto::MasterKey,

    /// Our actual tree cache.
    tree_cache: Forest,
}

impl<'a> Cache<'a> {
    pub fn new(
        index: &'a index::Index,
        blob_to_pack_map: &'a index::BlobMap,
        pack_cache: &'a backend::CachedBackend,
        master: &'a crate::crypto::MasterKey,
    ) -> Self {
        Self {
            index,
            blob_to_pack_map,
            pack_cache,
            master,
            tree_cache: Forest::default(),
        }
    }

    /// Reads the given tree from the cache, fishing it out of its pack if required.
    pub fn read(&mut self, id: &ObjectId) -> Result<Arc<Tree>> {
        if let Some(t) = self.tree_cache.get(id) {
            trace!("Found tree {id} in-cache");
            counters::bump(counters::Op::TreeCacheHit);
            return Ok(t.clone());
        } else {
            counters::bump(counters::Op::TreeCacheMiss);
        }

        let pack_id = self
            .blob_to_pack_map
            .get(id)
            .ok_or_else(|| anyhow!("No pack contains tree {id}"))?;

        debug!("Reading pack {pack_id} into tree cache to get tree {id}");
        let manifest = self
            .index
            .packs
            .get(pack_id)
            .expect("Pack ID in blob -> pack map but not the index");

        pack::append_to_forest(
            pack_id,
            manifest,
            self.pack_cache,
            self.master,
            &mut self.tree_cache,
        )?;

        self.tree_cache
            .get(id)
            .ok_or_else(|| anyhow!("Tree {id} missing from pack {pack_id}"))
            .cloned()
    }
}

/// Reads the given tree and all its subtrees from the given tree cache.
pub fn forest_from_root(root: &ObjectId, cache: &mut Cache) -> Result<Forest> {
    trace!("Assembling tree from root {root}");
    let mut forest = Forest::default();
    let mut stack_set = FxHashSet::default();
    append_tree(root, &mut forest, cache, &mut stack_set)?;
    Ok(forest)
}

fn append_tree(
    tree_id: &ObjectId,
    forest: &mut Forest,
    cache: &mut Cache,
    stack_set: &mut FxHashSet<ObjectId>,
) -> Result<()> {
    ensure!(
        stack_set.insert(*tree_id),
        "Cycle detected! Tree {tree_id} loops up"
    );

    let tree = cache.read(tree_id)?;
    forest.insert(*tree_id, tree.clone());
    for val in tree.values().map(|v| &v.contents) {
        if let NodeContents::Dir { subtree } = val {
            append_tree(subtree, forest, cache, stack_set)?;
        }
    }

    assert!(stack_set.remove(tree_id));
    Ok(())
}

/// Collect the set of data blobs referenced by the files in the given forest.
pub fn chunks_in_forest(forest: &Forest) -> FxHashSet<&ObjectId> {
    forest
        .values()
        .map(|t| chunks_in_tree(t))
        .reduce(|mut a, b| {
            a.extend(b);
            a
        })
        .unwrap_or_default()
}

/// Collect the set of data blobs referenced by the files in the given tree.
pub fn chunks_in_tree(tree: &Tree) -> FxHashSet<&ObjectId> {
    tree.values()
        .map(chunks_in_node)
        .fold(FxHashSet::default(), |mut set, node_chunks| {
            for chunk in node_chunks {
                set.insert(chunk);
            }
            set
        })
}

/// Return the slice of data blobs referenced by a file node,
/// or an empty slice if `node` isn't a file.
pub fn chunks_in_node(node: &Node) -> &[ObjectId] {
    match &node.contents {
        NodeContents::File { content, .. } => content,
        _ => &[],
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_metadata() -> Metadata {
        Metadata {
            mode: 0o644,
            uid: 1234,
            gid: 5678,
            user: Some("rhiannon".to_string()),
            group: Some("staff".to_string()),
            access_time: "2020-10-30T06:30:25.157873535Z".parse().unwrap(),
            mod_time: "2020-10-30T06:30:25.034542588Z".parse().unwrap(),
            change_time: "2020-10-30T06:30:25.034542588Z".parse().unwrap(),
            xattrs: BTreeMap::new(),
        }
    }

    #[test]
    fn round_trips_through_cbor() -> Result<()> {
        let mut tree = BTreeMap::new();
        tree.insert(
            Utf8PathBuf::from("a_file"),
            Node {
                contents: NodeContents::File {
                    size: 123,
                    content: vec![ObjectId::hash(b"first chunk"), ObjectId::hash(b"second chunk")],
                    inode: Some(42),
                },
                metadata: test_metadata(),
            },
        );
        tree.insert(
            Utf8PathBuf::from("a_dir"),
            Node {
                contents: NodeContents::Dir {
                    subtree: ObjectId::hash(b"some subdirectory"),
                },
                metadata: test_metadata(),
            },
        );
        tree.insert(
            Utf8PathBuf::from("a_link"),
            Node {
                contents: NodeContents::Symlink {
                    link_target: Utf8PathBuf::from("a_file"),
                },
                metadata: test_metadata(),
            },
        );

        let (bytes, id) = serialize_and_hash(&tree)?;
        let reparsed: Tree = ciborium::de::from_reader(bytes.as_slice())?;
        assert_eq!(tree, reparsed);
        assert_eq!(id, ObjectId::hash(&bytes));
        Ok(())
    }

    #[test]
    fn metadata_equality_ignores_access_time() {
        let mut a = test_metadata();
        let mut b = test_metadata();
        b.access_time = "2099-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(a, b);

        a.mod_time = "2099-01-01T00:00:00Z".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn chunks_in_tree_collects_only_files() {
        let mut tree = BTreeMap::new();
        let chunk_a = ObjectId::hash(b"a");
        let chunk_b = ObjectId::hash(b"b");
        tree.insert(
            Utf8PathBuf::from("f"),
            Node {
                contents: NodeContents::File {
                    size: 0,
                    content: vec![chunk_a, chunk_b],
                    inode: None,
                },
                metadata: test_metadata(),
            },
        );
        tree.insert(
            Utf8PathBuf::from("d"),
            Node {
                contents: NodeContents::Dir {
                    subtree: ObjectId::hash(b"sub"),
                },
                metadata: test_metadata(),
            },
        );

        let chunks = chunks_in_tree(&tree);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.contains(&chunk_a));
        assert!(chunks.contains(&chunk_b));
    }
}
