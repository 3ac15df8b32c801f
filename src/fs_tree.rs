//! Tree walking - compare repo trees to the filesystem.
//!
//! [`walk_fs`] is the shared traversal: callers supply a `filter` (skip a
//! path and everything under it), a `visit` (turn what was found into a
//! [`Node`]), and a `finalize` (turn a directory's accumulated [`Tree`] into
//! whatever the caller is building - a packed subtree ID for a real backup,
//! nothing at all for a dry check). [`forest_from_fs`] is the simple case:
//! build a comparable [`Forest`](tree::Forest) straight off disk, with no
//! packer involved, for `diff` and `restore`.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::chunk;
use crate::hashing::ObjectId;
use crate::tree::{self, Metadata, Node, NodeContents, NodeType, Symlink, Tree};

/// What [`walk_fs`] found at a given path. Generic over what finishing a
/// directory produces.
pub enum DirectoryEntry<T> {
    Directory(T),
    Symlink { target: Utf8PathBuf },
    Device { device_number: u64 },
    Fifo,
    Socket,
    UnchangedFile,
    ChangedFile,
}

/// Walks `paths` (siblings - not necessarily from the same directory, since
/// a backup can be given several unrelated roots), recursing into
/// directories and calling `visit` once per entry.
#[expect(clippy::too_many_arguments)]
pub fn walk_fs<T>(
    symlink_behavior: Symlink,
    paths: &BTreeSet<Utf8PathBuf>,
    previous_tree: Option<&ObjectId>,
    previous_forest: &tree::Forest,
    filter: &mut dyn FnMut(&Utf8Path) -> bool,
    visit: &mut dyn FnMut(
        &mut Tree,
        &Utf8Path,
        Metadata,
        Option<&Node>,
        DirectoryEntry<T>,
    ) -> Result<()>,
    finalize: &mut dyn FnMut(Tree) -> Result<T>,
) -> Result<T> {
    let previous_tree = previous_tree.and_then(|id| previous_forest.get(id));
    walk_level(
        symlink_behavior,
        paths,
        previous_tree.map(|t| t.as_ref()),
        previous_forest,
        filter,
        visit,
        finalize,
    )
}

#[expect(clippy::too_many_arguments)]
fn walk_level<T>(
    symlink_behavior: Symlink,
    paths: &BTreeSet<Utf8PathBuf>,
    previous_tree: Option<&Tree>,
    previous_forest: &tree::Forest,
    filter: &mut dyn FnMut(&Utf8Path) -> bool,
    visit: &mut dyn FnMut(
        &mut Tree,
        &Utf8Path,
        Metadata,
        Option<&Node>,
        DirectoryEntry<T>,
    ) -> Result<()>,
    finalize: &mut dyn FnMut(Tree) -> Result<T>,
) -> Result<T> {
    let mut tree = Tree::new();

    for path in paths {
        if !filter(path) {
            continue;
        }

        let entry_name = path.file_name().context("Given path ended in ..")?;
        let previous_node = previous_tree.and_then(|t| t.get(Utf8Path::new(entry_name)));

        let lstat = fs::symlink_metadata(path).with_context(|| format!("Couldn't stat {path}"))?;
        let follow = lstat.file_type().is_symlink() && symlink_behavior == Symlink::Dereference;
        let metadata = tree::get_metadata_at(path, follow)?;
        let file_type = if follow {
            fs::metadata(path)
                .with_context(|| format!("Couldn't stat {path}"))?
                .file_type()
        } else {
            lstat.file_type()
        };

        if file_type.is_dir() {
            let subpaths = fs::read_dir(path)
                .with_context(|| format!("Couldn't list {path}"))?
                .map(|entry| -> Result<Utf8PathBuf> {
                    Utf8PathBuf::from_path_buf(entry?.path())
                        .map_err(|p| anyhow::anyhow!("{} isn't UTF-8", p.display()))
                })
                .collect::<Result<BTreeSet<Utf8PathBuf>>>()
                .with_context(|| format!("Failed iterating subdirectory {path}"))?;

            let previous_subtree = previous_node.and_then(|n| match &n.contents {
                NodeContents::Dir { subtree } => Some(subtree),
                other => {
                    trace!("{path} was a {:?} before and is a directory now", other);
                    None
                }
            });

            let subtree = walk_level(
                symlink_behavior,
                &subpaths,
                previous_subtree.and_then(|id| previous_forest.get(id).map(|t| t.as_ref())),
                previous_forest,
                filter,
                visit,
                finalize,
            )
            .with_context(|| format!("Failed to pack subdirectory {path}"))?;

            visit(
                &mut tree,
                path,
                metadata,
                previous_node,
                DirectoryEntry::Directory(subtree),
            )?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(path).with_context(|| format!("Couldn't read symlink {path}"))?;
            let target = Utf8PathBuf::from_path_buf(target)
                .map_err(|p| anyhow::anyhow!("Symlink target {} isn't UTF-8", p.display()))?;
            visit(
                &mut tree,
                path,
                metadata,
                previous_node,
                DirectoryEntry::Symlink { target },
            )?;
        } else if file_type.is_file() {
            let entry = if file_changed(path, &metadata, previous_node) {
                DirectoryEntry::ChangedFile
            } else {
                DirectoryEntry::UnchangedFile
            };
            visit(&mut tree, path, metadata, previous_node, entry)?;
        } else {
            visit_special_file(&mut tree, path, metadata, previous_node, &lstat, visit)?;
        }
    }

    finalize(tree)
}

#[cfg(unix)]
fn visit_special_file<T>(
    tree: &mut Tree,
    path: &Utf8Path,
    metadata: Metadata,
    previous_node: Option<&Node>,
    lstat: &fs::Metadata,
    visit: &mut dyn FnMut(
        &mut Tree,
        &Utf8Path,
        Metadata,
        Option<&Node>,
        DirectoryEntry<T>,
    ) -> Result<()>,
) -> Result<()> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let ft = lstat.file_type();
    let entry = if ft.is_block_device() || ft.is_char_device() {
        DirectoryEntry::Device {
            device_number: lstat.rdev(),
        }
    } else if ft.is_fifo() {
        DirectoryEntry::Fifo
    } else if ft.is_socket() {
        DirectoryEntry::Socket
    } else {
        bail!("{path} is a kind of file we don't know how to back up");
    };
    visit(tree, path, metadata, previous_node, entry)
}

#[cfg(not(unix))]
fn visit_special_file<T>(
    _tree: &mut Tree,
    path: &Utf8Path,
    _metadata: Metadata,
    _previous_node: Option<&Node>,
    _lstat: &fs::Metadata,
    _visit: &mut dyn FnMut(
        &mut Tree,
        &Utf8Path,
        Metadata,
        Option<&Node>,
        DirectoryEntry<T>,
    ) -> Result<()>,
) -> Result<()> {
    bail!("{path} is a kind of file we don't know how to back up")
}

/// Should `path` be re-chunked? True if it wasn't backed up before, changed
/// kind, or its size/modification time no longer match.
pub fn file_changed(path: &Utf8Path, metadata: &Metadata, previous_node: Option<&Node>) -> bool {
    let Some(previous_node) = previous_node else {
        trace!("No previous node for {path}");
        return true;
    };

    if previous_node.kind() != NodeType::File {
        trace!(
            "{path} was a {:?} before and is a file now",
            previous_node.kind()
        );
        return true;
    }

    if *metadata != previous_node.metadata {
        trace!("{path} was changed since its backup");
        return true;
    }

    trace!("{path} matches its previous metadata, reusing its chunks");
    false
}

/// Builds a [`Forest`](tree::Forest) straight from the filesystem, hashing
/// any file whose metadata doesn't match its previous node. No packer
/// involved - used to compare a working copy against a past snapshot.
pub fn forest_from_fs(
    paths: &BTreeSet<Utf8PathBuf>,
    previous_tree: Option<&ObjectId>,
    previous_forest: &tree::Forest,
) -> Result<(ObjectId, tree::Forest)> {
    let forest = RefCell::new(tree::Forest::default());

    let mut filter = |_: &Utf8Path| true;
    let mut visit = |tree: &mut Tree,
                     path: &Utf8Path,
                     metadata: Metadata,
                     previous_node: Option<&Node>,
                     entry: DirectoryEntry<ObjectId>|
     -> Result<()> {
        let contents = match entry {
            DirectoryEntry::Directory(subtree) => NodeContents::Dir { subtree },
            DirectoryEntry::Symlink { target } => NodeContents::Symlink {
                link_target: target,
            },
            DirectoryEntry::Device { device_number } => NodeContents::Device { device_number },
            DirectoryEntry::Fifo => NodeContents::Fifo,
            DirectoryEntry::Socket => NodeContents::Socket,
            DirectoryEntry::UnchangedFile => previous_node.unwrap().contents.clone(),
            DirectoryEntry::ChangedFile => {
                let chunks = chunk::chunk_file(path)?;
                let size = chunks.iter().map(|c| c.bytes().len() as u64).sum();
                let content = chunks.iter().map(|c| c.id).collect();
                NodeContents::File {
                    size,
                    content,
                    inode: None,
                }
            }
        };
        ensure!(
            tree.insert(
                Utf8PathBuf::from(path.file_name().unwrap()),
                Node { metadata, contents },
            )
            .is_none(),
            "Duplicate tree entries"
        );
        Ok(())
    };
    let mut finalize = |tree: Tree| -> Result<ObjectId> {
        let (_bytes, id) = tree::serialize_and_hash(&tree)?;
        forest.borrow_mut().insert(id, Arc::new(tree));
        Ok(id)
    };

    let root = walk_fs(
        Symlink::Read,
        paths,
        previous_tree,
        previous_forest,
        &mut filter,
        &mut visit,
        &mut finalize,
    )?;
    Ok((root, forest.into_inner()))
}
