use std::fs;
use std::io::Write;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use rustc_hash::FxHashMap;
use tracing::*;

use crate::backend;
use crate::config::{self, Configuration};
use crate::diff;
use crate::fs_tree;
use crate::hashing::ObjectId;
use crate::index;
use crate::key;
use crate::ls;
use crate::read::BlobReader;
use crate::snapshot;
use crate::tree::{self, Forest, Node, NodeContents, NodeType};

/// Restore a snapshot onto the filesystem
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
pub struct Args {
    /// Restore into the given directory instead of each path's original location
    #[clap(short, long, name = "DIR")]
    output: Option<Utf8PathBuf>,

    /// Print what would change without touching the filesystem
    #[clap(short = 'n', long)]
    dry_run: bool,

    /// Delete files and directories that aren't in the snapshot
    #[clap(short, long)]
    delete: bool,

    /// Restore modification times
    #[clap(short, long)]
    times: bool,

    /// Restore access times
    #[clap(short = 'U', long)]
    atimes: bool,

    /// The snapshot to restore
    restore_from: String,
}

pub fn run(config: Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    let password = config::resolve_password(&config)?;
    let cached_backend = backend::open(repository.as_std_path())?;
    let master = key::open_any(&cached_backend, &password)?;

    let index = index::build_master_index(&cached_backend, &master)?;
    let blob_map = index::blob_to_pack_map(&index)?;
    let mut tree_cache = tree::Cache::new(&index, &blob_map, &cached_backend, &master);

    let (snapshot, id) = snapshot::find_and_load(&args.restore_from, &cached_backend, &master)?;
    let snapshot_forest = tree::forest_from_root(&snapshot.tree, &mut tree_cache)?;

    let (fs_id, fs_forest) = load_fs_tree(&id, &snapshot, &snapshot_forest, &args.output)?;

    let roots = root_map(&snapshot.paths, args.output.as_deref());

    let mut res = Restorer {
        dry_run: args.dry_run,
        delete: args.delete,
        restore_times: args.times,
        restore_atimes: args.atimes,
        roots,
        reader: BlobReader::new(&cached_backend, &master, &blob_map),
    };

    // The filesystem tree is the "older" one, since the backup is the
    // desired end state.
    diff::compare_trees(
        (&fs_id, &fs_forest),
        (&snapshot.tree, &snapshot_forest),
        Utf8Path::new(""),
        &mut res,
    )?;

    Ok(())
}

fn load_fs_tree(
    id: &ObjectId,
    snapshot: &snapshot::Snapshot,
    snapshot_forest: &tree::Forest,
    restore_to: &Option<Utf8PathBuf>,
) -> Result<(ObjectId, tree::Forest)> {
    if let Some(to) = restore_to {
        info!("Comparing snapshot {} to {}", id, to);

        let paths = snapshot
            .paths
            .iter()
            .map(|p| {
                let mut root = to.clone();
                root.push(p.file_name().expect("backed-up path had no file name"));
                root
            })
            .filter(|p| p.exists())
            .collect();

        fs_tree::forest_from_fs(&paths, Some(&snapshot.tree), snapshot_forest)
    } else {
        info!(
            "Restoring snapshot {} to its original paths, {:?}",
            id, snapshot.paths
        );
        fs_tree::forest_from_fs(&snapshot.paths, Some(&snapshot.tree), snapshot_forest)
    }
}

/// `diff::compare_trees` walks from an empty root, so a node's path is just
/// its chain of tree keys - it knows nothing of where on disk it actually
/// belongs. This maps each top-level entry name back to the directory it
/// should land in, so we can rebuild a real path from one of those.
fn root_map(
    paths: &std::collections::BTreeSet<Utf8PathBuf>,
    output: Option<&Utf8Path>,
) -> FxHashMap<Utf8PathBuf, Utf8PathBuf> {
    paths
        .iter()
        .map(|p| {
            let name = Utf8PathBuf::from(p.file_name().expect("backed-up path had no file name"));
            let parent = match output {
                Some(to) => to.to_owned(),
                None => p.parent().map(Utf8Path::to_owned).unwrap_or_default(),
            };
            (name, parent)
        })
        .collect()
}

#[derive(Debug)]
struct Restorer<'a> {
    dry_run: bool,
    delete: bool,
    restore_times: bool,
    restore_atimes: bool,
    roots: FxHashMap<Utf8PathBuf, Utf8PathBuf>,
    reader: BlobReader<'a>,
}

impl Restorer<'_> {
    fn dest_path(&self, node_path: &Utf8Path) -> Utf8PathBuf {
        let top = Utf8PathBuf::from(
            node_path
                .components()
                .next()
                .expect("diff gave us an empty path")
                .as_str(),
        );
        match self.roots.get(&top) {
            Some(parent) => parent.join(node_path),
            None => node_path.to_owned(),
        }
    }

    /// Recreate `node` (and, for a directory, everything under it) at `dest`.
    fn materialize(&mut self, dest: &Utf8Path, node: &Node, forest: Option<&Forest>) -> Result<()> {
        match &node.contents {
            NodeContents::Dir { subtree } => {
                let forest = forest.expect("can't restore a directory without its forest");
                fs::create_dir_all(dest).with_context(|| format!("Couldn't create {dest}"))?;
                let tree = forest
                    .get(subtree)
                    .ok_or_else(|| anyhow::anyhow!("Missing tree {subtree}"))?;
                for (name, child) in tree.iter() {
                    self.materialize(&dest.join(name), child, Some(forest))?;
                }
            }
            NodeContents::File { content, .. } => {
                let mut f =
                    fs::File::create(dest).with_context(|| format!("Couldn't create {dest}"))?;
                for chunk_id in content {
                    let chunk = self.reader.read_blob(chunk_id)?;
                    f.write_all(&chunk)?;
                }
            }
            NodeContents::Symlink { link_target } => {
                symlink(link_target, dest)
                    .with_context(|| format!("Couldn't symlink {dest} -> {link_target}"))?;
            }
            NodeContents::Device { .. } | NodeContents::Fifo | NodeContents::Socket => {
                bail!("{dest} is a device, FIFO, or socket; restoring those isn't supported");
            }
        }
        self.set_metadata(dest, node)
    }

    fn remove(&self, dest: &Utf8Path, node: &Node) -> Result<()> {
        match &node.contents {
            NodeContents::Dir { .. } => {
                fs::remove_dir_all(dest).with_context(|| format!("Couldn't remove {dest}"))
            }
            _ => fs::remove_file(dest).with_context(|| format!("Couldn't remove {dest}")),
        }
    }

    #[cfg(unix)]
    fn set_metadata(&self, dest: &Utf8Path, node: &Node) -> Result<()> {
        use rustix::fs::{AtFlags, Mode, RawMode, Timespec, Timestamps};

        if node.kind() != NodeType::Symlink {
            let mode = Mode::from_raw_mode((node.metadata.mode & 0o7777) as RawMode);
            rustix::fs::chmod(dest.as_std_path(), mode)
                .with_context(|| format!("Couldn't set permissions on {dest}"))?;
        }

        if !self.restore_times && !self.restore_atimes {
            return Ok(());
        }

        // Per utimensat(2): a tv_nsec of UTIME_OMIT leaves that timestamp alone.
        const UTIME_OMIT: i64 = (1 << 30) - 2;
        let timespec = |restore: bool, ts: jiff::Timestamp| {
            if restore {
                Timespec {
                    tv_sec: ts.as_second(),
                    tv_nsec: ts.subsec_nanosecond() as _,
                }
            } else {
                Timespec {
                    tv_sec: 0,
                    tv_nsec: UTIME_OMIT,
                }
            }
        };

        let times = Timestamps {
            last_access: timespec(self.restore_atimes, node.metadata.access_time),
            last_modification: timespec(self.restore_times, node.metadata.mod_time),
        };
        let flags = if node.kind() == NodeType::Symlink {
            AtFlags::SYMLINK_NOFOLLOW
        } else {
            AtFlags::empty()
        };

        rustix::fs::utimensat(rustix::fs::CWD, dest.as_std_path(), &times, flags)
            .with_context(|| format!("Couldn't set times on {dest}"))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_metadata(&self, _dest: &Utf8Path, _node: &Node) -> Result<()> {
        if self.restore_times || self.restore_atimes {
            warn!("Restoring timestamps isn't supported on this platform");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn symlink(target: &Utf8Path, link: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Utf8Path, link: &Utf8Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

impl diff::Callbacks for Restorer<'_> {
    fn node_added(&mut self, node_path: &Utf8Path, new_node: &Node, forest: &Forest) -> Result<()> {
        ls::print_node("+ ", node_path, new_node, ls::Recurse::Yes(forest));

        if self.dry_run {
            return Ok(());
        }
        let dest = self.dest_path(node_path);
        self.materialize(&dest, new_node, Some(forest))
    }

    fn node_removed(&mut self, node_path: &Utf8Path, old_node: &Node, forest: &Forest) -> Result<()> {
        if !self.delete {
            return Ok(());
        }
        ls::print_node("- ", node_path, old_node, ls::Recurse::Yes(forest));

        if self.dry_run {
            return Ok(());
        }
        let dest = self.dest_path(node_path);
        self.remove(&dest, old_node)
    }

    fn contents_changed(
        &mut self,
        node_path: &Utf8Path,
        old_node: &Node,
        new_node: &Node,
    ) -> Result<()> {
        assert!(old_node.kind() == NodeType::File || old_node.kind() == NodeType::Symlink);
        assert_eq!(old_node.kind(), new_node.kind());

        if old_node.kind() == NodeType::Symlink {
            ls::print_node("- ", node_path, old_node, ls::Recurse::No);
            ls::print_node("+ ", node_path, new_node, ls::Recurse::No);
        } else {
            ls::print_node("M ", node_path, old_node, ls::Recurse::No);
        }

        if self.dry_run {
            return Ok(());
        }

        let dest = self.dest_path(node_path);
        if old_node.kind() == NodeType::Symlink {
            fs::remove_file(&dest).with_context(|| format!("Couldn't remove {dest}"))?;
        }
        self.materialize(&dest, new_node, None)
    }

    fn metadata_changed(&mut self, node_path: &Utf8Path, node: &Node) -> Result<()> {
        ls::print_node("U ", node_path, node, ls::Recurse::No);

        if self.dry_run {
            return Ok(());
        }
        let dest = self.dest_path(node_path);
        self.set_metadata(&dest, node)
    }

    fn type_changed(
        &mut self,
        node_path: &Utf8Path,
        old_node: &Node,
        old_forest: &Forest,
        new_node: &Node,
        new_forest: &Forest,
    ) -> Result<()> {
        ls::print_node("- ", node_path, old_node, ls::Recurse::Yes(old_forest));
        ls::print_node("+ ", node_path, new_node, ls::Recurse::Yes(new_forest));

        if self.dry_run {
            return Ok(());
        }

        let dest = self.dest_path(node_path);
        self.remove(&dest, old_node)?;
        self.materialize(&dest, new_node, Some(new_forest))
    }
}
