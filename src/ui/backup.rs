use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use rustc_hash::FxHashSet;
use tracing::*;

use crate::backend;
use crate::backup::{self, Backup, BackupStatistics};
use crate::blob::{self, Blob};
use crate::chunk;
use crate::config::{self, Configuration};
use crate::file_util::nice_size;
use crate::filter;
use crate::fs_tree;
use crate::hashing::{HashingWriter, ObjectId};
use crate::index;
use crate::key;
use crate::progress::{ProgressTask, print_backup_lines};
use crate::rcu::Rcu;
use crate::snapshot::{self, Snapshot};
use crate::tree;

/// Create a snapshot of the given files and directories.
#[derive(Debug, Parser)]
pub struct Args {
    /// Dereference symbolic links instead of just saving their target.
    #[clap(short = 'L', long)]
    dereference: bool,

    /// Do not dereference symbolic links, just save their targets. (default)
    #[clap(short = 'P', long, conflicts_with = "dereference")]
    no_dereference: bool,

    /// Allow empty snapshots.
    #[clap(long)]
    allow_empty: bool,

    /// Allow a snapshot to match the previous one.
    #[clap(long)]
    allow_repeat: bool,

    /// A free-form description of the snapshot.
    #[clap(short, long)]
    description: Option<String>,

    /// Add a metadata tag to the snapshot (can be specified multiple times)
    #[clap(short = 't', long = "tag", name = "tag")]
    tags: Vec<String>,

    /// Skip anything whose absolute path matches the given regular expression
    #[clap(short = 's', long = "skip", name = "regex")]
    skips: Vec<String>,

    #[clap(short = 'n', long)]
    dry_run: bool,

    /// The paths to back up
    ///
    /// These paths are canonicalized into absolute ones.
    /// Snapshots can be restored to either the same absolute paths,
    /// or to a given directory with `restore -o some/dir`
    #[clap(required = true, verbatim_doc_comment)]
    paths: Vec<Utf8PathBuf>,
}

pub async fn run(config: Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    // Canonicalize our paths (and make sure they're real!) before we spin up
    // a bunch of supporting infrastructure.
    let paths: BTreeSet<Utf8PathBuf> = args
        .paths
        .into_iter()
        .map(|p| {
            p.canonicalize_utf8()
                .with_context(|| format!("Couldn't canonicalize {p}"))
        })
        .collect::<Result<BTreeSet<Utf8PathBuf>>>()?;

    reject_matching_directories(&paths)?;

    let symlink_behavior = if args.dereference && !args.no_dereference {
        tree::Symlink::Dereference
    } else {
        tree::Symlink::Read
    };

    let password = config::resolve_password(&config)?;
    let cached_backend =
        backend::open(repository.as_std_path()).context("Couldn't open repository")?;
    let master = Arc::new(key::open_any(&cached_backend, &password)?);

    let index = index::build_master_index(&cached_backend, &master)?;
    let blob_map = index::blob_to_pack_map(&index)?;
    let format_version = config::read_repository_config(&cached_backend, &master)?.version;

    info!("Finding a parent snapshot");
    let snapshots = snapshot::load_chronologically(&cached_backend, &master)?;
    let parent = parent_snapshot(&paths, &snapshots);

    trace!("Loading all trees from the parent snapshot");
    let mut tree_cache = tree::Cache::new(&index, &blob_map, &cached_backend, &master);
    let parent_forest = parent
        .map(|(p, _)| tree::forest_from_root(&p.tree, &mut tree_cache))
        .transpose()?
        .unwrap_or_default();
    drop(tree_cache);

    // Track all the blobs already in the repository so we can deduplicate.
    let mut packed_blobs = index::blob_set(&index)?;

    let back_stats = Arc::new(BackupStatistics::default());
    let walk_stats = Arc::new(WalkStatistics::default());

    let cached_backend = Arc::new(cached_backend);
    let backup = backup::spawn_backup_tasks(
        cached_backend.clone(),
        master.clone(),
        format_version,
        index,
    );

    let progress = ProgressTask::spawn({
        let back_stats = back_stats.clone();
        let walk_stats = walk_stats.clone();
        move |i| {
            print_progress(i, &back_stats, &walk_stats);
            Ok(())
        }
    });

    let run_res = backup_with_progress(
        symlink_behavior,
        &paths,
        &args.skips,
        parent.map(|(p, _)| &p.tree),
        &parent_forest,
        &mut packed_blobs,
        backup,
        &back_stats,
        &walk_stats,
    )
    .await;

    progress.join().await?;
    let root = run_res?;
    drop(parent_forest);
    drop(packed_blobs);

    if root == *tree::EMPTY_ID && !args.allow_empty {
        assert_eq!(back_stats.chunk_bytes.load(Ordering::Relaxed), 0);
        assert_eq!(back_stats.tree_bytes.load(Ordering::Relaxed), 0);
        info!("Nothing backed up! Pass --allow-empty to create an empty snapshot.");
        return Ok(());
    }

    debug!("Root tree packed as {}", root);

    let hostname = hostname::get()
        .context("Couldn't get hostname")?
        .to_string_lossy()
        .to_string();
    let username = local_username();
    let time = jiff::Timestamp::now();

    let snapshot = Snapshot {
        time,
        tree: root,
        paths,
        hostname,
        username,
        uid: current_uid(),
        gid: current_gid(),
        excludes: args.skips,
        tags: args.tags.into_iter().collect(),
        parent: parent.map(|(_, id)| *id),
        original: None,
        description: args.description,
        summary: None,
    };
    trace!("{snapshot:?}");

    let prev_but_now = snapshots.last().map(|(s, _sid)| {
        let mut s = s.clone();
        s.time = time;
        s
    });
    if let Some(p) = prev_but_now {
        if p == snapshot && !args.allow_repeat {
            assert_eq!(back_stats.chunk_bytes.load(Ordering::Relaxed), 0);
            assert_eq!(back_stats.tree_bytes.load(Ordering::Relaxed), 0);
            info!("Snapshot is the same as the last! Pass --allow-repeat to create a duplicate.");
            return Ok(());
        }
    }

    let chunk_bytes = nice_size(back_stats.chunk_bytes.load(Ordering::Relaxed));
    let tree_bytes = nice_size(back_stats.tree_bytes.load(Ordering::Relaxed));
    debug!("{chunk_bytes} new files, {tree_bytes} new metadata");
    let rb = nice_size(walk_stats.reused_bytes.load(Ordering::Relaxed));
    debug!("{rb} reused");

    let snap_id = if !args.dry_run {
        snapshot::upload(&snapshot, &cached_backend, &master)?
    } else {
        let mut hasher = HashingWriter::new(io::sink());
        ciborium::into_writer(&snapshot, &mut hasher)?;
        let (id, _) = hasher.finalize();
        id
    };

    println!("\nSnapshot {} done", snap_id.short_name());
    Ok(())
}

#[cfg(unix)]
fn current_uid() -> u32 {
    rustix::process::getuid().as_raw()
}
#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(unix)]
fn current_gid() -> u32 {
    rustix::process::getgid().as_raw()
}
#[cfg(not(unix))]
fn current_gid() -> u32 {
    0
}

fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Spit out by our fs walk below; published for the progress line.
#[derive(Default)]
struct WalkStatistics {
    current_file: Rcu<Utf8PathBuf>,
    reused_bytes: AtomicU64,
}

fn print_progress(i: usize, bstats: &BackupStatistics, wstats: &WalkStatistics) {
    let rb = wstats.reused_bytes.load(Ordering::Relaxed);
    print_backup_lines(i, bstats, rb, 0);
    let cf = wstats.current_file.borrow();
    println!("{}", *cf);
}

/// Trees (including the top-level one for each snapshot!) don't store their nodes' absolute paths.
/// This falls apart if given two "foo"s, so yell about that.
fn reject_matching_directories(paths: &BTreeSet<Utf8PathBuf>) -> Result<()> {
    let mut dirnames: FxHashSet<&str> =
        FxHashSet::with_capacity_and_hasher(paths.len(), Default::default());
    for path in paths {
        let dirname = path.file_name().expect("empty path");
        if !dirnames.insert(dirname) {
            bail!(
                "Backups of directories with matching names ({dirname}/) isn't currently supported",
            );
        }
    }
    Ok(())
}

fn parent_snapshot<'a>(
    paths: &BTreeSet<Utf8PathBuf>,
    snapshots: &'a [(Snapshot, ObjectId)],
) -> Option<&'a (Snapshot, ObjectId)> {
    let parent = snapshots.iter().rev().find(|snap| snap.0.paths == *paths);
    match &parent {
        Some(p) => debug!("Using snapshot {} as a parent", p.1),
        None => debug!("No parent snapshot found based on absolute paths"),
    };
    parent
}

/// Walks the source trees, feeding new blobs to `backup`'s channels, then
/// waits for packing/indexing/uploading to finish.
#[expect(clippy::too_many_arguments)]
async fn backup_with_progress(
    symlink_behavior: tree::Symlink,
    paths: &BTreeSet<Utf8PathBuf>,
    skips: &[String],
    previous_tree: Option<&ObjectId>,
    previous_forest: &tree::Forest,
    packed_blobs: &mut FxHashSet<ObjectId>,
    mut backup: Backup,
    back_stats: &BackupStatistics,
    walk_stats: &WalkStatistics,
) -> Result<ObjectId> {
    let root = backup_tree(
        symlink_behavior,
        paths,
        skips,
        previous_tree,
        previous_forest,
        packed_blobs,
        &mut backup,
        back_stats,
        walk_stats,
    )?;

    // Important: make sure all blobs and the index are written BEFORE
    // we upload the snapshot. It's meaningless unless everything else is
    // there first.
    backup.join().await?;

    Ok(root)
}

#[expect(clippy::too_many_arguments)]
fn backup_tree(
    symlink_behavior: tree::Symlink,
    paths: &BTreeSet<Utf8PathBuf>,
    skips: &[String],
    previous_tree: Option<&ObjectId>,
    previous_forest: &tree::Forest,
    packed_blobs: &mut FxHashSet<ObjectId>,
    backup: &mut Backup,
    back_stats: &BackupStatistics,
    walk_stats: &WalkStatistics,
) -> Result<ObjectId> {
    use fs_tree::DirectoryEntry;

    let mf = filter::skip_matching_paths(skips)?;
    let mut filter = move |path: &Utf8Path| {
        let res = mf(path);
        if !res {
            debug!("{:>9} {}", "skip", path);
        }
        res
    };

    // Both closures need to get at packed_blobs at some point.
    let packed_blobs = RefCell::new(packed_blobs);

    let mut visit = |tree: &mut tree::Tree,
                     path: &Utf8Path,
                     metadata: tree::Metadata,
                     previous_node: Option<&tree::Node>,
                     entry: DirectoryEntry<ObjectId>|
     -> Result<()> {
        walk_stats.current_file.update(path.to_owned());
        let subnode = match entry {
            DirectoryEntry::Directory(subtree) => {
                debug!("{:>9} {}/", "finished", path);
                tree::Node {
                    metadata,
                    contents: tree::NodeContents::Dir { subtree },
                }
            }
            DirectoryEntry::Symlink { target } => {
                assert_eq!(symlink_behavior, tree::Symlink::Read);
                debug!("{:>9} {}", "symlink", path);
                tree::Node {
                    metadata,
                    contents: tree::NodeContents::Symlink {
                        link_target: target,
                    },
                }
            }
            DirectoryEntry::Device { device_number } => {
                debug!("{:>9} {}", "device", path);
                tree::Node {
                    metadata,
                    contents: tree::NodeContents::Device { device_number },
                }
            }
            DirectoryEntry::Fifo => tree::Node {
                metadata,
                contents: tree::NodeContents::Fifo,
            },
            DirectoryEntry::Socket => tree::Node {
                metadata,
                contents: tree::NodeContents::Socket,
            },
            DirectoryEntry::UnchangedFile => {
                debug!("{:>9} {}", "unchanged", path);
                let rb = match &previous_node.unwrap().contents {
                    tree::NodeContents::File { size, .. } => *size,
                    _ => 0,
                };
                walk_stats.reused_bytes.fetch_add(rb, Ordering::Relaxed);
                tree::Node {
                    metadata,
                    contents: previous_node.unwrap().contents.clone(),
                }
            }
            DirectoryEntry::ChangedFile => {
                let chunks = chunk::chunk_file(path)?;

                let mut chunk_ids = Vec::new();
                let mut new_chunks = false;
                let mut total_chunks = 0usize;
                let mut size = 0u64;
                for chunk in chunks {
                    chunk_ids.push(chunk.id);
                    size += chunk.bytes().len() as u64;
                    if packed_blobs.borrow_mut().insert(chunk.id) {
                        new_chunks = true;
                        back_stats
                            .chunk_bytes
                            .fetch_add(chunk.bytes().len() as u64, Ordering::Relaxed);
                        backup
                            .chunk_tx
                            .send(chunk)
                            .context("backup -> chunk packer channel exited early")?;
                    } else {
                        walk_stats
                            .reused_bytes
                            .fetch_add(chunk.bytes().len() as u64, Ordering::Relaxed);
                    }
                    total_chunks += 1;
                }
                let maybe_plural = if total_chunks == 1 { "chunk" } else { "chunks" };
                if !new_chunks {
                    debug!("{:>9} {path} ({total_chunks} {maybe_plural})", "deduped");
                } else {
                    debug!("{:>9} {path} ({total_chunks} {maybe_plural})", "backup");
                }

                tree::Node {
                    metadata,
                    contents: tree::NodeContents::File {
                        size,
                        content: chunk_ids,
                        inode: None,
                    },
                }
            }
        };
        ensure!(
            // A tree's nodes are named by their relative path from the parent,
            // not an absolute path - including the top-level tree for a
            // snapshot. Backing up /home/me and /etc gives a top-level tree
            // of { "me" -> subtree, "etc" -> subtree }, hence the absolute
            // paths living in the snapshot instead, and reject_matching_directories().
            tree.insert(Utf8PathBuf::from(path.file_name().unwrap()), subnode)
                .is_none(),
            "Duplicate tree entries"
        );
        Ok(())
    };

    let mut finalize = |tree: tree::Tree| -> Result<ObjectId> {
        // Don't bother serializing, packing, and uploading an empty tree.
        // Anything reading trees goes through tree::Cache, which special-cases this too.
        if tree.is_empty() {
            return Ok(*tree::EMPTY_ID);
        }

        let (bytes, id) = tree::serialize_and_hash(&tree)?;

        if packed_blobs.borrow_mut().insert(id) {
            back_stats
                .tree_bytes
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            backup
                .tree_tx
                .send(Blob {
                    contents: blob::Contents::Buffer(bytes),
                    id,
                    kind: blob::Type::Tree,
                })
                .context("backup -> tree packer channel exited early")?;
        } else {
            trace!("tree {} already packed", id);
            walk_stats
                .reused_bytes
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        Ok(id)
    };

    fs_tree::walk_fs(
        symlink_behavior,
        paths,
        previous_tree,
        previous_forest,
        &mut filter,
        &mut visit,
        &mut finalize,
    )
}
