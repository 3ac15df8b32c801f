use std::sync::Arc;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use clap::Parser;
use tracing::*;

use crate::backend;
use crate::backup;
use crate::config::{self, Configuration};
use crate::filter;
use crate::index;
use crate::key;
use crate::read::BlobReader;
use crate::repack::{self, Op};
use crate::snapshot;
use crate::tree;

/// Copy a snapshot, filtering out given paths
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
pub struct Args {
    #[clap(short = 'n', long)]
    dry_run: bool,

    /// Preserve snapshot author, time, and tags from the target
    #[clap(short, long)]
    keep_metadata: bool,

    /// The author of the snapshot (otherwise the current user is used)
    #[clap(short, long, name = "name")]
    author: Option<String>,

    /// Add a metadata tag to the snapshot (can be specified multiple times)
    #[clap(short = 't', long = "tag", name = "tag")]
    tags: Vec<String>,

    /// Skip anything whose path matches the given regular expression
    #[clap(short = 's', long = "skip", name = "regex", required = true)]
    skips: Vec<String>,

    /// The snapshot to filter
    target_snapshot: String,
}

pub async fn run(config: Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    if args.keep_metadata && (args.author.is_some() || !args.tags.is_empty()) {
        bail!("Give either --keep-metadata or new metadata with --author, --tags (see --help)")
    }

    let password = config::resolve_password(&config)?;
    let cached_backend = backend::open(repository.as_std_path())?;
    let master = key::open_any(&cached_backend, &password)?;

    let index = index::build_master_index(&cached_backend, &master)?;
    let blob_map = index::blob_to_pack_map(&index)?;

    let target_id = snapshot::find(&args.target_snapshot, &cached_backend, &master)?;
    let target = snapshot::load(&target_id, &cached_backend, &master)?;

    let snapshot_and_forest = repack::load_forests(
        vec![(target.clone(), target_id)],
        // We can drop the tree cache immediately once we have our forest.
        &mut tree::Cache::new(&index, &blob_map, &cached_backend, &master),
    )?;

    // Track all the blobs we already have: since we're filtering within the
    // same repository, everything the target references is already packed.
    let mut packed_blobs = index::blob_set(&index)?;

    let format_version = config::read_repository_config(&cached_backend, &master)?.version;
    let cached_backend = Arc::new(cached_backend);
    let master = Arc::new(master);
    let mut backup = (!args.dry_run).then(|| {
        backup::spawn_backup_tasks(
            cached_backend.clone(),
            master.clone(),
            format_version,
            index::Index::default(),
        )
    });

    let filter = filter::skip_matching_paths(&args.skips)?;
    let mut reader = BlobReader::new(&cached_backend, &master, &blob_map);

    let mut new_snapshots = repack::walk_snapshots(
        Op::Copy,
        &snapshot_and_forest,
        |path| Ok(filter(path)),
        &mut reader,
        &mut packed_blobs,
        &mut backup,
    )?;
    let mut new_snapshot = new_snapshots.pop().expect("walked exactly one snapshot");

    // Important: make sure all new trees are written BEFORE we upload the
    // new snapshot. It's meaningless unless everything else is there first!
    if let Some(b) = backup {
        b.join().await.context("Writing filtered trees failed")?;
    }

    if new_snapshot.tree == target.tree {
        info!("Nothing filtered; no new snapshot");
    } else if !args.dry_run {
        if !args.keep_metadata {
            new_snapshot.username = match args.author {
                Some(a) => a,
                None => local_username(),
            };
            new_snapshot.hostname = hostname::get()
                .context("Couldn't get hostname")?
                .to_string_lossy()
                .to_string();
            new_snapshot.time = jiff::Timestamp::now();
            new_snapshot.tags = args.tags.into_iter().collect();
        }

        let new_id = snapshot::upload(&new_snapshot, &cached_backend, &master)?;
        info!("Filtered snapshot {target_id} into {new_id}");
    }

    Ok(())
}

fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
