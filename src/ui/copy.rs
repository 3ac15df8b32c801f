use std::sync::Arc;

use anyhow::{bail, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use tracing::*;

use crate::backend;
use crate::backup;
use crate::config::{self, Configuration};
use crate::filter;
use crate::index;
use crate::key;
use crate::read;
use crate::repack::{self, Op};
use crate::snapshot;
use crate::tree;

/// Copy snapshots from one repository to another.
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
pub struct Args {
    #[clap(short = 'n', long)]
    pub dry_run: bool,

    /// Destination repository
    #[clap(short, long, name = "PATH")]
    to: Utf8PathBuf,

    /// Copy every snapshot in the source repository
    #[clap(long)]
    all: bool,

    /// Skip anything whose path matches the given regular expression
    #[clap(short = 's', long = "skip", name = "regex")]
    skips: Vec<String>,

    /// Particular snapshots to copy, by ID prefix. Ignored if --all is given.
    snapshots: Vec<String>,
}

pub async fn run(config: Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    if !args.all && args.snapshots.is_empty() {
        bail!("Give --all to copy every snapshot, or list particular snapshots to copy");
    }

    let password = config::resolve_password(&config)?;

    let src_cached_backend = backend::open(repository.as_std_path())?;
    let src_master = key::open_any(&src_cached_backend, &password)?;
    let src_index = index::build_master_index(&src_cached_backend, &src_master)?;
    let src_blob_map = index::blob_to_pack_map(&src_index)?;

    let src_snapshots = if args.all {
        snapshot::load_chronologically(&src_cached_backend, &src_master)?
    } else {
        args.snapshots
            .iter()
            .map(|prefix| snapshot::find_and_load(prefix, &src_cached_backend, &src_master))
            .collect::<Result<Vec<_>>>()?
    };
    let src_snapshots_and_forests = repack::load_forests(
        src_snapshots,
        // We can drop the tree cache immediately once we have all our forests.
        &mut tree::Cache::new(&src_index, &src_blob_map, &src_cached_backend, &src_master),
    )?;

    // Get a reader to load the chunks we're copying.
    let mut reader = read::BlobReader::new(&src_cached_backend, &src_master, &src_blob_map);

    let dst_cached_backend = backend::open(args.to.as_std_path())?;
    let dst_master = key::open_any(&dst_cached_backend, &password)?;
    let dst_index = index::build_master_index(&dst_cached_backend, &dst_master)?;
    let dst_format_version = config::read_repository_config(&dst_cached_backend, &dst_master)?.version;

    // Track all the blobs already in the destination.
    let mut packed_blobs = index::blob_set(&dst_index)?;

    let dst_cached_backend = Arc::new(dst_cached_backend);
    let dst_master = Arc::new(dst_master);
    let mut backup = (!args.dry_run).then(|| {
        backup::spawn_backup_tasks(
            dst_cached_backend.clone(),
            dst_master.clone(),
            dst_format_version,
            dst_index,
        )
    });

    // Walk from newest to oldest snapshots so that we prioritize the locality
    // of chunks in newer snapshots. This is probably a horse a piece - you
    // could argue that older snapshots are more important - but all the
    // blobs will get packed up regardless.
    let mut newest_first = src_snapshots_and_forests;
    newest_first.reverse();

    let filter = filter::skip_matching_paths(&args.skips)?;
    let new_snapshots = repack::walk_snapshots(
        Op::Copy,
        &newest_first,
        |path| Ok(filter(path)),
        &mut reader,
        &mut packed_blobs,
        &mut backup,
    )?;

    // Important: make sure all blobs and indexes are written BEFORE
    // we upload the snapshots. It's meaningless unless everything else is
    // there first!
    if let Some(b) = backup {
        b.join().await?;
    }

    if !args.dry_run {
        for snapshot in new_snapshots {
            let id = snapshot::upload(&snapshot, &dst_cached_backend, &dst_master)?;
            info!("Copied snapshot {id}");
        }
    }

    Ok(())
}
