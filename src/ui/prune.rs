use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;
use clap::Parser;
use tracing::*;

use crate::backend;
use crate::cancel::CancellationToken;
use crate::config::{self, Configuration};
use crate::index;
use crate::key;
use crate::prune::{self, MaxUnused, PruneOptions};

/// Remove unused data and repack packs left mostly-unused by it
#[derive(Debug, Parser)]
pub struct Args {
    #[clap(short = 'n', long)]
    pub dry_run: bool,

    /// Keep at most this much unused space, as a percentage, byte size, or "unlimited"
    #[clap(long, name = "AMOUNT")]
    max_unused: Option<String>,

    /// Cap the total bytes repacked in one run
    #[clap(long, name = "BYTES")]
    max_repack_bytes: Option<u64>,

    /// Never repack data packs, only remove fully-unused ones
    #[clap(long)]
    repack_cacheable_only: bool,

    /// Also repack small, fully-used packs
    #[clap(long)]
    repack_small: bool,

    /// Also repack uncompressed data packs
    #[clap(long)]
    repack_uncompressed: bool,
}

pub async fn run(config: Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    let password = config::resolve_password(&config)?;
    let cached_backend = backend::open(repository.as_std_path())?;
    let master = key::open_any(&cached_backend, &password)?;
    let cancel = CancellationToken::new();

    let index = index::build_master_index(&cached_backend, &master)?;
    let format_version = config::read_repository_config(&cached_backend, &master)?.version;

    let used = prune::used_blobs(&cached_backend, &master, &index, &cancel)?;

    let max_unused = match &args.max_unused {
        Some(s) => MaxUnused::parse(s)?,
        None => MaxUnused::default(),
    };
    let opts = PruneOptions {
        max_unused,
        max_repack_bytes: args.max_repack_bytes,
        repack_cacheable_only: args.repack_cacheable_only,
        repack_small: args.repack_small,
        repack_uncompressed: args.repack_uncompressed,
        unsafe_no_free_space_recovery: None,
        dry_run: args.dry_run,
    };

    let plan = prune::plan(&cached_backend, &index, &used, format_version, &opts)?;

    info!(
        "Keep {} pack(s), repack {}, remove {} ({} orphaned)",
        plan.stats.packs_kept,
        plan.repack_packs.len(),
        plan.remove_packs.len(),
        plan.remove_packs_first.len()
    );

    if args.dry_run {
        info!("Dry run; not touching the repository");
        return Ok(());
    }

    let cached_backend = Arc::new(cached_backend);
    let master = Arc::new(master);
    prune::execute(cached_backend, master, &index, &plan, format_version, &cancel).await
}
