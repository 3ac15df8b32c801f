use anyhow::Result;
use camino::Utf8Path;
use clap::Parser;
use tracing::*;

use crate::config::{self, Configuration};
use crate::{backend, index, key, ls, snapshot, tree};

/// List the files in a snapshot
#[derive(Debug, Parser)]
pub struct Args {
    snapshot: String,
}

pub fn run(config: Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    let password = config::resolve_password(&config)?;
    let cached_backend = backend::open(repository.as_std_path())?;
    let master = key::open_any(&cached_backend, &password)?;
    let id = snapshot::find(&args.snapshot, &cached_backend, &master)?;
    let snapshot = snapshot::load(&id, &cached_backend, &master)?;
    let index = index::build_master_index(&cached_backend, &master)?;
    let blob_map = index::blob_to_pack_map(&index)?;
    let mut tree_cache = tree::Cache::new(&index, &blob_map, &cached_backend, &master);

    info!("Listing files for snapshot {}", id);

    let snapshot_tree = tree::forest_from_root(&snapshot.tree, &mut tree_cache)?;
    ls::print_tree("", Utf8Path::new(""), &snapshot.tree, &snapshot_tree);

    Ok(())
}
