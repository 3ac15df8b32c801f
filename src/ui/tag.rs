use anyhow::{bail, Result};
use camino::Utf8Path;
use clap::Parser;
use tracing::*;

use crate::backend;
use crate::config::{self, Configuration};
use crate::key;
use crate::snapshot;

/// Add, remove, or replace a snapshot's tags
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
pub struct Args {
    /// Replace the snapshot's tags with these
    #[clap(long = "set", name = "TAG", conflicts_with_all = ["add", "remove"])]
    set: Vec<String>,

    /// Add these tags to the snapshot
    #[clap(long = "add", name = "TAG")]
    add: Vec<String>,

    /// Remove these tags from the snapshot
    #[clap(long = "remove", name = "TAG")]
    remove: Vec<String>,

    /// The snapshot to tag
    target_snapshot: String,
}

pub fn run(config: Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    if args.set.is_empty() && args.add.is_empty() && args.remove.is_empty() {
        bail!("Give --set, --add, or --remove (see --help)");
    }

    let password = config::resolve_password(&config)?;
    let cached_backend = backend::open(repository.as_std_path())?;
    let master = key::open_any(&cached_backend, &password)?;

    let (target, target_id) = snapshot::find_and_load(&args.target_snapshot, &cached_backend, &master)?;

    let mut new_snapshot = target.clone();
    if !args.set.is_empty() {
        new_snapshot.tags = args.set.into_iter().collect();
    } else {
        for tag in args.add {
            new_snapshot.tags.insert(tag);
        }
        for tag in &args.remove {
            new_snapshot.tags.remove(tag);
        }
    }

    if new_snapshot.tags == target.tags {
        info!("No change; tags already match");
        return Ok(());
    }

    new_snapshot.original = Some(target.original.unwrap_or(target_id));

    let new_id = snapshot::upload(&new_snapshot, &cached_backend, &master)?;
    cached_backend.remove_snapshot(&target_id)?;
    info!("Snapshot {target_id} retagged as {new_id}");

    Ok(())
}
