use std::sync::Arc;

use anyhow::{bail, Result};
use camino::Utf8Path;
use clap::{Parser, Subcommand};
use tracing::*;

use crate::backend;
use crate::cancel::CancellationToken;
use crate::config::{self, Configuration};
use crate::hashing::ObjectId;
use crate::key;
use crate::repair;
use crate::snapshot;

/// Resolves a pack ID prefix to a full ID.
fn find_pack(prefix: &str, cached_backend: &backend::CachedBackend) -> Result<ObjectId> {
    if prefix.len() < 4 {
        bail!("Provide a pack ID with at least 4 digits!");
    }

    let mut matches = cached_backend
        .list_packs()?
        .into_iter()
        .filter(|pack| Utf8Path::new(pack).file_stem().unwrap().starts_with(prefix))
        .collect::<Vec<_>>();

    match matches.len() {
        0 => bail!("No packs start with {prefix}"),
        1 => backend::id_from_path(matches.pop().unwrap()),
        multiple => bail!("{multiple} different packs start with {prefix}"),
    }
}

/// Salvage a damaged repository
#[derive(Debug, Parser)]
pub struct Args {
    #[command(subcommand)]
    what: What,
}

#[derive(Debug, Subcommand)]
enum What {
    /// Salvage what's readable out of suspect packs and drop the rest
    Packs {
        /// IDs (or prefixes) of the packs to salvage
        #[clap(required = true, name = "PACK")]
        packs: Vec<String>,
    },
    /// Rewrite snapshots to route around missing data
    Snapshots {
        /// Delete the original snapshot once its replacement is written
        #[clap(long)]
        forget: bool,

        /// Snapshots to repair; defaults to every snapshot in the repository
        #[clap(name = "SNAPSHOT")]
        snapshots: Vec<String>,
    },
}

pub async fn run(config: Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    let password = config::resolve_password(&config)?;
    let cached_backend = backend::open(repository.as_std_path())?;
    let master = key::open_any(&cached_backend, &password)?;
    let format_version = config::read_repository_config(&cached_backend, &master)?.version;
    let cancel = CancellationToken::new();

    let cached_backend = Arc::new(cached_backend);
    let master = Arc::new(master);

    match args.what {
        What::Packs { packs } => {
            let ids = packs
                .iter()
                .map(|prefix| find_pack(prefix, &cached_backend))
                .collect::<Result<Vec<_>>>()?;

            let report =
                repair::repair_packs(cached_backend, master, format_version, &ids, &cancel).await?;
            info!(
                "Examined {} pack(s): salvaged {} blob(s), lost {}, dropped {} pack(s)",
                report.packs_examined, report.blobs_salvaged, report.blobs_lost, report.packs_dropped
            );
        }
        What::Snapshots { forget, snapshots } => {
            if !snapshots.is_empty() {
                for prefix in &snapshots {
                    snapshot::find(prefix, &cached_backend, &master)?;
                }
                warn!("Repairing specific snapshots isn't supported yet; repairing all of them");
            }

            let report = repair::repair_snapshots(cached_backend, master, format_version, forget, &cancel)
                .await?;
            info!(
                "Examined {} snapshot(s): rewrote {}, dropped {}, trimmed {} file(s) across {} replaced subtree(s)",
                report.snapshots_examined,
                report.snapshots_rewritten,
                report.snapshots_dropped,
                report.files_trimmed,
                report.subtrees_replaced
            );
        }
    }

    Ok(())
}
