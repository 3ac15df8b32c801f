use anyhow::{bail, Result};
use camino::Utf8Path;
use clap::Parser;
use tracing::*;

use crate::backend;
use crate::cancel::CancellationToken;
use crate::check::{self, DataCheck, Subset};
use crate::config::{self, Configuration};
use crate::key;

/// Check the repository for errors
///
/// By default this assumes file integrity of the backup, and only ensures
/// that packs named by the index can be found and that their stored sizes
/// match. Pass --read-all or --read-data-subset to re-read and MAC-verify
/// actual pack contents.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct Args {
    /// Re-read and verify every pack's data, not just its presence and size
    #[clap(long, conflicts_with = "read_data_subset")]
    read_all: bool,

    /// Re-read and verify a subset of packs' data: "n/m", "x%", or a byte size
    #[clap(long, name = "SUBSET")]
    read_data_subset: Option<String>,
}

pub fn run(config: Configuration, repository: &Utf8Path, args: Args) -> Result<()> {
    let data_check = if args.read_all {
        DataCheck::All
    } else if let Some(subset) = &args.read_data_subset {
        DataCheck::Subset(Subset::parse(subset)?)
    } else {
        DataCheck::None
    };

    let password = config::resolve_password(&config)?;
    let cached_backend = backend::open(repository.as_std_path())?;
    let master = key::open_any(&cached_backend, &password)?;
    let cancel = CancellationToken::new();

    let report = check::check(&cached_backend, &master, data_check, &cancel)?;

    for pack_id in &report.missing_ignorable_packs {
        info!("Empty pack {pack_id} is named by the index but absent from the backend");
    }
    for pack_id in &report.orphaned_packs {
        info!("Pack {pack_id} isn't referenced by any index");
    }
    for pack_id in &report.size_mismatches {
        error!("Pack {pack_id}'s stored size doesn't match its manifest");
    }
    for (pack_id, e) in &report.corrupt_packs {
        error!("Pack {pack_id} failed verification: {e:?}");
    }
    if !report.unused_blobs.is_empty() {
        info!(
            "{} blob(s) aren't referenced by any snapshot - consider `vaultpak prune`",
            report.unused_blobs.len()
        );
    }
    info!("{} pack(s) had their data re-read and verified", report.packs_checked);

    if report.is_ok() {
        Ok(())
    } else {
        bail!("Check failed!");
    }
}
