use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::Level;

use vaultpak::config::{self, Configuration};
use vaultpak::error::VaultError;
use vaultpak::ui;

/// A content-addressed, encrypted, deduplicating backup repository engine.
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Prepend timestamps to trace messages (from --verbose). Useful for benchmarking.
    #[arg(short, long)]
    timestamps: bool,

    /// Repository to operate on, if not set in the config file or VAULTPAK_REPOSITORY.
    #[arg(short, long, name = "PATH")]
    repository: Option<Utf8PathBuf>,

    #[command(subcommand)]
    subcommand: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new, empty repository
    Init,
    /// Create a snapshot of the given files and directories
    Backup(ui::backup::Args),
    /// Print objects (as JSON) to stdout
    Cat(ui::cat::Args),
    /// Check the repository for errors
    Check(ui::check::Args),
    /// Copy snapshots from one repository to another
    Copy(ui::copy::Args),
    /// Compare two snapshots, or a snapshot to the current tree
    Diff(ui::diff::Args),
    /// Print a given file or directory from a given snapshot
    Dump(ui::dump::Args),
    /// Copy a snapshot, filtering out given paths
    FilterSnapshot(ui::filter_snapshot::Args),
    /// Forget snapshots
    Forget(ui::forget::Args),
    /// List the files in a given snapshot
    Ls(ui::ls::Args),
    /// Remove unused data and repack packs left mostly-unused by it
    Prune(ui::prune::Args),
    /// Rebuild the master index from the packs on the backend
    RebuildIndex,
    /// Salvage a damaged repository
    Repair(ui::repair::Args),
    /// Restore a snapshot onto the filesystem
    Restore(ui::restore::Args),
    /// List all snapshots in the repository
    Snapshots,
    /// Add, remove, or replace a snapshot's tags
    Tag(ui::tag::Args),
    /// Show how much space each snapshot uses (and uniquely owns)
    Usage,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose, args.timestamps);

    if let Err(e) = run(args).await {
        tracing::error!("{e:#}");
        std::process::exit(VaultError::exit_code_for(&e));
    }
}

async fn run(args: Args) -> Result<()> {
    let config = config::load()?;
    let repository = args
        .repository
        .clone()
        .or_else(|| config.repository.clone())
        .or_else(|| std::env::var("VAULTPAK_REPOSITORY").ok().map(Utf8PathBuf::from))
        .ok_or_else(|| {
            anyhow::Error::new(VaultError::Configuration(
                "no repository given (--repository, config file, or VAULTPAK_REPOSITORY)".to_string(),
            ))
        })?;

    dispatch(config, &repository, args.subcommand).await
}

async fn dispatch(
    config: Configuration,
    repository: &camino::Utf8Path,
    subcommand: Command,
) -> Result<()> {
    match subcommand {
        Command::Init => ui::init::run(repository),
        Command::Backup(a) => ui::backup::run(config, repository, a).await,
        Command::Cat(a) => ui::cat::run(config, repository, a),
        Command::Check(a) => ui::check::run(config, repository, a),
        Command::Copy(a) => ui::copy::run(config, repository, a).await,
        Command::Diff(a) => ui::diff::run(config, repository, a),
        Command::Dump(a) => ui::dump::run(config, repository, a),
        Command::FilterSnapshot(a) => ui::filter_snapshot::run(config, repository, a).await,
        Command::Forget(a) => ui::forget::run(config, repository, a),
        Command::Ls(a) => ui::ls::run(config, repository, a),
        Command::Prune(a) => ui::prune::run(config, repository, a).await,
        Command::RebuildIndex => ui::rebuild_index::run(config, repository).await,
        Command::Repair(a) => ui::repair::run(config, repository, a).await,
        Command::Restore(a) => ui::restore::run(config, repository, a),
        Command::Snapshots => ui::snapshots::run(config, repository),
        Command::Tag(a) => ui::tag::run(config, repository, a),
        Command::Usage => ui::usage::run(config, repository),
    }
}

/// Set up tracing-subscriber to spit messages to stderr.
fn init_tracing(verbosity: u8, timestamps: bool) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(true);

    if timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}
