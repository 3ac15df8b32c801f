use anyhow::Result;
use camino::Utf8Path;

use crate::backend;
use crate::config::{self, Configuration};
use crate::key;
use crate::snapshot;

pub fn run(config: Configuration, repository: &Utf8Path) -> Result<()> {
    let password = config::resolve_password(&config)?;
    let cached_backend = backend::open(repository.as_std_path())?;
    let master = key::open_any(&cached_backend, &password)?;
    let snapshots = snapshot::load_chronologically(&cached_backend, &master)?;

    for (snapshot, id) in snapshots.into_iter().rev() {
        print!("snapshot {}", id);
        if snapshot.tags.is_empty() {
            println!();
        } else {
            println!(
                " ({})",
                snapshot.tags.into_iter().collect::<Vec<String>>().join(" ")
            );
        }
        println!("Author: {}@{}", snapshot.username, snapshot.hostname);
        println!("Date:   {}", snapshot.time);
        for path in snapshot.paths {
            println!("    - {path}");
        }

        println!();
    }

    Ok(())
}
