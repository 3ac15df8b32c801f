use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;
use rustc_hash::FxHashSet;

use crate::backend;
use crate::config::{self, Configuration};
use crate::index::Index;
use crate::key;
use crate::prune;

pub async fn run(config: Configuration, repository: &Utf8Path) -> Result<()> {
    let password = config::resolve_password(&config)?;
    let cached_backend = Arc::new(backend::open(repository.as_std_path())?);
    let master = Arc::new(key::open_any(&cached_backend, &password)?);

    prune::rebuild_index(&cached_backend, master, &Index::default(), &FxHashSet::default()).await
}
