//! Shared/exclusive repository locks, refreshed in the background for the
//! lifetime of the operation that took them.
//!
//! A lock is just another sealed, whole-object file on the backend (same
//! shape as an index or snapshot), named by a random [`ObjectId`] rather
//! than a content hash - nothing about a lock's *contents* is meant to be
//! addressable.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use jiff::{SignedDuration, Timestamp};
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::backend::CachedBackend;
use crate::cancel::CancellationToken;
use crate::crypto::MasterKey;
use crate::error::VaultError;
use crate::hashing::ObjectId;

const MAGIC_BYTES: &[u8] = b"VAULTLCK";

pub const DEFAULT_STALE_HORIZON: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockFile {
    hostname: String,
    pid: u32,
    #[serde(with = "crate::prettify::date_time")]
    time: Timestamp,
    exclusive: bool,
    uid: u32,
    gid: u32,
}

impl LockFile {
    fn here_and_now(exclusive: bool) -> Self {
        Self {
            hostname: local_hostname(),
            pid: std::process::id(),
            time: Timestamp::now(),
            exclusive,
            uid: local_uid(),
            gid: local_gid(),
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(unix)]
fn local_uid() -> u32 {
    rustix::process::getuid().as_raw()
}
#[cfg(unix)]
fn local_gid() -> u32 {
    rustix::process::getgid().as_raw()
}
#[cfg(not(unix))]
fn local_uid() -> u32 {
    0
}
#[cfg(not(unix))]
fn local_gid() -> u32 {
    0
}

/// Is the owning process of `pid` still alive, as best we can tell on this
/// platform? `None` means we can't answer and should fall back to the time
/// horizon instead.
#[cfg(unix)]
fn pid_is_alive(pid: u32) -> Option<bool> {
    let pid = rustix::process::Pid::from_raw(pid as i32)?;
    Some(rustix::process::test_kill_process(pid).is_ok())
}
#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> Option<bool> {
    None
}

fn is_stale(lock: &LockFile, horizon: Duration) -> bool {
    if lock.hostname == local_hostname() {
        if let Some(alive) = pid_is_alive(lock.pid) {
            return !alive;
        }
    }
    let age = Timestamp::now().duration_since(lock.time);
    age > SignedDuration::try_from(horizon).unwrap_or(SignedDuration::MAX)
}

fn to_bytes(lock: &LockFile, master: &MasterKey) -> Result<Vec<u8>> {
    let mut plaintext = MAGIC_BYTES.to_vec();
    ciborium::ser::into_writer(lock, &mut plaintext)?;
    Ok(master.seal(&plaintext))
}

fn from_bytes(sealed: &[u8], master: &MasterKey) -> Result<LockFile> {
    let plaintext = master.open(sealed).context("Couldn't decrypt lock")?;
    anyhow::ensure!(
        plaintext.len() >= MAGIC_BYTES.len() && &plaintext[..MAGIC_BYTES.len()] == MAGIC_BYTES,
        "Wrong magic bytes for lock file"
    );
    let lock: LockFile = ciborium::de::from_reader(&plaintext[MAGIC_BYTES.len()..])
        .context("CBOR decoding of lock file failed")?;
    Ok(lock)
}

/// Reads every lock currently on the backend, dropping (and logging) any
/// that fail to decrypt - a half-written lock from a crashed process
/// shouldn't wedge everyone else out.
fn read_all(cached_backend: &CachedBackend, master: &MasterKey) -> Result<Vec<(ObjectId, LockFile)>> {
    let mut out = Vec::new();
    for name in cached_backend.list_locks()? {
        let id: ObjectId = name.parse().with_context(|| format!("Bad lock name {name}"))?;
        match cached_backend
            .read_lock(&id)
            .and_then(|bytes| from_bytes(&bytes, master))
        {
            Ok(lock) => out.push((id, lock)),
            Err(e) => warn!("Ignoring unreadable lock {id}: {e:?}"),
        }
    }
    Ok(out)
}

/// An acquired lock. Refreshed in the background until dropped; dropping
/// stops the refresh task and removes the lock file.
pub struct LockGuard {
    backend: CachedBackend,
    id: ObjectId,
    refresh_cancel: CancellationToken,
    refresh_handle: Option<tokio::task::JoinHandle<()>>,
}

impl LockGuard {
    fn acquire(
        backend: CachedBackend,
        master: std::sync::Arc<MasterKey>,
        exclusive: bool,
        caller_cancel: CancellationToken,
    ) -> Result<Self> {
        let existing = read_all(&backend, &master)?;
        let live = existing
            .iter()
            .filter(|(_, l)| !is_stale(l, DEFAULT_STALE_HORIZON));

        for (other_id, other) in live {
            if exclusive || other.exclusive {
                bail!(VaultError::Locked)
                    .with_context(|| format!("Blocked by lock {other_id} held by {}", other.hostname));
            }
        }

        let lock = LockFile::here_and_now(exclusive);
        let id = ObjectId::hash(&rand::random::<[u8; 32]>());
        backend
            .write_lock(&id, &to_bytes(&lock, &master)?)
            .context("Couldn't write lock file")?;
        debug!("Acquired {} lock {id}", if exclusive { "exclusive" } else { "shared" });

        let refresh_cancel = CancellationToken::new();
        let refresh_handle = Some(tokio::spawn(refresh_task(
            backend.clone(),
            master,
            id,
            exclusive,
            refresh_cancel.clone(),
            caller_cancel,
        )));

        Ok(Self {
            backend,
            id,
            refresh_cancel,
            refresh_handle,
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.refresh_cancel.cancel();
        if let Some(handle) = self.refresh_handle.take() {
            handle.abort();
        }
        if let Err(e) = self.backend.remove_lock(&self.id) {
            warn!("Couldn't remove lock {}: {e:?}", self.id);
        } else {
            debug!("Released lock {}", self.id);
        }
    }
}

async fn refresh_task(
    backend: CachedBackend,
    master: std::sync::Arc<MasterKey>,
    mut id: ObjectId,
    exclusive: bool,
    refresh_cancel: CancellationToken,
    caller_cancel: CancellationToken,
) {
    loop {
        if crate::cancel::sleep_or_cancelled(DEFAULT_REFRESH_INTERVAL, &refresh_cancel).await {
            return;
        }

        if backend.read_lock(&id).is_err() {
            error!("Lock {id} vanished out from under us - aborting");
            caller_cancel.cancel();
            return;
        }

        let lock = LockFile::here_and_now(exclusive);
        let new_id = ObjectId::hash(&rand::random::<[u8; 32]>());
        let bytes = match to_bytes(&lock, &master) {
            Ok(b) => b,
            Err(e) => {
                error!("Couldn't seal refreshed lock: {e:?}");
                continue;
            }
        };
        if let Err(e) = backend.write_lock(&new_id, &bytes) {
            error!("Couldn't write refreshed lock: {e:?}");
            continue;
        }
        if let Err(e) = backend.remove_lock(&id) {
            warn!("Couldn't remove superseded lock {id}: {e:?}");
        }
        trace!("Refreshed lock {id} -> {new_id}");
        id = new_id;
    }
}

pub fn acquire_shared(
    backend: CachedBackend,
    master: std::sync::Arc<MasterKey>,
    caller_cancel: CancellationToken,
) -> Result<LockGuard> {
    LockGuard::acquire(backend, master, false, caller_cancel)
}

pub fn acquire_exclusive(
    backend: CachedBackend,
    master: std::sync::Arc<MasterKey>,
    caller_cancel: CancellationToken,
) -> Result<LockGuard> {
    LockGuard::acquire(backend, master, true, caller_cancel)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_round_trips() -> Result<()> {
        let master = MasterKey::generate();
        let lock = LockFile::here_and_now(true);
        let bytes = to_bytes(&lock, &master)?;
        let reparsed = from_bytes(&bytes, &master)?;
        assert_eq!(lock, reparsed);
        Ok(())
    }

    #[test]
    fn fresh_lock_is_not_stale() {
        let lock = LockFile::here_and_now(false);
        assert!(!is_stale(&lock, DEFAULT_STALE_HORIZON));
    }

    #[test]
    fn old_lock_on_other_host_is_stale_by_horizon() {
        let mut lock = LockFile::here_and_now(false);
        lock.hostname = "some-other-machine".to_string();
        lock.time = Timestamp::now() - SignedDuration::from_hours(1);
        assert!(is_stale(&lock, DEFAULT_STALE_HORIZON));
    }

    #[test]
    fn dead_pid_on_this_host_is_stale_even_if_recent() {
        let mut lock = LockFile::here_and_now(false);
        // PID 0 isn't a real process we could be; on platforms where we
        // can tell, this should read as dead regardless of how fresh `time` is.
        lock.pid = 0;
        if pid_is_alive(0).is_some() {
            assert!(is_stale(&lock, DEFAULT_STALE_HORIZON));
        }
    }
}
