//! Key envelopes: password-derived wrappers around the repository master key.
//!
//! A repository can have several key files (multi-password), each storing a
//! KDF salt and parameters plus the master key sealed under the
//! password-stretched key. Adding a password reads the current master key
//! through any existing envelope and writes a fresh one.

use anyhow::{Context, Result, ensure};
use serde_derive::{Deserialize, Serialize};

use crate::backend::CachedBackend;
use crate::crypto::{self, KdfParams, MasterKey};
use crate::hashing::ObjectId;

const MAGIC_BYTES: &[u8] = b"VLTKEY01";

/// The on-disk (unencrypted-envelope, encrypted-payload) shape of a key file.
///
/// The envelope header (salt + KDF params) must stay in the clear: it's
/// what lets us derive the stretched key in the first place.
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    salt: Vec<u8>,
    kdf: KdfParams,
    /// `nonce || ciphertext(master key) || tag`, sealed under the
    /// password-stretched key.
    sealed_master_key: Vec<u8>,
}

/// Creates a brand new master key and the first key file sealing it.
/// Returns the master key and the envelope's ID (its content hash).
pub fn create(password: &str) -> Result<(MasterKey, ObjectId, Vec<u8>)> {
    let master = MasterKey::generate();
    let (id, bytes) = seal_new_envelope(&master, password)?;
    Ok((master, id, bytes))
}

/// Seals `master` under a freshly derived key file for `password`,
/// returning the envelope's ID and serialized bytes (plaintext CBOR; the
/// envelope's own sealing happens one layer up when it's written as an
/// object, matching every other object kind).
fn seal_new_envelope(master: &MasterKey, password: &str) -> Result<(ObjectId, Vec<u8>)> {
    let salt = crypto::random_salt();
    let kdf = KdfParams::default();
    let stretched = crypto::stretch_password(password, &salt, &kdf)?;

    let sealed_master_key = stretched.seal(master_key_bytes_for_sealing(master).as_slice());

    let file = KeyFile {
        salt: salt.to_vec(),
        kdf,
        sealed_master_key,
    };

    let mut plaintext = Vec::new();
    ciborium::into_writer(&file, &mut plaintext).context("Couldn't serialize key file")?;
    let id = ObjectId::hash(&plaintext);
    Ok((id, plaintext))
}

/// We only ever seal the master key's raw bytes, which means exposing them
/// for exactly as long as it takes to hand them to another AEAD seal call.
fn master_key_bytes_for_sealing(master: &MasterKey) -> [u8; crypto::KEY_LENGTH] {
    *master.expose()
}

/// Tries to open every key file in the repository against `password`,
/// succeeding as soon as one works. Fails with `VaultError::BadPassword`
/// (via [`crypto::bad_password_if_all_failed`]) if every envelope rejects it.
pub fn open_any(backend: &CachedBackend, password: &str) -> Result<MasterKey> {
    let key_files = backend.list_keys()?;
    ensure!(
        !key_files.is_empty(),
        "Repository has no key files; was it initialized correctly?"
    );

    let mut results = Vec::with_capacity(key_files.len());
    for name in &key_files {
        let id = crate::backend::id_from_path(name)?;
        results.push(open_one(backend, &id, password));
    }

    if let Some(Ok(master)) = results.iter().find(|r| r.is_ok()) {
        return Ok(master.clone());
    }

    crypto::bad_password_if_all_failed(&results)?;
    unreachable!("bad_password_if_all_failed would have bailed above");
}

fn open_one(backend: &CachedBackend, id: &ObjectId, password: &str) -> Result<MasterKey> {
    let bytes = backend.read_key(id)?;
    let file: KeyFile = ciborium::from_reader(bytes.as_slice())
        .with_context(|| format!("Couldn't decode key file {id}"))?;

    let stretched = crypto::stretch_password(password, &file.salt, &file.kdf)?;
    let opened = stretched.open(&file.sealed_master_key)?;
    ensure!(
        opened.len() == crypto::KEY_LENGTH,
        "Key file {id} unwrapped to the wrong key length"
    );
    let mut key_bytes = [0u8; crypto::KEY_LENGTH];
    key_bytes.copy_from_slice(&opened);
    Ok(MasterKey::new(key_bytes))
}

/// Adds a new password to the repository by re-sealing the already-opened
/// master key under a fresh salt, and uploading the resulting key file.
pub fn add_password(backend: &CachedBackend, master: &MasterKey, new_password: &str) -> Result<ObjectId> {
    let (id, bytes) = seal_new_envelope(master, new_password)?;
    backend.write_key(&id, &bytes)?;
    Ok(id)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{self, memory::MemoryBackend};

    #[test]
    fn create_then_open_round_trips() {
        let (master, id, bytes) = create("correct horse battery staple").unwrap();
        let backend = backend::open_memory();
        backend.write_key(&id, &bytes).unwrap();

        let reopened = open_any(&backend, "correct horse battery staple").unwrap();
        let plaintext = b"prove these two keys match";
        let sealed = master.seal(plaintext);
        assert_eq!(reopened.open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (_master, id, bytes) = create("hunter2").unwrap();
        let backend = backend::open_memory();
        backend.write_key(&id, &bytes).unwrap();

        let err = open_any(&backend, "wrong password").unwrap_err();
        assert!(
            err.downcast_ref::<crate::error::VaultError>()
                .map(|e| matches!(e, crate::error::VaultError::BadPassword))
                .unwrap_or(false)
        );
    }

    #[test]
    fn adding_a_password_lets_either_open_the_repo() {
        let (master, id, bytes) = create("first password").unwrap();
        let backend = backend::open_memory();
        backend.write_key(&id, &bytes).unwrap();

        add_password(&backend, &master, "second password").unwrap();

        assert!(open_any(&backend, "first password").is_ok());
        assert!(open_any(&backend, "second password").is_ok());
    }

    fn _unused(_: &MemoryBackend) {}
}
