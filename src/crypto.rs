//! Authenticated encryption of every persisted unit.
//!
//! Every blob, index file, snapshot, key envelope body, and lock file is
//! independently sealed as `nonce(12) || ciphertext || tag(16)` under
//! AES-256-GCM-SIV, the AEAD declared by this crate's key-handling
//! grandparent (`jLantxa-backup`'s `SecureStorage`), generalized here from
//! "one file, one password-derived key" to "one repository master key,
//! shared by as many [key envelopes](crate::key) as there are passwords."
//!
//! A failed MAC verification surfaces as [`crate::error::VaultError::CorruptData`].

use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use aes_gcm_siv::aead::Aead;
use anyhow::{Context, Result, bail, ensure};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};

use crate::error::VaultError;

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;

/// The repository's 256-bit master key, held only in memory.
#[derive(Clone)]
pub struct MasterKey(SecretBox<[u8; KEY_LENGTH]>);

impl MasterKey {
    pub fn new(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    fn cipher(&self) -> Aes256GcmSiv {
        Aes256GcmSiv::new(self.0.expose_secret().into())
    }

    /// Exposes the raw key bytes for exactly as long as it takes to re-seal
    /// them under a different password (see [`crate::key::add_password`]).
    /// Not a general-purpose export: nothing outside this crate sees it.
    pub(crate) fn expose(&self) -> &[u8; KEY_LENGTH] {
        self.0.expose_secret()
    }

    /// Seals `plaintext` under a fresh random nonce, returning
    /// `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .expect("AES-256-GCM-SIV encryption is infallible for any plaintext length we use");

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Opens a `nonce || ciphertext || tag` blob sealed by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        ensure!(
            sealed.len() >= NONCE_LENGTH + TAG_LENGTH,
            "Sealed data is too short to contain a nonce and tag"
        );
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::CorruptData {
                what: "encrypted object".to_string(),
            })
            .context("AEAD verification failed")
    }
}

/// Key derivation parameters for stretching a password into a KDF key.
/// Persisted per key file (see [`crate::key`]) so they can be checked on
/// open without ever inventing undocumented defaults later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // Argon2id defaults recommended by RFC 9106 for interactive use.
        Self {
            m_cost_kib: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

/// Stretches `password` with Argon2id under `salt` and `params` into a
/// 256-bit key suitable for sealing a key envelope.
pub fn stretch_password(password: &str, salt: &[u8], params: &KdfParams) -> Result<MasterKey> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let argon_params = Params::new(
        params.m_cost_kib,
        params.t_cost,
        params.p_cost,
        Some(KEY_LENGTH),
    )
    .map_err(|e| anyhow::anyhow!("Invalid KDF parameters: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut out = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| anyhow::anyhow!("Key derivation failed: {e}"))?;

    Ok(MasterKey::new(out))
}

pub fn random_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Wrong-password detection: every key envelope fails to open; this is
/// surfaced by [`crate::key::open_any`] as `VaultError::BadPassword`.
pub fn bad_password_if_all_failed(results: &[Result<MasterKey>]) -> Result<()> {
    if !results.is_empty() && results.iter().all(|r| r.is_err()) {
        bail!(VaultError::BadPassword);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let key = MasterKey::generate();
        let plaintext = b"some tree bytes, or a chunk, or anything really";
        let sealed = key.seal(plaintext);
        let opened = key.open(&sealed).unwrap();
        assert_eq!(&opened, plaintext);
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let key = MasterKey::generate();
        let sealed = key.seal(b"");
        let opened = key.open(&sealed).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let key = MasterKey::generate();
        let mut sealed = key.seal(b"hello vault");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(key.open(&sealed).is_err());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let a = MasterKey::generate();
        let b = MasterKey::generate();
        let sealed = a.seal(b"hello vault");
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn password_stretching_is_deterministic_given_the_same_salt() {
        let params = KdfParams::default();
        let salt = random_salt();
        let a = stretch_password("hunter2", &salt, &params).unwrap();
        let b = stretch_password("hunter2", &salt, &params).unwrap();
        let plaintext = b"determinism check";
        let sealed = a.seal(plaintext);
        assert_eq!(b.open(&sealed).unwrap(), plaintext);
    }
}
