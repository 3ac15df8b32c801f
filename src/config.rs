//! Client-local configuration, distinct from the in-repository [`RepositoryConfig`].
//!
//! Lives at `~/.config/vaultpak.toml`; entirely optional, defaults apply
//! when it (or any field in it) is missing.

use std::{env, fs, io};
use std::io::Write;
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};

use crate::backend::CachedBackend;
use crate::crypto::MasterKey;
use crate::file_util::check_magic;

/// How to obtain the repository password without a terminal prompt.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PasswordSource {
    /// Read the password verbatim from a file.
    File(Utf8PathBuf),
    /// Run a command and take its stdout (trimmed) as the password.
    Command(String),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Configuration {
    /// Default repository, used when `--repository` / `VAULTPAK_REPOSITORY` are unset.
    pub repository: Option<Utf8PathBuf>,
    /// Caps concurrent backend calls; falls back to the backend's own hint when unset.
    pub connections: Option<usize>,
    pub password: Option<PasswordSource>,
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "vaultpak.toml"]);

    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;

    toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))
}

/// Resolves the repository password, trying (in order) `VAULTPAK_PASSWORD`,
/// `VAULTPAK_PASSWORD_FILE`, `VAULTPAK_PASSWORD_COMMAND`, the config file's
/// `password` source, and finally an interactive prompt on stdin.
pub fn resolve_password(config: &Configuration) -> Result<String> {
    if let Ok(p) = env::var("VAULTPAK_PASSWORD") {
        return Ok(p);
    }
    if let Ok(path) = env::var("VAULTPAK_PASSWORD_FILE") {
        return read_password_file(Utf8PathBuf::from(path).as_path());
    }
    if let Ok(cmd) = env::var("VAULTPAK_PASSWORD_COMMAND") {
        return run_password_command(&cmd);
    }

    match &config.password {
        Some(PasswordSource::File(path)) => read_password_file(path),
        Some(PasswordSource::Command(cmd)) => run_password_command(cmd),
        None => prompt_password(),
    }
}

fn read_password_file(path: &camino::Utf8Path) -> Result<String> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Couldn't read password file {path}"))?;
    Ok(contents.trim_end_matches(['\r', '\n']).to_string())
}

fn run_password_command(cmd: &str) -> Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .with_context(|| format!("Couldn't run password command `{cmd}`"))?;
    if !output.status.success() {
        bail!("Password command `{cmd}` exited with {}", output.status);
    }
    let stdout = String::from_utf8(output.stdout)
        .with_context(|| format!("Password command `{cmd}` didn't print UTF-8"))?;
    Ok(stdout.trim_end_matches(['\r', '\n']).to_string())
}

fn prompt_password() -> Result<String> {
    eprint!("Repository password: ");
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("Couldn't read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Repository-level metadata, stored encrypted as the repository's `config` object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RepositoryConfig {
    pub version: u32,
    pub id: crate::hashing::ObjectId,
    /// FastCDC/Rabin polynomial used by the source-side chunker, persisted
    /// so that a repository's chunking stays reproducible even if the
    /// client changes machines.
    pub chunker_polynomial: u64,
}

impl RepositoryConfig {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            id: crate::hashing::ObjectId::hash(&rand::random::<[u8; 32]>()),
            chunker_polynomial: rand::random(),
        }
    }
}

const REPOSITORY_CONFIG_MAGIC: &[u8] = b"VAULTCFG";

/// Seals and writes the repository's one `config` object.
pub fn write_repository_config(
    backend: &CachedBackend,
    master: &MasterKey,
    config: &RepositoryConfig,
) -> Result<()> {
    let mut plaintext = REPOSITORY_CONFIG_MAGIC.to_vec();
    ciborium::ser::into_writer(config, &mut plaintext)?;
    backend.write_config(&master.seal(&plaintext))
}

/// Reads and unseals the repository's `config` object.
pub fn read_repository_config(backend: &CachedBackend, master: &MasterKey) -> Result<RepositoryConfig> {
    let sealed = backend.read_config()?;
    let plaintext = master.open(&sealed).context("Couldn't decrypt repository config")?;
    check_magic(&mut plaintext.as_slice(), REPOSITORY_CONFIG_MAGIC)
        .context("Wrong magic bytes for repository config")?;
    ciborium::de::from_reader(&plaintext[REPOSITORY_CONFIG_MAGIC.len()..])
        .context("CBOR decoding of repository config failed")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn repository_config_round_trips() -> Result<()> {
        let conf = RepositoryConfig::new(2);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&conf, &mut bytes)?;
        let reparsed: RepositoryConfig = ciborium::de::from_reader(bytes.as_slice())?;
        assert_eq!(conf, reparsed);
        Ok(())
    }

    #[test]
    fn client_config_defaults_when_absent() {
        let conf = Configuration::default();
        assert!(conf.repository.is_none());
        assert!(conf.connections.is_none());
    }
}
