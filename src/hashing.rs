//! Tools for hashing everything we care about into a unique [`ObjectId`].

use std::fmt;
use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use data_encoding::BASE32_DNSSEC as BASE32HEX;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, digest::Output};

type Sha256Digest = Output<Sha256>;

/// The content hash used to identify every object in the repository:
/// a plain SHA-256 digest of the object's plaintext.
///
/// Every persisted object (blob, tree, snapshot, index, pack, key, lock) is
/// named by one of these. `(type, id)` is unique within a repository.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId {
    digest: Sha256Digest,
}

impl ObjectId {
    /// Calculates an ID from the given plaintext bytes.
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(bytes),
        }
    }

    fn from_digest(digest: Sha256Digest) -> Self {
        Self { digest }
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8] {
        self.digest.as_slice()
    }

    /// Builds an ID from a caller-verified 32-byte digest (e.g. loaded off
    /// disk and checked against a recomputed hash).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() == 32, "Expected a 32-byte object ID");
        Ok(Self::from_digest(*Sha256Digest::from_slice(bytes)))
    }

    /// Gets a git-like shortened version of the hash, unique enough for
    /// most UI uses.
    pub fn short_name(&self) -> String {
        let mut full = format!("{self}");
        let _rest = full.split_off(8);
        full
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ digest: {} }}", BASE32HEX.encode(&self.digest))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE32HEX.encode(&self.digest))
    }
}

impl std::str::FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE32HEX
            .decode(s.as_bytes())
            .with_context(|| format!("Couldn't decode {s} as base32"))?;
        ensure!(bytes.len() == 32, "Expected a 32-byte base32 object ID");
        Ok(ObjectId::from_digest(*Sha256Digest::from_slice(&bytes)))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // We store IDs compactly (raw bytes) everywhere on disk, but want
        // hex when printing objects for humans (`cat`, `ls`, `--json`).
        // serde has no "depends on the serializer's purpose" knob, so we
        // hijack a process-global flag set once at startup. See prettify.rs.
        if crate::prettify::should_prettify() {
            serializer.serialize_str(&BASE32HEX.encode(self.digest.as_slice()))
        } else {
            serializer.serialize_bytes(self.digest.as_slice())
        }
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<ObjectId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(ObjectId::from_digest(*Sha256Digest::from_slice(&bytes)))
    }
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectId, R) {
        (ObjectId::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectId, W) {
        (ObjectId::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DEVELOPERS: &[u8] = b"Developers, developers, developers, developers!".as_slice();

    #[test]
    fn smoke() {
        let id = ObjectId::hash(DEVELOPERS);
        assert_eq!(id.as_bytes().len(), 32);
        // sha256("Developers, developers, developers, developers!")
        assert_eq!(format!("{id}").len(), 52); // base32hex of 32 bytes, no padding
    }

    #[test]
    fn round_trips_through_string() {
        let id = ObjectId::hash(DEVELOPERS);
        let s = format!("{id}");
        let parsed: ObjectId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn reader() -> Result<()> {
        let mut r = HashingReader::new(DEVELOPERS);
        io::copy(&mut r, &mut io::sink())?;
        let (hashed, _) = r.finalize();
        assert_eq!(hashed, ObjectId::hash(DEVELOPERS));
        Ok(())
    }

    #[test]
    fn writer() -> Result<()> {
        let mut w = HashingWriter::new(io::sink());
        w.write_all(DEVELOPERS)?;
        let (hashed, _) = w.finalize();
        assert_eq!(hashed, ObjectId::hash(DEVELOPERS));
        Ok(())
    }

    #[test]
    fn empty_blob_has_a_well_defined_id() {
        let a = ObjectId::hash(b"");
        let b = ObjectId::hash(b"");
        assert_eq!(a, b);
    }
}
