//! Defines [`Blob`], our fundamental unit of deduplication.

use serde_derive::*;

use crate::chunk::FileSpan;
use crate::hashing::ObjectId;

/// A chunk of file data, or a tree, to place in a pack.
///
/// Our fundamental unit of deduplication: everything we ever write to or
/// read from a pack is a `Blob`.
#[derive(Debug, Clone)]
pub struct Blob {
    /// The plaintext bytes.
    pub contents: Contents,
    /// The hash of said plaintext.
    pub id: ObjectId,
    /// Is the blob a chunk of file data, or a tree?
    pub kind: Type,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    /// A content-defined chunk of a file's data.
    Data,
    /// A serialized directory listing (see [`crate::tree`]).
    Tree,
}

/// Either part of a loaded file or an owned buffer.
///
/// Formerly this was some `Box<dyn AsRef<u8> + Send + Sync>`, but let's cut
/// down on the indirection where there's only a few choices.
#[derive(Debug, Clone)]
pub enum Contents {
    Buffer(Vec<u8>),
    Span(FileSpan),
}

impl Blob {
    /// Convenience method to get at the blob's contents as a byte slice.
    pub fn bytes(&self) -> &[u8] {
        match &self.contents {
            Contents::Buffer(v) => v,
            Contents::Span(s) => s.as_ref(),
        }
    }
}
