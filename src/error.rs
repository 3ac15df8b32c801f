//! The closed error taxonomy the rest of the crate reports through.
//!
//! Everything still flows as `anyhow::Result`, but callers that need to
//! dispatch on *kind* - mainly `main.rs` picking an exit code, and the lock
//! manager distinguishing "doesn't exist" from "exists but is stale" -
//! downcast the outermost `anyhow::Error` against this enum.

use std::fmt;

use crate::hashing::ObjectId;

#[derive(Debug, Clone)]
pub enum VaultError {
    /// Missing/invalid flag, env var, or repository URL.
    Configuration(String),
    /// Backend authentication/permission failure.
    Access(String),
    /// A requested object doesn't exist on the backend.
    NotExist { kind: String, name: String },
    /// An exclusive lock exists, or a shared lock blocks an exclusive request.
    Locked,
    /// Every key envelope failed to open under the supplied password.
    BadPassword,
    /// MAC verification failed on a blob, index, snapshot, or lock.
    CorruptData { what: String },
    /// A pack is truncated or otherwise unreadable.
    PackError {
        pack_id: ObjectId,
        truncated: bool,
        orphaned: bool,
    },
    /// One or more blobs referenced by a snapshot are missing from the index.
    IndexIncomplete(Vec<ObjectId>),
    /// The index references a pack absent from the backend that still
    /// contains at least one needed blob.
    PacksMissing(Vec<ObjectId>),
    /// A pack's stored size didn't match the size implied by its index entry.
    SizeNotMatching { pack_id: ObjectId },
    /// One or more node errors were found while walking a tree.
    TreeError(Vec<String>),
    /// Cooperative cancellation was observed.
    Cancelled,
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            VaultError::Access(msg) => write!(f, "access error: {msg}"),
            VaultError::NotExist { kind, name } => write!(f, "{kind} {name} does not exist"),
            VaultError::Locked => write!(f, "repository is locked"),
            VaultError::BadPassword => write!(f, "incorrect password"),
            VaultError::CorruptData { what } => write!(f, "corrupt data: {what}"),
            VaultError::PackError {
                pack_id,
                truncated,
                orphaned,
            } => write!(
                f,
                "pack {pack_id} error (truncated: {truncated}, orphaned: {orphaned})"
            ),
            VaultError::IndexIncomplete(ids) => {
                write!(f, "{} blob(s) missing from the index", ids.len())
            }
            VaultError::PacksMissing(ids) => {
                write!(f, "{} needed pack(s) missing from the backend", ids.len())
            }
            VaultError::SizeNotMatching { pack_id } => {
                write!(f, "pack {pack_id}'s stored size doesn't match its index")
            }
            VaultError::TreeError(errs) => write!(f, "{} error(s) walking a tree", errs.len()),
            VaultError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for VaultError {}

impl VaultError {
    /// Maps an error kind to the process exit code named in the external
    /// interface spec: 0 success, 1 generic, 10 no such repo, 11 locked,
    /// 12 bad password.
    pub fn exit_code(&self) -> i32 {
        match self {
            VaultError::NotExist { kind, .. } if kind == "repository" => 10,
            VaultError::Locked => 11,
            VaultError::BadPassword => 12,
            _ => 1,
        }
    }

    /// Finds a `VaultError`'s exit code anywhere in an error chain, falling
    /// back to the generic failure code.
    pub fn exit_code_for(err: &anyhow::Error) -> i32 {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<VaultError>())
            .map(VaultError::exit_code)
            .unwrap_or(1)
    }
}
