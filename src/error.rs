use std::io;

use thiserror::Error;

use crate::model::{ServerName, Version};

pub type Result<T> = std::result::Result<T, ZirconError>;

/// Crate-wide error type shared by the replica engine, the metadata layer,
/// and the RPC adapters.
///
/// Variants fall into retry classes the callers rely on: `VersionMismatch`
/// is retried only by the metadata cache's CAS loop, `NotOwner` is a
/// redirect and never retried locally, and `Transport`/`Timeout` may be
/// retried by the caller with backoff but never by the core itself.
#[derive(Debug, Error)]
pub enum ZirconError {
    /// A `(old_version, new_version)` or previous-entry check failed.
    /// Non-retryable without re-reading current state.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// An optimistic block-version CAS lost the race.
    #[error("block version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u64, found: u64 },
    /// The lease for the target block is not held here. `owner` names the
    /// current holder for client re-dispatch; empty when no holder is known.
    #[error("not the lease owner (current owner: {owner})")]
    NotOwner { owner: ServerName },
    /// A read asked for a fresher version than this replica has committed.
    #[error("replica is stale at version {current}")]
    StaleReplica { current: Version },
    /// Chunk, entry, or block absent.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Bounded retries exhausted while racing other agents for a block.
    #[error("contended: {0}")]
    Contended(&'static str),
    /// A wire call exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Network-layer failure below the RPC adapters.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Stored bytes failed validation. May indicate on-disk or in-KV damage.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Invariant violation inside the core.
    #[error("internal error: {0}")]
    Internal(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ZirconError {
    /// True for the classes a caller may retry after re-reading state or
    /// backing off. Mutations are never retried transparently by the core.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ZirconError::VersionMismatch { .. }
                | ZirconError::Contended(_)
                | ZirconError::Timeout(_)
                | ZirconError::Transport(_)
        )
    }

    /// The redirect target carried by `NotOwner`, if any.
    pub fn redirect(&self) -> Option<&ServerName> {
        match self {
            ZirconError::NotOwner { owner } if !owner.is_empty() => Some(owner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classes() {
        assert!(ZirconError::VersionMismatch { expected: 1, found: 2 }.is_retryable());
        assert!(ZirconError::Timeout("deadline".into()).is_retryable());
        assert!(!ZirconError::PreconditionFailed("old version".into()).is_retryable());
        assert!(!ZirconError::NotOwner { owner: "b".into() }.is_retryable());
    }

    #[test]
    fn redirect_only_when_owner_known() {
        let err = ZirconError::NotOwner { owner: "frontend-2".into() };
        assert_eq!(err.redirect().map(|s| s.as_str()), Some("frontend-2"));
        let unknown = ZirconError::NotOwner { owner: ServerName::default() };
        assert!(unknown.redirect().is_none());
    }
}
