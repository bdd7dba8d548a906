//! # Zircon - Distributed Blob Storage Core
//!
//! Zircon maps opaque chunk numbers to replicated, versioned byte ranges in
//! the style of GFS/Colossus. This crate implements the two subsystems the
//! rest of the system hangs off:
//!
//! - the **chunkserver replication protocol**: a two-phase (prepare/commit)
//!   write path across a replica set, with per-chunk version numbers,
//!   fan-out prepare broadcast, and read-with-freshness semantics;
//! - the **metadata cache over leased blocks**: per-chunk entries packed
//!   into fixed-size blocks with an allocation bitset, each block owned by
//!   at most one frontend via a lease in an external consensus KV, written
//!   with optimistic block-version CAS and redirect-on-miss.
//!
//! The storage engine under a chunkserver, the consensus KV, and the HTTP
//! transport are consumed through traits ([`chunkserver::ChunkStore`],
//! [`lease::KvStore`], [`chunkserver::Connector`]); in-memory
//! implementations back the tests and single-process deployments.
//!
//! ## Write path
//!
//! ```text
//! client ── resolve chunk ──> metadata cache (redirects if not owner)
//!        ── StartWriteReplicated ──> primary replica ──> peers
//!        ── CommitWrite(hash, old, new) ──> every replica
//!        ── bump entry version ──> metadata cache
//! ```

pub mod chunkserver;
pub mod config;
pub mod error;
pub mod lease;
pub mod logging;
pub mod metadata;
pub mod model;
pub mod rpc;

pub use crate::chunkserver::{
    Chunkserver, Connector, LocalChunkserver, LocalConnector, MemoryChunkStore, ReplicaEngine,
    WriteDriver,
};
pub use crate::error::{Result, ZirconError};
pub use crate::lease::{LeaseAgent, MemoryKv};
pub use crate::metadata::{MetadataCache, MetadataEntry};
pub use crate::model::{fingerprint, BlockId, ChunkNum, ServerAddress, ServerName, Version};
