//! Chunkserver subsystem: the replica engine, the capability trait shared by
//! in-process and wire implementations, and the replication coordinator.

pub mod coordinator;
pub mod replica;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Result, ZirconError};
use crate::model::{ChunkNum, ServerAddress, Version};

pub use coordinator::{LocalChunkserver, WriteDriver};
pub use replica::{ReplicaEngine, ReplicaMetricsSnapshot};
pub use store::{ChunkStore, MemoryChunkStore};

/// The chunkserver capability. One implementation wraps the local
/// [`ReplicaEngine`] directly; the other wraps a wire client. Callers hold
/// `Arc<dyn Chunkserver>` and never care which one they got.
#[async_trait]
pub trait Chunkserver: Send + Sync {
    async fn add(&self, chunk: ChunkNum, initial_data: Vec<u8>, version: Version) -> Result<()>;

    async fn read(
        &self,
        chunk: ChunkNum,
        offset: u32,
        length: u32,
        min_version: Version,
    ) -> Result<(Vec<u8>, Version)>;

    async fn start_write(&self, chunk: ChunkNum, offset: u32, data: Vec<u8>) -> Result<()>;

    /// Prepare-broadcasts `(offset, data)` to every replica in `replicas`,
    /// this server included. All replicas must acknowledge; the first
    /// failure is surfaced so the caller can abort before commit.
    async fn start_write_replicated(
        &self,
        chunk: ChunkNum,
        offset: u32,
        data: Vec<u8>,
        replicas: Vec<ServerAddress>,
    ) -> Result<()>;

    async fn commit_write(
        &self,
        chunk: ChunkNum,
        hash: String,
        old_version: Version,
        new_version: Version,
    ) -> Result<()>;

    async fn update_latest_version(
        &self,
        chunk: ChunkNum,
        old_version: Version,
        new_version: Version,
    ) -> Result<()>;

    /// Pulls committed content for `chunk` at (at least) `version` from
    /// `source` and installs it locally.
    async fn replicate(&self, chunk: ChunkNum, source: ServerAddress, version: Version)
        -> Result<()>;

    async fn delete(&self, chunk: ChunkNum, version: Version) -> Result<()>;

    async fn list_all_chunks(&self) -> Result<Vec<(ChunkNum, Version)>>;
}

/// Resolves a replica address to a chunkserver capability at call time.
/// Replicas know each other only by address; nothing holds a peer handle
/// across calls.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &ServerAddress) -> Result<Arc<dyn Chunkserver>>;
}

/// In-process connector backed by a registry of capabilities, for tests and
/// single-process deployments.
#[derive(Default)]
pub struct LocalConnector {
    registry: RwLock<HashMap<ServerAddress, Arc<dyn Chunkserver>>>,
}

impl LocalConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, address: ServerAddress, server: Arc<dyn Chunkserver>) {
        self.registry.write().insert(address, server);
    }
}

impl Connector for LocalConnector {
    fn connect(&self, address: &ServerAddress) -> Result<Arc<dyn Chunkserver>> {
        self.registry
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| ZirconError::Transport(format!("no route to {address}")))
    }
}
