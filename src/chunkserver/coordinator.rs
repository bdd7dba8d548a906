//! Coordinator side of the replication protocol.
//!
//! [`LocalChunkserver`] fronts a [`ReplicaEngine`] with the capability trait
//! and adds the fan-out prepare broadcast. [`WriteDriver`] runs the full
//! two-phase protocol a client (or the metadata layer acting for one)
//! drives against a replica set.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, warn};

use crate::chunkserver::replica::ReplicaEngine;
use crate::chunkserver::{Chunkserver, Connector};
use crate::error::{Result, ZirconError};
use crate::metadata::MetadataEntry;
use crate::model::{fingerprint, ChunkNum, ServerAddress, Version};

/// In-process chunkserver capability wrapping the local engine. `address`
/// is this server's own identity; prepare fan-out short-circuits it to the
/// engine instead of dialing itself.
pub struct LocalChunkserver {
    address: ServerAddress,
    engine: Arc<ReplicaEngine>,
    connector: Arc<dyn Connector>,
}

impl LocalChunkserver {
    pub fn new(
        address: ServerAddress,
        engine: Arc<ReplicaEngine>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            engine,
            connector,
        })
    }

    pub fn engine(&self) -> &Arc<ReplicaEngine> {
        &self.engine
    }
}

#[async_trait]
impl Chunkserver for LocalChunkserver {
    async fn add(&self, chunk: ChunkNum, initial_data: Vec<u8>, version: Version) -> Result<()> {
        self.engine.add(chunk, initial_data, version)
    }

    async fn read(
        &self,
        chunk: ChunkNum,
        offset: u32,
        length: u32,
        min_version: Version,
    ) -> Result<(Vec<u8>, Version)> {
        self.engine.read(chunk, offset, length, min_version)
    }

    async fn start_write(&self, chunk: ChunkNum, offset: u32, data: Vec<u8>) -> Result<()> {
        self.engine.start_write(chunk, offset, data)
    }

    async fn start_write_replicated(
        &self,
        chunk: ChunkNum,
        offset: u32,
        data: Vec<u8>,
        replicas: Vec<ServerAddress>,
    ) -> Result<()> {
        if replicas.is_empty() {
            return Err(ZirconError::InvalidArgument(
                "replica set must be non-empty".into(),
            ));
        }
        let prepares = replicas.iter().map(|address| {
            let data = data.clone();
            let address = address.clone();
            async move {
                if address == self.address {
                    self.engine.start_write(chunk, offset, data)
                } else {
                    self.connector
                        .connect(&address)?
                        .start_write(chunk, offset, data)
                        .await
                }
            }
        });
        try_join_all(prepares).await?;
        debug!(%chunk, replicas = replicas.len(), "prepare broadcast acknowledged");
        Ok(())
    }

    async fn commit_write(
        &self,
        chunk: ChunkNum,
        hash: String,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        self.engine.commit_write(chunk, &hash, old_version, new_version)
    }

    async fn update_latest_version(
        &self,
        chunk: ChunkNum,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        self.engine.update_latest_version(chunk, old_version, new_version)
    }

    async fn replicate(
        &self,
        chunk: ChunkNum,
        source: ServerAddress,
        version: Version,
    ) -> Result<()> {
        if self.engine.has_version(chunk, version)? {
            return Ok(());
        }
        let peer = self.connector.connect(&source)?;
        let (data, fetched) = peer.read(chunk, 0, u32::MAX, version).await?;
        self.engine.install_replicated(chunk, fetched, data)
    }

    async fn delete(&self, chunk: ChunkNum, version: Version) -> Result<()> {
        self.engine.delete(chunk, version)
    }

    async fn list_all_chunks(&self) -> Result<Vec<(ChunkNum, Version)>> {
        self.engine.list_all_chunks()
    }
}

/// Runs the client side of the two-phase write protocol against the replica
/// set recorded in a metadata entry.
pub struct WriteDriver {
    connector: Arc<dyn Connector>,
}

impl WriteDriver {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Writes `(offset, data)` to every replica of `chunk`, advancing it
    /// from `entry.version` to the successor version, which is returned.
    ///
    /// Prepare goes through the primary (first replica) as one broadcast;
    /// any prepare failure aborts before commit. Commit is then attempted
    /// on every replica: a replica failing its commit precondition is out
    /// of sync and gets flagged via `update_latest_version` so its reads
    /// report staleness until `replicate` catches it up. Commit succeeding
    /// nowhere fails the write with the first replica's error.
    pub async fn write(
        &self,
        chunk: ChunkNum,
        offset: u32,
        data: Vec<u8>,
        entry: &MetadataEntry,
    ) -> Result<Version> {
        let primary = entry
            .replicas
            .first()
            .ok_or_else(|| ZirconError::InvalidArgument("entry has no replicas".into()))?;
        let old_version = entry.version;
        let new_version = old_version.next();
        let hash = fingerprint(&data);

        self.connector
            .connect(primary)?
            .start_write_replicated(chunk, offset, data, entry.replicas.clone())
            .await?;

        let mut lagging: Vec<&ServerAddress> = Vec::new();
        let mut committed = 0usize;
        let mut first_error: Option<ZirconError> = None;
        for address in &entry.replicas {
            let outcome = self
                .connector
                .connect(address)?
                .commit_write(chunk, hash.clone(), old_version, new_version)
                .await;
            match outcome {
                Ok(()) => committed += 1,
                Err(ZirconError::PreconditionFailed(reason)) => {
                    warn!(%chunk, %address, %reason, "replica failed commit; marking stale");
                    lagging.push(address);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if committed == 0 {
            return Err(first_error.unwrap_or_else(|| {
                ZirconError::PreconditionFailed(format!(
                    "no replica committed chunk {chunk} at version {new_version}"
                ))
            }));
        }

        for address in lagging {
            // Best effort: the replica serves stale reads correctly either
            // way, this just lets it notice sooner.
            if let Err(err) = self
                .connector
                .connect(address)?
                .update_latest_version(chunk, old_version, new_version)
                .await
            {
                warn!(%chunk, %address, %err, "failed to flag lagging replica");
            }
        }
        Ok(new_version)
    }
}
