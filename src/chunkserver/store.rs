//! Storage driver seam beneath the replica engine.
//!
//! The real deployment plugs a disk-backed engine in here; tests and
//! single-process setups use [`MemoryChunkStore`]. The driver stores fully
//! committed chunk content keyed by `(chunk, version)` and knows nothing
//! about prepared buffers or the replication protocol.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, ZirconError};
use crate::model::{ChunkNum, Version};

/// Local committed-chunk storage. All methods are synchronous; writes are
/// durable when they return. Version discipline (monotonicity, who may
/// overwrite what) is enforced by the replica engine above, not here.
pub trait ChunkStore: Send + Sync {
    /// Installs committed content for `(chunk, version)`.
    fn put(&self, chunk: ChunkNum, version: Version, data: Vec<u8>) -> Result<()>;

    /// Returns the committed content at exactly `(chunk, version)`.
    fn get(&self, chunk: ChunkNum, version: Version) -> Result<Vec<u8>>;

    /// Highest committed version for `chunk`, or `None` if absent.
    fn latest(&self, chunk: ChunkNum) -> Result<Option<Version>>;

    fn contains(&self, chunk: ChunkNum, version: Version) -> Result<bool>;

    /// Drops every committed version of `chunk`.
    fn remove(&self, chunk: ChunkNum) -> Result<()>;

    /// Snapshot of `(chunk, highest committed version)` pairs.
    fn list(&self) -> Result<Vec<(ChunkNum, Version)>>;
}

/// In-memory [`ChunkStore`] retaining every committed version.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<HashMap<ChunkNum, BTreeMap<Version, Vec<u8>>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, chunk: ChunkNum, version: Version, data: Vec<u8>) -> Result<()> {
        if version.is_zero() {
            return Err(ZirconError::InvalidArgument(
                "version 0 cannot hold committed content".into(),
            ));
        }
        self.chunks.lock().entry(chunk).or_default().insert(version, data);
        Ok(())
    }

    fn get(&self, chunk: ChunkNum, version: Version) -> Result<Vec<u8>> {
        self.chunks
            .lock()
            .get(&chunk)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or(ZirconError::NotFound("chunk version"))
    }

    fn latest(&self, chunk: ChunkNum) -> Result<Option<Version>> {
        Ok(self
            .chunks
            .lock()
            .get(&chunk)
            .and_then(|versions| versions.keys().next_back().copied()))
    }

    fn contains(&self, chunk: ChunkNum, version: Version) -> Result<bool> {
        Ok(self
            .chunks
            .lock()
            .get(&chunk)
            .is_some_and(|versions| versions.contains_key(&version)))
    }

    fn remove(&self, chunk: ChunkNum) -> Result<()> {
        self.chunks.lock().remove(&chunk);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(ChunkNum, Version)>> {
        let chunks = self.chunks.lock();
        let mut out: Vec<_> = chunks
            .iter()
            .filter_map(|(chunk, versions)| {
                versions.keys().next_back().map(|version| (*chunk, *version))
            })
            .collect();
        out.sort_unstable();
        Ok(out)
    }
}
