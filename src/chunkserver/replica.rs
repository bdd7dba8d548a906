//! Single-node replica engine: versioned chunk state plus the prepare/commit
//! half of the replication protocol.
//!
//! Every chunk has at most one staged `(offset, data)` buffer. Commit checks
//! the buffer's fingerprint and the current committed version under the
//! chunk's mutex, so two writers contending for the same successor version
//! serialize and exactly one of them wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::chunkserver::store::ChunkStore;
use crate::error::{Result, ZirconError};
use crate::model::{fingerprint, ChunkNum, Version};

struct PreparedWrite {
    offset: u32,
    data: Vec<u8>,
}

#[derive(Default)]
struct ChunkState {
    prepared: Option<PreparedWrite>,
    /// Highest version known committed somewhere in the replica set. May
    /// exceed what this replica has committed locally; reads then stay
    /// served from local content while `StaleReplica` flags the gap to
    /// callers asking for the newer version.
    latest_version: Version,
}

/// Counters for replica engine activity.
#[derive(Default)]
pub struct ReplicaMetrics {
    prepares: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    stale_reads: AtomicU64,
    replications: AtomicU64,
}

/// Point-in-time copy of [`ReplicaMetrics`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplicaMetricsSnapshot {
    pub prepares: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub stale_reads: u64,
    pub replications: u64,
}

impl ReplicaMetrics {
    pub fn snapshot(&self) -> ReplicaMetricsSnapshot {
        ReplicaMetricsSnapshot {
            prepares: self.prepares.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
            replications: self.replications.load(Ordering::Relaxed),
        }
    }
}

/// The local half of a chunkserver: versioned committed content behind a
/// [`ChunkStore`], prepared buffers, and freshness tracking.
pub struct ReplicaEngine {
    store: Arc<dyn ChunkStore>,
    chunks: RwLock<HashMap<ChunkNum, Arc<Mutex<ChunkState>>>>,
    metrics: ReplicaMetrics,
}

impl ReplicaEngine {
    pub fn new(store: Arc<dyn ChunkStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            chunks: RwLock::new(HashMap::new()),
            metrics: ReplicaMetrics::default(),
        })
    }

    pub fn metrics(&self) -> ReplicaMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Per-chunk state handle, created on first touch. A chunk already
    /// present in the store (for instance after a restart) starts with its
    /// committed version as the freshness floor; prepared buffers do not
    /// survive a restart.
    fn state(&self, chunk: ChunkNum) -> Result<Arc<Mutex<ChunkState>>> {
        if let Some(state) = self.chunks.read().get(&chunk) {
            return Ok(state.clone());
        }
        let committed = self.store.latest(chunk)?.unwrap_or(Version::ZERO);
        let mut chunks = self.chunks.write();
        Ok(chunks
            .entry(chunk)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ChunkState {
                    prepared: None,
                    latest_version: committed,
                }))
            })
            .clone())
    }

    /// Creates `chunk` with committed content `data` at `version`. Fails if
    /// any committed version already exists at this replica.
    pub fn add(&self, chunk: ChunkNum, data: Vec<u8>, version: Version) -> Result<()> {
        if version.is_zero() {
            return Err(ZirconError::InvalidArgument(
                "initial version must be greater than 0".into(),
            ));
        }
        let state = self.state(chunk)?;
        let mut state = state.lock();
        if self.store.latest(chunk)?.is_some() {
            return Err(ZirconError::PreconditionFailed(format!(
                "chunk {chunk} already exists"
            )));
        }
        self.store.put(chunk, version, data)?;
        state.latest_version = state.latest_version.max(version);
        debug!(%chunk, %version, "chunk added");
        Ok(())
    }

    /// Reads `length` bytes at `offset` from the highest committed version,
    /// requiring it to be at least `min_version`. Returns `StaleReplica`
    /// carrying the current committed version when this replica is behind;
    /// reads past the end of the content are truncated.
    pub fn read(
        &self,
        chunk: ChunkNum,
        offset: u32,
        length: u32,
        min_version: Version,
    ) -> Result<(Vec<u8>, Version)> {
        let state = self.state(chunk)?;
        let state = state.lock();
        let current = match self.store.latest(chunk)? {
            Some(version) => version,
            None => return Err(ZirconError::NotFound("chunk")),
        };
        if current < min_version {
            self.metrics.stale_reads.fetch_add(1, Ordering::Relaxed);
            trace!(%chunk, %current, %min_version, "stale read rejected");
            return Err(ZirconError::StaleReplica { current });
        }
        let content = self.store.get(chunk, current)?;
        drop(state);
        let start = (offset as usize).min(content.len());
        let end = (offset as usize).saturating_add(length as usize).min(content.len());
        Ok((content[start..end].to_vec(), current))
    }

    /// Stages `(offset, data)` as the single prepared buffer for `chunk`,
    /// replacing any previous uncommitted one.
    pub fn start_write(&self, chunk: ChunkNum, offset: u32, data: Vec<u8>) -> Result<()> {
        let state = self.state(chunk)?;
        let mut state = state.lock();
        if state.prepared.is_some() {
            trace!(%chunk, "overwriting unconsumed prepared buffer");
        }
        state.prepared = Some(PreparedWrite { offset, data });
        self.metrics.prepares.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Applies the prepared buffer as `new_version`, provided its
    /// fingerprint matches `hash` and the current committed version equals
    /// `old_version`. The content is durable before this returns; the
    /// prepared buffer is consumed only on success.
    pub fn commit_write(
        &self,
        chunk: ChunkNum,
        hash: &str,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        let state = self.state(chunk)?;
        let mut state = state.lock();
        let result = self.commit_locked(&mut state, chunk, hash, old_version, new_version);
        if result.is_err() {
            self.metrics.commit_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn commit_locked(
        &self,
        state: &mut ChunkState,
        chunk: ChunkNum,
        hash: &str,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        if new_version <= old_version {
            return Err(ZirconError::PreconditionFailed(format!(
                "new version {new_version} must exceed old version {old_version}"
            )));
        }
        let prepared = match &state.prepared {
            Some(prepared) => prepared,
            None => {
                return Err(ZirconError::PreconditionFailed(format!(
                    "no prepared buffer for chunk {chunk}"
                )))
            }
        };
        let staged = fingerprint(&prepared.data);
        if staged != hash {
            return Err(ZirconError::PreconditionFailed(format!(
                "fingerprint mismatch for chunk {chunk}: staged {staged}, commit asked for {hash}"
            )));
        }
        let current = self.store.latest(chunk)?.unwrap_or(Version::ZERO);
        if current != old_version {
            return Err(ZirconError::PreconditionFailed(format!(
                "chunk {chunk} is at version {current}, not {old_version}"
            )));
        }

        let mut content = if current.is_zero() {
            Vec::new()
        } else {
            self.store.get(chunk, current)?
        };
        let prepared = state.prepared.take().expect("prepared buffer checked above");
        let start = prepared.offset as usize;
        let end = start + prepared.data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(&prepared.data);
        self.store.put(chunk, new_version, content)?;
        state.latest_version = state.latest_version.max(new_version);
        self.metrics.commits.fetch_add(1, Ordering::Relaxed);
        debug!(%chunk, %old_version, %new_version, "write committed");
        Ok(())
    }

    /// Advances the freshness floor from `old_version` iff it currently
    /// equals `old_version`. Moves no committed data; it records that a
    /// higher version exists elsewhere so reads can report staleness.
    pub fn update_latest_version(
        &self,
        chunk: ChunkNum,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        if new_version <= old_version {
            return Err(ZirconError::PreconditionFailed(format!(
                "latest version can only advance ({old_version} -> {new_version})"
            )));
        }
        let state = self.state(chunk)?;
        let mut state = state.lock();
        if state.latest_version != old_version {
            return Err(ZirconError::PreconditionFailed(format!(
                "latest version for chunk {chunk} is {}, not {old_version}",
                state.latest_version
            )));
        }
        state.latest_version = new_version;
        Ok(())
    }

    /// Installs content fetched from a peer as a committed version.
    /// Idempotent when the version is already present locally.
    pub fn install_replicated(&self, chunk: ChunkNum, version: Version, data: Vec<u8>) -> Result<()> {
        let state = self.state(chunk)?;
        let mut state = state.lock();
        if self.store.contains(chunk, version)? {
            return Ok(());
        }
        self.store.put(chunk, version, data)?;
        state.latest_version = state.latest_version.max(version);
        self.metrics.replications.fetch_add(1, Ordering::Relaxed);
        debug!(%chunk, %version, "replicated content installed");
        Ok(())
    }

    pub fn has_version(&self, chunk: ChunkNum, version: Version) -> Result<bool> {
        self.store.contains(chunk, version)
    }

    /// Removes chunk content only if the current committed version equals
    /// `version`.
    pub fn delete(&self, chunk: ChunkNum, version: Version) -> Result<()> {
        let state = self.state(chunk)?;
        let mut state = state.lock();
        let current = match self.store.latest(chunk)? {
            Some(current) => current,
            None => return Err(ZirconError::NotFound("chunk")),
        };
        if current != version {
            return Err(ZirconError::PreconditionFailed(format!(
                "chunk {chunk} is at version {current}, not {version}"
            )));
        }
        self.store.remove(chunk)?;
        state.prepared = None;
        state.latest_version = Version::ZERO;
        drop(state);
        self.chunks.write().remove(&chunk);
        debug!(%chunk, %version, "chunk deleted");
        Ok(())
    }

    /// Snapshot of currently committed chunks and their versions.
    pub fn list_all_chunks(&self) -> Result<Vec<(ChunkNum, Version)>> {
        self.store.list()
    }
}
