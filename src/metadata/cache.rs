//! Metadata cache: per-chunk entries packed into leased blocks.
//!
//! Every operation resolves its chunk to `(block, slot)` and goes through
//! the lease agent. Writes are optimistic: read the block with its version
//! token, check the entry still matches what the caller saw, write the
//! sub-range conditionally, and loop when the version token lost. A lost
//! lease surfaces as `NotOwner` with the owner's name so the client can
//! re-dispatch; nothing here proxies to the owner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Result, ZirconError};
use crate::lease::LeaseAgent;
use crate::metadata::block::{
    bit_is_set, clear_bit_write, entry_slot, find_free_index, set_bit_write, slot_offset,
};
use crate::metadata::entry::MetadataEntry;
use crate::model::{BlockId, ChunkNum, ServerName};

/// Restart cap for allocation races before reporting contention.
const ALLOC_RETRY_CAP: u32 = 32;

/// Counters for metadata cache activity.
#[derive(Default)]
pub struct CacheMetrics {
    cas_retries: AtomicU64,
    allocations: AtomicU64,
    alloc_restarts: AtomicU64,
}

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheMetricsSnapshot {
    pub cas_retries: u64,
    pub allocations: u64,
    pub alloc_restarts: u64,
}

impl CacheMetrics {
    fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            cas_retries: self.cas_retries.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            alloc_restarts: self.alloc_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Frontend view of chunk metadata, sharded by block leases.
pub struct MetadataCache {
    agent: Arc<LeaseAgent>,
    metrics: CacheMetrics,
}

impl MetadataCache {
    pub fn new(agent: Arc<LeaseAgent>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            metrics: CacheMetrics::default(),
        })
    }

    pub fn agent(&self) -> &Arc<LeaseAgent> {
        &self.agent
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn target_block(chunk: ChunkNum) -> Result<BlockId> {
        let block = chunk.block();
        if block.0 == 0 {
            return Err(ZirconError::InvalidArgument(format!(
                "chunk {chunk} resolves to reserved block 0"
            )));
        }
        Ok(block)
    }

    /// Reads the metadata entry for `chunk`. `NotFound` when the entry is
    /// unallocated; `NotOwner` with a redirect when the block's lease lives
    /// elsewhere.
    pub async fn read_entry(&self, chunk: ChunkNum) -> Result<MetadataEntry> {
        let block = Self::target_block(chunk)?;
        let index = chunk.slot_index();
        let (bytes, _version) = self.agent.read(block).await?;
        if !bit_is_set(&bytes, index) {
            return Err(ZirconError::NotFound("metadata entry"));
        }
        MetadataEntry::decode(entry_slot(&bytes, index))
    }

    /// Replaces the entry for `chunk`, requiring the stored entry to equal
    /// `previous`. Loops while the block-version CAS loses; a drifted entry
    /// exits with `PreconditionFailed` instead of clobbering.
    pub async fn update_entry(
        &self,
        chunk: ChunkNum,
        previous: &MetadataEntry,
        next: &MetadataEntry,
    ) -> Result<()> {
        let block = Self::target_block(chunk)?;
        let index = chunk.slot_index();
        let encoded = next.encode().map_err(|err| {
            ZirconError::Internal(format!("metadata entry does not fit its slot: {err}"))
        })?;
        loop {
            let (_, version) = self.check_slot(block, index, chunk, previous).await?;
            match self
                .agent
                .write(block, version, slot_offset(index), &encoded)
                .await
            {
                Ok(_) => {
                    debug!(%chunk, %block, "metadata entry updated");
                    return Ok(());
                }
                Err(ZirconError::VersionMismatch { .. }) => {
                    self.metrics.cas_retries.fetch_add(1, Ordering::Relaxed);
                    trace!(%chunk, %block, "entry update lost block CAS, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Deallocates the entry for `chunk` by clearing its allocation bit,
    /// requiring the stored entry to equal `previous`. The slot's stale
    /// bytes stay behind and are overwritten by the next allocation.
    pub async fn delete_entry(&self, chunk: ChunkNum, previous: &MetadataEntry) -> Result<()> {
        let block = Self::target_block(chunk)?;
        let index = chunk.slot_index();
        loop {
            let (bytes, version) = self.check_slot(block, index, chunk, previous).await?;
            let (offset, cell) = clear_bit_write(&bytes, index);
            match self.agent.write(block, version, offset, &[cell]).await {
                Ok(_) => {
                    debug!(%chunk, %block, "metadata entry deleted");
                    return Ok(());
                }
                Err(ZirconError::VersionMismatch { .. }) => {
                    self.metrics.cas_retries.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Shared precondition check for the optimistic loops: block must exist
    /// here, bit must be set, slot must still decode to `previous`. Returns
    /// the block version token to CAS against.
    async fn check_slot(
        &self,
        block: BlockId,
        index: usize,
        chunk: ChunkNum,
        previous: &MetadataEntry,
    ) -> Result<(Vec<u8>, u64)> {
        let (bytes, version) = self.agent.read(block).await?;
        if version == 0 {
            // The block was never written here: whoever created the entry
            // did so under another frontend, so redirect rather than guess.
            return Err(ZirconError::NotOwner {
                owner: ServerName::new(),
            });
        }
        if !bit_is_set(&bytes, index) {
            return Err(ZirconError::NotFound("metadata entry"));
        }
        let current = MetadataEntry::decode(entry_slot(&bytes, index))?;
        if current != *previous {
            return Err(ZirconError::PreconditionFailed(format!(
                "metadata entry for chunk {chunk} changed underneath the caller"
            )));
        }
        Ok((bytes, version))
    }

    /// Allocates a fresh chunk number: finds a free bit in an owned block
    /// (or claims an unleased/fresh block), CAS-sets the bit, and returns
    /// the composed chunk. The entry content stays zeroed ("pending") until
    /// the caller's first `update_entry`.
    pub async fn new_entry(&self) -> Result<ChunkNum> {
        for _ in 0..ALLOC_RETRY_CAP {
            let (block, bytes, version, index) = match self.find_candidate().await? {
                Some(candidate) => candidate,
                None => {
                    self.metrics.alloc_restarts.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let (offset, cell) = set_bit_write(&bytes, index);
            match self.agent.write(block, version, offset, &[cell]).await {
                Ok(_) => {
                    self.metrics.allocations.fetch_add(1, Ordering::Relaxed);
                    let chunk = ChunkNum::compose(block, index);
                    debug!(%chunk, %block, index, "metadata entry allocated");
                    return Ok(chunk);
                }
                // Someone clobbered the block between our read and the CAS;
                // rescan from scratch.
                Err(ZirconError::VersionMismatch { .. }) | Err(ZirconError::NotOwner { .. }) => {
                    self.metrics.alloc_restarts.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => return Err(err),
            }
        }
        Err(ZirconError::Contended("metadata entry allocation"))
    }

    /// Next `(block, image, version, free index)` to try allocating into:
    /// owned blocks first in ascending order, then any unleased block, then
    /// a freshly minted one. `None` means the chosen block filled up before
    /// we looked and the caller should rescan.
    async fn find_candidate(&self) -> Result<Option<(BlockId, Vec<u8>, u64, usize)>> {
        for block in self.agent.list_leases() {
            match self.agent.read(block).await {
                Ok((bytes, version)) => {
                    if let Some(index) = find_free_index(&bytes) {
                        return Ok(Some((block, bytes, version, index)));
                    }
                }
                // The lease lapsed since listing; not ours to allocate in.
                Err(ZirconError::NotOwner { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        let block = match self.agent.get_any_unleased().await {
            Ok(block) => block,
            Err(ZirconError::NotFound(_)) => self.agent.acquire_fresh().await?,
            Err(err) => return Err(err),
        };
        let (bytes, version) = self.agent.read(block).await?;
        Ok(find_free_index(&bytes).map(|index| (block, bytes, version, index)))
    }
}
