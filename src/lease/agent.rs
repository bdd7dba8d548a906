//! Block-lease agent: cooperative single-writer ownership of metadata
//! blocks, arbitrated through the consensus KV.
//!
//! Each agent renews its leases from one background task and keeps a cached
//! copy of every block it owns. A cached block is authoritative while the
//! lease holds: only this agent can commit block writes, so the cache is
//! invalidated exactly when the lease is lost or a write bumps the version.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, ZirconError};
use crate::lease::kv::KvStore;
use crate::model::{BlockId, ServerName, BLOCK_BYTES};

const LEASE_PREFIX: &str = "zircon/lease/";
const BLOCK_PREFIX: &str = "zircon/block/";

/// Attempts at claiming some unleased block before reporting contention.
const UNLEASED_RETRY_CAP: u32 = 8;

fn lease_key(block: BlockId) -> String {
    format!("{LEASE_PREFIX}{}", block.0)
}

fn block_key(block: BlockId) -> String {
    format!("{BLOCK_PREFIX}{}", block.0)
}

fn parse_block_id(key: &str, prefix: &str) -> Option<BlockId> {
    key.strip_prefix(prefix)?.parse().ok().map(BlockId)
}

#[derive(Clone)]
struct CachedBlock {
    bytes: Vec<u8>,
    version: u64,
}

/// Counters for lease agent activity.
#[derive(Default)]
pub struct LeaseMetrics {
    acquisitions: AtomicU64,
    renewals: AtomicU64,
    lost_leases: AtomicU64,
    releases: AtomicU64,
}

/// Point-in-time copy of [`LeaseMetrics`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LeaseMetricsSnapshot {
    pub acquisitions: u64,
    pub renewals: u64,
    pub lost_leases: u64,
    pub releases: u64,
}

impl LeaseMetrics {
    fn snapshot(&self) -> LeaseMetricsSnapshot {
        LeaseMetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            lost_leases: self.lost_leases.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

struct RefreshTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Lease-coordinated view of the metadata block space for one frontend.
pub struct LeaseAgent {
    name: ServerName,
    kv: Arc<dyn KvStore>,
    lease_ttl: Duration,
    refresh_interval: Duration,
    /// Held leases, mapped to the KV version of their lease record.
    leases: Mutex<HashMap<BlockId, u64>>,
    /// Per-block cache slots. The async mutex serializes the read-modify-
    /// write of one block across the KV round trip.
    blocks: Mutex<HashMap<BlockId, Arc<AsyncMutex<Option<CachedBlock>>>>>,
    refresh: Mutex<Option<RefreshTask>>,
    metrics: LeaseMetrics,
}

impl LeaseAgent {
    pub fn new(
        name: ServerName,
        kv: Arc<dyn KvStore>,
        lease_ttl: Duration,
        refresh_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            kv,
            lease_ttl,
            refresh_interval,
            leases: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            refresh: Mutex::new(None),
            metrics: LeaseMetrics::default(),
        })
    }

    /// Builds an agent from a validated [`FrontendConfig`].
    pub fn from_config(config: &crate::config::FrontendConfig, kv: Arc<dyn KvStore>) -> Arc<Self> {
        Self::new(
            config.server_name.clone(),
            kv,
            config.lease_ttl(),
            config.refresh_interval(),
        )
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn metrics(&self) -> LeaseMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Spawns the background renewal task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut refresh = self.refresh.lock();
        if refresh.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let agent = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(agent.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => agent.renew_all().await,
                }
            }
            debug!(agent = %agent.name, "lease refresh task stopped");
        });
        *refresh = Some(RefreshTask { shutdown, handle });
        info!(agent = %self.name, "lease refresh task started");
    }

    /// Stops the renewal task and explicitly releases every held lease.
    pub async fn stop(&self) {
        let task = self.refresh.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            let _ = task.handle.await;
        }
        let held: Vec<BlockId> = self.leases.lock().keys().copied().collect();
        for block in held {
            if let Err(err) = self.release(block).await {
                warn!(agent = %self.name, %block, %err, "failed to release lease on shutdown");
            }
        }
    }

    async fn renew_all(&self) {
        let held: Vec<(BlockId, u64)> =
            self.leases.lock().iter().map(|(b, v)| (*b, *v)).collect();
        for (block, version) in held {
            let outcome = self
                .kv
                .put(
                    &lease_key(block),
                    self.name.clone().into_bytes(),
                    version,
                    Some(self.lease_ttl),
                )
                .await;
            match outcome {
                Ok(new_version) => {
                    self.metrics.renewals.fetch_add(1, Ordering::Relaxed);
                    let mut leases = self.leases.lock();
                    if let Some(slot) = leases.get_mut(&block) {
                        *slot = new_version;
                    }
                }
                Err(ZirconError::VersionMismatch { .. }) => {
                    warn!(agent = %self.name, %block, "lease lost at renewal");
                    self.metrics.lost_leases.fetch_add(1, Ordering::Relaxed);
                    self.forget_lease(block);
                }
                Err(err) => {
                    // Transient KV trouble; the lease may still be live, so
                    // keep it and retry on the next tick.
                    warn!(agent = %self.name, %block, %err, "lease renewal failed");
                }
            }
        }
    }

    fn forget_lease(&self, block: BlockId) {
        self.leases.lock().remove(&block);
        self.blocks.lock().remove(&block);
    }

    /// Whether this agent currently believes it holds the lease for
    /// `block`. Local view only; the KV record stays authoritative.
    pub fn holds(&self, block: BlockId) -> bool {
        self.leases.lock().contains_key(&block)
    }

    /// The current lease holder recorded in the KV, empty if none.
    pub async fn current_owner(&self, block: BlockId) -> Result<ServerName> {
        match self.kv.get(&lease_key(block)).await? {
            Some(record) => String::from_utf8(record.value)
                .map_err(|_| ZirconError::Corruption(format!("lease record for block {block}"))),
            None => Ok(ServerName::new()),
        }
    }

    async fn not_owner(&self, block: BlockId) -> ZirconError {
        match self.current_owner(block).await {
            Ok(owner) => ZirconError::NotOwner { owner },
            Err(err) => err,
        }
    }

    /// Claims the lease for `block`, or confirms it if already held here.
    /// Racing claimants observe `NotOwner` naming the winner.
    pub async fn acquire(&self, block: BlockId) -> Result<()> {
        if block.0 == 0 {
            return Err(ZirconError::InvalidArgument("block 0 is reserved".into()));
        }
        if self.holds(block) {
            return Ok(());
        }
        match self.kv.get(&lease_key(block)).await? {
            Some(record) if record.value == self.name.as_bytes() => {
                // Our own record from a previous incarnation; adopt it.
                self.leases.lock().insert(block, record.version);
                Ok(())
            }
            Some(record) => Err(ZirconError::NotOwner {
                owner: String::from_utf8(record.value).unwrap_or_default(),
            }),
            None => {
                let claim = self
                    .kv
                    .put(
                        &lease_key(block),
                        self.name.clone().into_bytes(),
                        0,
                        Some(self.lease_ttl),
                    )
                    .await;
                match claim {
                    Ok(version) => {
                        self.leases.lock().insert(block, version);
                        self.metrics.acquisitions.fetch_add(1, Ordering::Relaxed);
                        debug!(agent = %self.name, %block, "lease acquired");
                        Ok(())
                    }
                    Err(ZirconError::VersionMismatch { .. }) => Err(self.not_owner(block).await),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Releases the lease for `block` if held here.
    pub async fn release(&self, block: BlockId) -> Result<()> {
        let version = match self.leases.lock().remove(&block) {
            Some(version) => version,
            None => return Ok(()),
        };
        self.blocks.lock().remove(&block);
        self.metrics.releases.fetch_add(1, Ordering::Relaxed);
        match self.kv.delete(&lease_key(block), version).await {
            Ok(()) => Ok(()),
            // The record already moved on (expired and re-claimed); nothing
            // of ours is left to release.
            Err(ZirconError::VersionMismatch { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn cache_slot(&self, block: BlockId) -> Arc<AsyncMutex<Option<CachedBlock>>> {
        self.blocks
            .lock()
            .entry(block)
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    async fn load_block(&self, block: BlockId) -> Result<CachedBlock> {
        match self.kv.get(&block_key(block)).await? {
            Some(record) => {
                if record.value.len() != BLOCK_BYTES {
                    return Err(ZirconError::Corruption(format!(
                        "block {block} has {} bytes, expected {BLOCK_BYTES}",
                        record.value.len()
                    )));
                }
                Ok(CachedBlock {
                    bytes: record.value,
                    version: record.version,
                })
            }
            // A block that was never written reads as zeroes at version 0;
            // the first conditional write creates it.
            None => Ok(CachedBlock {
                bytes: vec![0u8; BLOCK_BYTES],
                version: 0,
            }),
        }
    }

    /// Returns the block's content and version, reading through to the KV
    /// on cache miss. `NotOwner` (with the holder's name) when the lease is
    /// not held here.
    pub async fn read(&self, block: BlockId) -> Result<(Vec<u8>, u64)> {
        if !self.holds(block) {
            return Err(self.not_owner(block).await);
        }
        let slot = self.cache_slot(block);
        let mut cached = slot.lock().await;
        if !self.holds(block) {
            // Lease lapsed while we waited on the slot.
            return Err(self.not_owner(block).await);
        }
        if let Some(cached) = cached.as_ref() {
            return Ok((cached.bytes.clone(), cached.version));
        }
        let loaded = self.load_block(block).await?;
        let result = (loaded.bytes.clone(), loaded.version);
        *cached = Some(loaded);
        Ok(result)
    }

    /// Conditionally writes `bytes` at `offset` within the block, bumping
    /// the block version. `VersionMismatch` when `expected_version` lost the
    /// race; `NotOwner` when the lease is gone.
    pub async fn write(
        &self,
        block: BlockId,
        expected_version: u64,
        offset: usize,
        bytes: &[u8],
    ) -> Result<u64> {
        if offset + bytes.len() > BLOCK_BYTES {
            return Err(ZirconError::InvalidArgument(format!(
                "write of {} bytes at offset {offset} exceeds block size",
                bytes.len()
            )));
        }
        if !self.holds(block) {
            return Err(self.not_owner(block).await);
        }
        // Re-validate against the KV record: renewal may not have noticed a
        // lapse yet, and writing under a lapsed lease must redirect, not
        // clobber.
        match self.kv.get(&lease_key(block)).await? {
            Some(record) if record.value == self.name.as_bytes() => {}
            other => {
                self.metrics.lost_leases.fetch_add(1, Ordering::Relaxed);
                self.forget_lease(block);
                let owner = other
                    .map(|record| String::from_utf8(record.value).unwrap_or_default())
                    .unwrap_or_default();
                return Err(ZirconError::NotOwner { owner });
            }
        }

        let slot = self.cache_slot(block);
        let mut cached = slot.lock().await;
        let current = match cached.as_ref() {
            Some(current) => current.clone(),
            None => self.load_block(block).await?,
        };
        if current.version != expected_version {
            *cached = Some(current.clone());
            return Err(ZirconError::VersionMismatch {
                expected: expected_version,
                found: current.version,
            });
        }
        let mut modified = current.bytes;
        modified[offset..offset + bytes.len()].copy_from_slice(bytes);
        match self
            .kv
            .put(&block_key(block), modified.clone(), expected_version, None)
            .await
        {
            Ok(new_version) => {
                *cached = Some(CachedBlock {
                    bytes: modified,
                    version: new_version,
                });
                Ok(new_version)
            }
            Err(err) => {
                // Whatever happened, the cache can no longer be trusted.
                *cached = None;
                Err(err)
            }
        }
    }

    /// Blocks whose lease this agent currently holds, ascending.
    pub fn list_leases(&self) -> Vec<BlockId> {
        let mut held: Vec<BlockId> = self.leases.lock().keys().copied().collect();
        held.sort_unstable();
        held
    }

    /// Finds a block that exists in the KV with no live lease and claims
    /// it. `NotFound` when every known block is leased (callers then mint a
    /// fresh block id); `Contended` when claim races exhaust the retry cap.
    pub async fn get_any_unleased(&self) -> Result<BlockId> {
        for attempt in 0..UNLEASED_RETRY_CAP {
            let blocks = self.kv.list_prefix(BLOCK_PREFIX).await?;
            let leased: HashSet<BlockId> = self
                .kv
                .list_prefix(LEASE_PREFIX)
                .await?
                .iter()
                .filter_map(|(key, _)| parse_block_id(key, LEASE_PREFIX))
                .collect();
            let candidates: Vec<BlockId> = blocks
                .iter()
                .filter_map(|(key, _)| parse_block_id(key, BLOCK_PREFIX))
                .filter(|block| block.0 != 0 && !leased.contains(block))
                .collect();
            if candidates.is_empty() {
                return Err(ZirconError::NotFound("unleased block"));
            }
            for block in candidates {
                match self.acquire(block).await {
                    Ok(()) => return Ok(block),
                    Err(ZirconError::NotOwner { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
            let backoff = rand::thread_rng().gen_range(5u64..25) * (attempt as u64 + 1);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
        Err(ZirconError::Contended("unleased block acquisition"))
    }

    /// Mints and claims a block id one past everything known to the KV.
    /// Racing agents retry toward the cap, then report `Contended`.
    pub async fn acquire_fresh(&self) -> Result<BlockId> {
        for _ in 0..UNLEASED_RETRY_CAP {
            let mut highest = 0u64;
            for (prefix, listing) in [
                (BLOCK_PREFIX, self.kv.list_prefix(BLOCK_PREFIX).await?),
                (LEASE_PREFIX, self.kv.list_prefix(LEASE_PREFIX).await?),
            ] {
                for (key, _) in listing {
                    if let Some(block) = parse_block_id(&key, prefix) {
                        highest = highest.max(block.0);
                    }
                }
            }
            let fresh = BlockId(highest + 1);
            match self.acquire(fresh).await {
                Ok(()) => return Ok(fresh),
                Err(ZirconError::NotOwner { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ZirconError::Contended("fresh block acquisition"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::kv::MemoryKv;

    const TTL: Duration = Duration::from_secs(10);
    const REFRESH: Duration = Duration::from_millis(50);

    fn agent(name: &str, kv: &Arc<MemoryKv>) -> Arc<LeaseAgent> {
        LeaseAgent::new(name.into(), kv.clone(), TTL, REFRESH)
    }

    #[tokio::test]
    async fn acquire_is_exclusive_and_redirects() {
        let kv = MemoryKv::new();
        let a = agent("frontend-a", &kv);
        let b = agent("frontend-b", &kv);
        let block = BlockId(3);
        a.acquire(block).await.unwrap();
        a.acquire(block).await.unwrap();
        match b.acquire(block).await {
            Err(ZirconError::NotOwner { owner }) => assert_eq!(owner, "frontend-a"),
            other => panic!("expected NotOwner, got {other:?}"),
        }
        assert_eq!(a.list_leases(), vec![block]);
        assert!(b.list_leases().is_empty());
    }

    #[tokio::test]
    async fn unwritten_block_reads_as_zeroes_at_version_zero() {
        let kv = MemoryKv::new();
        let a = agent("frontend-a", &kv);
        let block = BlockId(3);
        a.acquire(block).await.unwrap();
        let (bytes, version) = a.read(block).await.unwrap();
        assert_eq!(version, 0);
        assert_eq!(bytes.len(), BLOCK_BYTES);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn write_bumps_version_and_respects_cas() {
        let kv = MemoryKv::new();
        let a = agent("frontend-a", &kv);
        let block = BlockId(3);
        a.acquire(block).await.unwrap();
        let v1 = a.write(block, 0, 10, b"xyz").await.unwrap();
        assert_eq!(v1, 1);
        let (bytes, version) = a.read(block).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(&bytes[10..13], b"xyz");
        // Stale token loses without changing anything.
        match a.write(block, 0, 10, b"abc").await {
            Err(ZirconError::VersionMismatch { expected: 0, found: 1 }) => {}
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
        assert_eq!(a.read(block).await.unwrap().0[10..13], *b"xyz");
    }

    #[tokio::test]
    async fn read_and_write_redirect_without_lease() {
        let kv = MemoryKv::new();
        let a = agent("frontend-a", &kv);
        let b = agent("frontend-b", &kv);
        let block = BlockId(3);
        a.acquire(block).await.unwrap();
        match b.read(block).await {
            Err(ZirconError::NotOwner { owner }) => assert_eq!(owner, "frontend-a"),
            other => panic!("expected NotOwner, got {other:?}"),
        }
        match b.write(block, 0, 0, b"x").await {
            Err(ZirconError::NotOwner { owner }) => assert_eq!(owner, "frontend-a"),
            other => panic!("expected NotOwner, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lost_lease_detected_at_write_time() {
        let kv = MemoryKv::new();
        let a = agent("frontend-a", &kv);
        let b = agent("frontend-b", &kv);
        let block = BlockId(3);
        a.acquire(block).await.unwrap();
        a.write(block, 0, 0, b"a").await.unwrap();

        // The lease record vanishes (expiry) and another agent claims it.
        kv.expire(&lease_key(block));
        b.acquire(block).await.unwrap();

        match a.write(block, 1, 0, b"z").await {
            Err(ZirconError::NotOwner { owner }) => assert_eq!(owner, "frontend-b"),
            other => panic!("expected NotOwner, got {other:?}"),
        }
        assert!(a.list_leases().is_empty());
        assert_eq!(a.metrics().lost_leases, 1);
    }

    #[tokio::test]
    async fn refresh_task_keeps_leases_alive() {
        let kv = MemoryKv::new();
        let a = LeaseAgent::new(
            "frontend-a".into(),
            kv.clone(),
            Duration::from_millis(150),
            Duration::from_millis(30),
        );
        let block = BlockId(3);
        a.acquire(block).await.unwrap();
        a.start();
        tokio::time::sleep(Duration::from_millis(400)).await;
        // Well past the original TTL, the record is still ours.
        assert_eq!(a.current_owner(block).await.unwrap(), "frontend-a");
        assert!(a.metrics().renewals > 0);
        a.stop().await;
        // Stop released the lease for the next claimant.
        assert_eq!(a.current_owner(block).await.unwrap(), "");
    }

    #[tokio::test]
    async fn get_any_unleased_claims_abandoned_blocks() {
        let kv = MemoryKv::new();
        let a = agent("frontend-a", &kv);
        let b = agent("frontend-b", &kv);
        let block = BlockId(5);
        a.acquire(block).await.unwrap();
        a.write(block, 0, 0, &[1]).await.unwrap();

        // While a holds the lease there is nothing to claim.
        assert!(matches!(
            b.get_any_unleased().await,
            Err(ZirconError::NotFound(_))
        ));

        a.release(block).await.unwrap();
        assert_eq!(b.get_any_unleased().await.unwrap(), block);
        assert_eq!(b.list_leases(), vec![block]);
    }

    #[tokio::test]
    async fn acquire_fresh_skips_every_known_block() {
        let kv = MemoryKv::new();
        let a = agent("frontend-a", &kv);
        let b = agent("frontend-b", &kv);
        let first = a.acquire_fresh().await.unwrap();
        assert_eq!(first, BlockId(1));
        // A lease alone (no block content yet) still reserves the id.
        let second = b.acquire_fresh().await.unwrap();
        assert_eq!(second, BlockId(2));
    }
}
