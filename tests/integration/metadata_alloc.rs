//! Metadata allocation and redirect behavior across two frontends sharing
//! one consensus KV, including the sync coordination surface over HTTP.

use std::sync::Arc;
use std::time::Duration;

use zircon::config::FrontendConfig;
use zircon::rpc::{publish_sync, RemoteSync};
use zircon::{
    BlockId, LeaseAgent, MemoryKv, MetadataCache, MetadataEntry, Result, Version, ZirconError,
};

const TTL: Duration = Duration::from_secs(10);
const REFRESH: Duration = Duration::from_secs(3);
const TIMEOUT: Duration = Duration::from_secs(5);

fn frontend(name: &str, kv: &Arc<MemoryKv>) -> Arc<MetadataCache> {
    MetadataCache::new(LeaseAgent::new(name.into(), kv.clone(), TTL, REFRESH))
}

#[tokio::test]
async fn foreign_chunk_redirects_to_its_lease_holder() -> Result<()> {
    let kv = MemoryKv::new();
    let owner = frontend("frontend-b", &kv);
    let chunk = owner.new_entry().await?;
    owner
        .update_entry(
            chunk,
            &MetadataEntry::default(),
            &MetadataEntry::new(vec!["cs-a:9600".into()], Version(1)),
        )
        .await?;

    // A frontend without the lease must hand back the owner's name, not
    // proxy or retry.
    let other = frontend("frontend-a", &kv);
    let err = other.read_entry(chunk).await.unwrap_err();
    match &err {
        ZirconError::NotOwner { owner } => assert_eq!(owner, "frontend-b"),
        other => panic!("expected NotOwner, got {other:?}"),
    }

    // Redirect correctness: the named server really does hold the lease.
    assert!(owner.agent().holds(chunk.block()));
    Ok(())
}

#[tokio::test]
async fn entries_are_visible_to_whoever_holds_the_lease_next() -> Result<()> {
    let kv = MemoryKv::new();
    let first = frontend("frontend-a", &kv);
    let chunk = first.new_entry().await?;
    let entry = MetadataEntry::new(vec!["cs-a:9600".into(), "cs-b:9600".into()], Version(3));
    first.update_entry(chunk, &MetadataEntry::default(), &entry).await?;

    // Orderly handoff: release, then the next frontend claims the block
    // and sees the same bytes.
    first.agent().release(chunk.block()).await?;
    let second = frontend("frontend-b", &kv);
    second.agent().acquire(chunk.block()).await?;
    assert_eq!(second.read_entry(chunk).await?, entry);

    // And allocation on the new owner lands in the same block's free space
    // rather than minting a new block.
    let sibling = second.new_entry().await?;
    assert_eq!(sibling.block(), chunk.block());
    assert_ne!(sibling, chunk);
    Ok(())
}

#[tokio::test]
async fn sync_surface_coordinates_leases_over_http() -> Result<()> {
    let kv = MemoryKv::new();
    let config = FrontendConfig {
        server_name: "frontend-a".into(),
        listen: "127.0.0.1:0".into(),
        ..FrontendConfig::default()
    };
    config.validate()?;
    let agent = LeaseAgent::from_config(&config, kv.clone());
    let handle = publish_sync(&config.listen, agent.clone()).await?;
    let client = RemoteSync::new(&handle.local_addr().to_string(), TIMEOUT);

    let root = client.get_fs_root().await?;
    assert_eq!(root, BlockId(1));

    let block = BlockId(5);
    assert!(!client.confirm_sync(block).await?);
    client.start_sync(block).await?;
    assert!(client.confirm_sync(block).await?);
    client.upgrade_sync(block).await?;

    // A second frontend is refused with a redirect while the lease holds,
    // and succeeds after release.
    let other = LeaseAgent::new("frontend-b".into(), kv.clone(), TTL, REFRESH);
    match other.acquire(block).await {
        Err(ZirconError::NotOwner { owner }) => assert_eq!(owner, "frontend-a"),
        other => panic!("expected NotOwner, got {other:?}"),
    }
    client.release_sync(block).await?;
    assert!(!client.confirm_sync(block).await?);
    other.acquire(block).await?;

    handle.shutdown().await
}
