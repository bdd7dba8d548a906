//! End-to-end write path against an in-process cluster: metadata
//! allocation, chunk creation, the two-phase replicated write, and the
//! version bump back into the metadata layer.

use std::sync::Arc;
use std::time::Duration;

use zircon::{
    fingerprint, ChunkNum, Chunkserver, Connector, LeaseAgent, LocalChunkserver, LocalConnector,
    MemoryChunkStore, MemoryKv, MetadataCache, MetadataEntry, ReplicaEngine, Result, Version,
    WriteDriver, ZirconError,
};

const REPLICAS: [&str; 3] = ["cs-a:9600", "cs-b:9600", "cs-c:9600"];

struct Cluster {
    connector: Arc<LocalConnector>,
    servers: Vec<Arc<LocalChunkserver>>,
    cache: Arc<MetadataCache>,
}

fn cluster() -> Cluster {
    let connector = LocalConnector::new();
    let servers: Vec<_> = REPLICAS
        .iter()
        .map(|address| {
            let server = LocalChunkserver::new(
                address.to_string(),
                ReplicaEngine::new(MemoryChunkStore::new()),
                connector.clone(),
            );
            connector.register(address.to_string(), server.clone());
            server
        })
        .collect();
    let agent = LeaseAgent::new(
        "frontend-a".into(),
        MemoryKv::new(),
        Duration::from_secs(10),
        Duration::from_secs(3),
    );
    Cluster {
        connector,
        servers,
        cache: MetadataCache::new(agent),
    }
}

fn replica_set() -> Vec<String> {
    REPLICAS.iter().map(|address| address.to_string()).collect()
}

async fn create_chunk(cluster: &Cluster, data: &[u8]) -> Result<ChunkNum> {
    let chunk = cluster.cache.new_entry().await?;
    for address in REPLICAS {
        cluster
            .connector
            .connect(&address.to_string())?
            .add(chunk, data.to_vec(), Version(1))
            .await?;
    }
    cluster
        .cache
        .update_entry(
            chunk,
            &MetadataEntry::default(),
            &MetadataEntry::new(replica_set(), Version(1)),
        )
        .await?;
    Ok(chunk)
}

#[tokio::test]
async fn write_propagates_to_every_replica_and_bumps_metadata() -> Result<()> {
    let cluster = cluster();
    let chunk = create_chunk(&cluster, b"hello").await?;

    let entry = cluster.cache.read_entry(chunk).await?;
    assert_eq!(entry.version, Version(1));

    let driver = WriteDriver::new(cluster.connector.clone());
    let committed = driver.write(chunk, 1, b"A".to_vec(), &entry).await?;
    assert_eq!(committed, Version(2));

    cluster
        .cache
        .update_entry(chunk, &entry, &MetadataEntry::new(entry.replicas.clone(), committed))
        .await?;
    assert_eq!(cluster.cache.read_entry(chunk).await?.version, Version(2));

    for server in &cluster.servers {
        let (data, version) = server.engine().read(chunk, 0, 5, Version(2))?;
        assert_eq!(data, b"hAllo");
        assert_eq!(version, Version(2));
    }
    Ok(())
}

#[tokio::test]
async fn metadata_cas_elects_a_single_winner_among_concurrent_writers() -> Result<()> {
    let cluster = cluster();
    let chunk = create_chunk(&cluster, b"hello").await?;
    let entry = cluster.cache.read_entry(chunk).await?;

    // Two clients race the full protocol from the same entry snapshot. The
    // per-replica commit CAS may split between them, but the metadata bump
    // is conditional on the entry they both read, so at most one write
    // becomes visible.
    let mut tasks = Vec::new();
    for fill in [b"X", b"Y"] {
        let connector = cluster.connector.clone();
        let cache = cluster.cache.clone();
        let entry = entry.clone();
        tasks.push(tokio::spawn(async move {
            let driver = WriteDriver::new(connector);
            let committed = driver.write(chunk, 0, fill.to_vec(), &entry).await?;
            cache
                .update_entry(
                    chunk,
                    &entry,
                    &MetadataEntry::new(entry.replicas.clone(), committed),
                )
                .await
        }));
    }
    let outcomes: Vec<_> = [tasks.remove(0).await.unwrap(), tasks.remove(0).await.unwrap()].into();
    let winners = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert!(winners <= 1, "the metadata CAS admits at most one writer");

    let recorded = cluster.cache.read_entry(chunk).await?;
    if winners == 1 {
        assert_eq!(recorded.version, Version(2));
    } else {
        // Both writers lost a precondition somewhere; the recorded version
        // is untouched.
        assert_eq!(recorded.version, Version(1));
    }
    Ok(())
}

#[tokio::test]
async fn verification_failure_aborts_before_commit() -> Result<()> {
    let cluster = cluster();
    let chunk = create_chunk(&cluster, b"hello").await?;
    let entry = cluster.cache.read_entry(chunk).await?;

    // Prepare succeeds everywhere, but the client aborts by never sending
    // commit (simulated by a fingerprint check that fails on every
    // replica).
    let primary = cluster.connector.connect(&entry.replicas[0])?;
    primary
        .start_write_replicated(chunk, 0, b"Z".to_vec(), entry.replicas.clone())
        .await?;
    for address in &entry.replicas {
        let err = cluster
            .connector
            .connect(address)?
            .commit_write(chunk, fingerprint(b"not-z").to_string(), Version(1), Version(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ZirconError::PreconditionFailed(_)));
    }
    // Content is untouched at version 1.
    let (data, version) = cluster.servers[1].engine().read(chunk, 0, 5, Version(1))?;
    assert_eq!(data, b"hello");
    assert_eq!(version, Version(1));
    Ok(())
}

#[tokio::test]
async fn delete_at_version_then_metadata_cleanup() -> Result<()> {
    let cluster = cluster();
    let chunk = create_chunk(&cluster, b"hello").await?;
    let entry = cluster.cache.read_entry(chunk).await?;

    for address in &entry.replicas {
        cluster.connector.connect(address)?.delete(chunk, Version(1)).await?;
    }
    cluster.cache.delete_entry(chunk, &entry).await?;
    assert!(matches!(
        cluster.cache.read_entry(chunk).await,
        Err(ZirconError::NotFound(_))
    ));
    assert!(cluster.servers[0].engine().list_all_chunks()?.is_empty());
    Ok(())
}
