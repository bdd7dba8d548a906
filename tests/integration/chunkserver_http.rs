//! The chunkserver RPC surface exercised over real HTTP: serve shim on one
//! side, wire client on the other, structured errors round-tripped.

use std::sync::Arc;
use std::time::Duration;

use zircon::rpc::{publish_chunkserver, HttpConnector, RemoteChunkserver, ServeHandle};
use zircon::{
    fingerprint, Chunkserver, ChunkNum, Connector, LocalChunkserver, MemoryChunkStore,
    MetadataEntry, ReplicaEngine, Result, Version, WriteDriver, ZirconError,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Boots a chunkserver on an ephemeral port. Its replica-set identity is
/// the bound address, so fan-out to itself goes over the wire like any
/// other peer.
async fn spawn_chunkserver(
    connector: Arc<HttpConnector>,
) -> Result<(ServeHandle, Arc<RemoteChunkserver>, String)> {
    let engine = ReplicaEngine::new(MemoryChunkStore::new());
    // The identity is only used to short-circuit self-dials; an ephemeral
    // port is unknown until bind, so every dial goes through HTTP here.
    let server = LocalChunkserver::new(String::new(), engine, connector);
    let handle = publish_chunkserver("127.0.0.1:0", server).await?;
    let address = handle.local_addr().to_string();
    let client = RemoteChunkserver::new(&address, TIMEOUT);
    Ok((handle, client, address))
}

#[tokio::test]
async fn add_write_read_over_the_wire() -> Result<()> {
    let connector = HttpConnector::new(TIMEOUT);
    let (handle, client, _) = spawn_chunkserver(connector).await?;
    let chunk = ChunkNum(7);

    client.add(chunk, b"hello".to_vec(), Version(1)).await?;
    let (data, version) = client.read(chunk, 0, 5, Version(1)).await?;
    assert_eq!(data, b"hello");
    assert_eq!(version, Version(1));

    client.start_write(chunk, 1, b"A".to_vec()).await?;
    client
        .commit_write(chunk, fingerprint(b"A"), Version(1), Version(2))
        .await?;
    let (data, version) = client.read(chunk, 0, 5, Version(2)).await?;
    assert_eq!(data, b"hAllo");
    assert_eq!(version, Version(2));

    let listed = client.list_all_chunks().await?;
    assert_eq!(listed, vec![(chunk, Version(2))]);

    handle.shutdown().await
}

#[tokio::test]
async fn stale_replica_diagnostics_survive_the_wire() -> Result<()> {
    let connector = HttpConnector::new(TIMEOUT);
    let (handle, client, _) = spawn_chunkserver(connector).await?;
    let chunk = ChunkNum(7);
    client.add(chunk, b"hello".to_vec(), Version(1)).await?;

    match client.read(chunk, 0, 5, Version(2)).await {
        Err(ZirconError::StaleReplica { current }) => assert_eq!(current, Version(1)),
        other => panic!("expected StaleReplica over the wire, got {other:?}"),
    }
    match client.read(ChunkNum(999), 0, 5, Version(1)).await {
        Err(ZirconError::NotFound(_)) => {}
        other => panic!("expected NotFound over the wire, got {other:?}"),
    }
    match client
        .commit_write(chunk, fingerprint(b"A"), Version(1), Version(2))
        .await
    {
        Err(ZirconError::PreconditionFailed(_)) => {}
        other => panic!("expected PreconditionFailed over the wire, got {other:?}"),
    }

    handle.shutdown().await
}

#[tokio::test]
async fn replicated_prepare_fans_out_across_http_peers() -> Result<()> {
    let connector = HttpConnector::new(TIMEOUT);
    let (handle_a, client_a, addr_a) = spawn_chunkserver(connector.clone()).await?;
    let (handle_b, client_b, addr_b) = spawn_chunkserver(connector.clone()).await?;
    let chunk = ChunkNum(7);
    let replicas = vec![addr_a.clone(), addr_b.clone()];

    for client in [&client_a, &client_b] {
        client.add(chunk, b"hello".to_vec(), Version(1)).await?;
    }

    let driver = WriteDriver::new(connector.clone());
    let entry = MetadataEntry::new(replicas, Version(1));
    let committed = driver.write(chunk, 1, b"A".to_vec(), &entry).await?;
    assert_eq!(committed, Version(2));

    for address in [&addr_a, &addr_b] {
        let peer = connector.connect(address)?;
        let (data, version) = peer.read(chunk, 0, 5, Version(2)).await?;
        assert_eq!(data, b"hAllo");
        assert_eq!(version, Version(2));
    }

    // Replicate over the wire is reachable too: a third server pulls from
    // the first.
    let (handle_c, client_c, _) = spawn_chunkserver(connector.clone()).await?;
    client_c.replicate(chunk, addr_a.clone(), Version(2)).await?;
    let (data, version) = client_c.read(chunk, 0, 5, Version(2)).await?;
    assert_eq!(data, b"hAllo");
    assert_eq!(version, Version(2));

    handle_a.shutdown().await?;
    handle_b.shutdown().await?;
    handle_c.abort().await
}

#[tokio::test]
async fn teardown_modes_are_clean() -> Result<()> {
    let connector = HttpConnector::new(TIMEOUT);
    let (graceful, client, _) = spawn_chunkserver(connector.clone()).await?;
    client.add(ChunkNum(1), b"x".to_vec(), Version(1)).await?;
    graceful.shutdown().await?;
    match client.list_all_chunks().await {
        Err(ZirconError::Transport(_)) | Err(ZirconError::Timeout(_)) => {}
        other => panic!("expected a transport failure after shutdown, got {other:?}"),
    }

    let (forceful, _, _) = spawn_chunkserver(connector).await?;
    forceful.abort().await
}
