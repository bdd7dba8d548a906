//! Serve-side shims: axum routers exposing the in-process capabilities on
//! the wire, plus teardown handling for the serve loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::chunkserver::Chunkserver;
use crate::error::{Result, ZirconError};
use crate::lease::LeaseAgent;
use crate::model::{Version, FS_ROOT_BLOCK};
use crate::rpc::wire::*;

/// Running RPC endpoint. Dropping the handle leaves the server running;
/// tear it down with [`ServeHandle::shutdown`] (drain in-flight calls) or
/// [`ServeHandle::abort`] (close immediately).
pub struct ServeHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ServeHandle {
    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Graceful teardown: stop accepting, drain in-flight requests, then
    /// report how the serve loop ended. A panicked loop comes back as an
    /// `Internal` error, never a propagated panic.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        Self::join(self.task).await
    }

    /// Forceful teardown: close the listener without draining.
    pub async fn abort(self) -> Result<()> {
        self.task.abort();
        match self.task.await {
            Err(err) if err.is_cancelled() => Ok(()),
            outcome => Self::flatten(outcome),
        }
    }

    async fn join(task: JoinHandle<Result<()>>) -> Result<()> {
        Self::flatten(task.await)
    }

    fn flatten(outcome: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
        match outcome {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                Err(ZirconError::Internal(format!("serve loop panicked: {err}")))
            }
            Err(err) => Err(ZirconError::Internal(format!("serve loop died: {err}"))),
        }
    }
}

async fn publish(listen: &str, app: Router) -> Result<ServeHandle> {
    crate::logging::init();
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|&stop| stop).await;
            })
            .await
            .map_err(ZirconError::from)
    });
    info!(%local_addr, "rpc endpoint listening");
    Ok(ServeHandle {
        local_addr,
        shutdown,
        task,
    })
}

fn layered(router: Router) -> Router {
    // Handler panics become a 500 on that call; the process keeps serving.
    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

type ChunkserverState = Arc<dyn Chunkserver>;

/// Publishes a chunkserver capability on `listen`.
pub async fn publish_chunkserver(listen: &str, server: ChunkserverState) -> Result<ServeHandle> {
    let router = Router::new()
        .route("/chunkserver/start_write_replicated", post(start_write_replicated))
        .route("/chunkserver/replicate", post(replicate))
        .route("/chunkserver/read", post(read))
        .route("/chunkserver/start_write", post(start_write))
        .route("/chunkserver/commit_write", post(commit_write))
        .route("/chunkserver/update_latest_version", post(update_latest_version))
        .route("/chunkserver/add", post(add))
        .route("/chunkserver/delete", post(delete))
        .route("/chunkserver/list_all_chunks", post(list_all_chunks))
        .with_state(server);
    publish(listen, layered(router)).await
}

fn status(result: Result<()>) -> Json<StatusResponse> {
    Json(StatusResponse {
        error: result.err().as_ref().map(WireError::from),
    })
}

async fn start_write_replicated(
    State(server): State<ChunkserverState>,
    Json(req): Json<StartWriteReplicatedRequest>,
) -> Json<StatusResponse> {
    status(
        server
            .start_write_replicated(req.chunk, req.offset, req.data, req.addresses)
            .await,
    )
}

async fn replicate(
    State(server): State<ChunkserverState>,
    Json(req): Json<ReplicateRequest>,
) -> Json<StatusResponse> {
    status(server.replicate(req.chunk, req.server_address, req.version).await)
}

async fn read(
    State(server): State<ChunkserverState>,
    Json(req): Json<ReadRequest>,
) -> Json<ReadResponse> {
    match server.read(req.chunk, req.offset, req.length, req.version).await {
        Ok((data, version)) => Json(ReadResponse {
            data,
            version,
            error: None,
        }),
        Err(err) => {
            // Stale replicas still report what they do have.
            let version = match &err {
                ZirconError::StaleReplica { current } => *current,
                _ => Version::ZERO,
            };
            Json(ReadResponse {
                data: Vec::new(),
                version,
                error: Some(WireError::from(&err)),
            })
        }
    }
}

async fn start_write(
    State(server): State<ChunkserverState>,
    Json(req): Json<StartWriteRequest>,
) -> Json<StatusResponse> {
    status(server.start_write(req.chunk, req.offset, req.data).await)
}

async fn commit_write(
    State(server): State<ChunkserverState>,
    Json(req): Json<CommitWriteRequest>,
) -> Json<StatusResponse> {
    status(
        server
            .commit_write(req.chunk, req.hash, req.old_version, req.new_version)
            .await,
    )
}

async fn update_latest_version(
    State(server): State<ChunkserverState>,
    Json(req): Json<UpdateLatestVersionRequest>,
) -> Json<StatusResponse> {
    status(
        server
            .update_latest_version(req.chunk, req.old_version, req.new_version)
            .await,
    )
}

async fn add(
    State(server): State<ChunkserverState>,
    Json(req): Json<AddRequest>,
) -> Json<StatusResponse> {
    status(server.add(req.chunk, req.initial_data, req.version).await)
}

async fn delete(
    State(server): State<ChunkserverState>,
    Json(req): Json<DeleteRequest>,
) -> Json<StatusResponse> {
    status(server.delete(req.chunk, req.version).await)
}

async fn list_all_chunks(
    State(server): State<ChunkserverState>,
    Json(_req): Json<EmptyRequest>,
) -> Json<ListAllChunksResponse> {
    match server.list_all_chunks().await {
        Ok(chunks) => Json(ListAllChunksResponse {
            chunks: chunks
                .into_iter()
                .map(|(chunk, version)| ChunkAtVersion { chunk, version })
                .collect(),
            error: None,
        }),
        Err(err) => Json(ListAllChunksResponse {
            chunks: Vec::new(),
            error: Some(WireError::from(&err)),
        }),
    }
}

type SyncState = Arc<LeaseAgent>;

/// Publishes the lease coordination surface of `agent` on `listen`, for
/// external frontends.
pub async fn publish_sync(listen: &str, agent: SyncState) -> Result<ServeHandle> {
    let router = Router::new()
        .route("/sync/start", post(start_sync))
        .route("/sync/upgrade", post(upgrade_sync))
        .route("/sync/release", post(release_sync))
        .route("/sync/confirm", post(confirm_sync))
        .route("/sync/fs_root", post(fs_root))
        .with_state(agent);
    publish(listen, layered(router)).await
}

async fn start_sync(
    State(agent): State<SyncState>,
    Json(req): Json<SyncRequest>,
) -> Json<StatusResponse> {
    status(agent.acquire(req.block).await)
}

async fn upgrade_sync(
    State(agent): State<SyncState>,
    Json(req): Json<SyncRequest>,
) -> Json<StatusResponse> {
    // Leases are single-writer from the start, so upgrading is confirming
    // (or claiming) the same exclusive lease.
    status(agent.acquire(req.block).await)
}

async fn release_sync(
    State(agent): State<SyncState>,
    Json(req): Json<SyncRequest>,
) -> Json<StatusResponse> {
    status(agent.release(req.block).await)
}

async fn confirm_sync(
    State(agent): State<SyncState>,
    Json(req): Json<SyncRequest>,
) -> Json<ConfirmSyncResponse> {
    Json(ConfirmSyncResponse {
        held: agent.holds(req.block),
        error: None,
    })
}

async fn fs_root(
    State(_agent): State<SyncState>,
    Json(_req): Json<EmptyRequest>,
) -> Json<FsRootResponse> {
    Json(FsRootResponse {
        block: FS_ROOT_BLOCK,
        error: None,
    })
}
