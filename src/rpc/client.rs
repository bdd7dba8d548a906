//! Client-side shims: HTTP wrappers presenting remote services as the
//! in-process capabilities.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::chunkserver::{Chunkserver, Connector};
use crate::error::{Result, ZirconError};
use crate::model::{BlockId, ChunkNum, ServerAddress, Version};
use crate::rpc::wire::*;

fn map_reqwest(err: reqwest::Error) -> ZirconError {
    if err.is_timeout() {
        ZirconError::Timeout(err.to_string())
    } else {
        ZirconError::Transport(err.to_string())
    }
}

#[derive(Clone)]
struct HttpClient {
    base: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    fn new(address: &ServerAddress, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            base: format!("http://{address}"),
            client,
            timeout,
        }
    }

    /// One request/response exchange under the per-call deadline. Non-2xx
    /// statuses (including panics converted to 500 on the serve side) come
    /// back as `Internal`.
    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp> {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ZirconError::Internal(format!(
                "{path} returned HTTP {status}"
            )));
        }
        response.json().await.map_err(map_reqwest)
    }
}

fn unwrap_status(response: StatusResponse) -> Result<()> {
    match response.error {
        Some(error) => Err(error.into_error()),
        None => Ok(()),
    }
}

/// Wire client presenting a remote chunkserver as the in-process
/// [`Chunkserver`] capability.
pub struct RemoteChunkserver {
    http: HttpClient,
}

impl RemoteChunkserver {
    pub fn new(address: &ServerAddress, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            http: HttpClient::new(address, reqwest::Client::new(), timeout),
        })
    }

    fn with_client(address: &ServerAddress, client: reqwest::Client, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            http: HttpClient::new(address, client, timeout),
        })
    }
}

#[async_trait]
impl Chunkserver for RemoteChunkserver {
    async fn add(&self, chunk: ChunkNum, initial_data: Vec<u8>, version: Version) -> Result<()> {
        let request = AddRequest {
            chunk,
            initial_data,
            version,
        };
        unwrap_status(self.http.post("/chunkserver/add", &request).await?)
    }

    async fn read(
        &self,
        chunk: ChunkNum,
        offset: u32,
        length: u32,
        min_version: Version,
    ) -> Result<(Vec<u8>, Version)> {
        let request = ReadRequest {
            chunk,
            offset,
            length,
            version: min_version,
        };
        let response: ReadResponse = self.http.post("/chunkserver/read", &request).await?;
        match response.error {
            Some(error) => Err(error.into_error()),
            None => Ok((response.data, response.version)),
        }
    }

    async fn start_write(&self, chunk: ChunkNum, offset: u32, data: Vec<u8>) -> Result<()> {
        let request = StartWriteRequest { chunk, offset, data };
        unwrap_status(self.http.post("/chunkserver/start_write", &request).await?)
    }

    async fn start_write_replicated(
        &self,
        chunk: ChunkNum,
        offset: u32,
        data: Vec<u8>,
        replicas: Vec<ServerAddress>,
    ) -> Result<()> {
        let request = StartWriteReplicatedRequest {
            chunk,
            offset,
            data,
            addresses: replicas,
        };
        unwrap_status(
            self.http
                .post("/chunkserver/start_write_replicated", &request)
                .await?,
        )
    }

    async fn commit_write(
        &self,
        chunk: ChunkNum,
        hash: String,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        let request = CommitWriteRequest {
            chunk,
            hash,
            old_version,
            new_version,
        };
        unwrap_status(self.http.post("/chunkserver/commit_write", &request).await?)
    }

    async fn update_latest_version(
        &self,
        chunk: ChunkNum,
        old_version: Version,
        new_version: Version,
    ) -> Result<()> {
        let request = UpdateLatestVersionRequest {
            chunk,
            old_version,
            new_version,
        };
        unwrap_status(
            self.http
                .post("/chunkserver/update_latest_version", &request)
                .await?,
        )
    }

    async fn replicate(
        &self,
        chunk: ChunkNum,
        source: ServerAddress,
        version: Version,
    ) -> Result<()> {
        let request = ReplicateRequest {
            chunk,
            server_address: source,
            version,
        };
        unwrap_status(self.http.post("/chunkserver/replicate", &request).await?)
    }

    async fn delete(&self, chunk: ChunkNum, version: Version) -> Result<()> {
        let request = DeleteRequest { chunk, version };
        unwrap_status(self.http.post("/chunkserver/delete", &request).await?)
    }

    async fn list_all_chunks(&self) -> Result<Vec<(ChunkNum, Version)>> {
        let response: ListAllChunksResponse = self
            .http
            .post("/chunkserver/list_all_chunks", &EmptyRequest::default())
            .await?;
        match response.error {
            Some(error) => Err(error.into_error()),
            None => Ok(response
                .chunks
                .into_iter()
                .map(|entry| (entry.chunk, entry.version))
                .collect()),
        }
    }
}

/// [`Connector`] dialing peers over HTTP. One shared connection pool;
/// per-address wrappers are memoized.
pub struct HttpConnector {
    client: reqwest::Client,
    timeout: Duration,
    peers: RwLock<HashMap<ServerAddress, Arc<RemoteChunkserver>>>,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            timeout,
            peers: RwLock::new(HashMap::new()),
        })
    }
}

impl Connector for HttpConnector {
    fn connect(&self, address: &ServerAddress) -> Result<Arc<dyn Chunkserver>> {
        if let Some(peer) = self.peers.read().get(address) {
            return Ok(peer.clone());
        }
        let peer = RemoteChunkserver::with_client(address, self.client.clone(), self.timeout);
        self.peers.write().insert(address.clone(), peer.clone());
        Ok(peer)
    }
}

/// Wire client for the sync/lease coordination surface of a frontend.
pub struct RemoteSync {
    http: HttpClient,
}

impl RemoteSync {
    pub fn new(address: &ServerAddress, timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(address, reqwest::Client::new(), timeout),
        }
    }

    pub async fn start_sync(&self, block: BlockId) -> Result<()> {
        unwrap_status(self.http.post("/sync/start", &SyncRequest { block }).await?)
    }

    pub async fn upgrade_sync(&self, block: BlockId) -> Result<()> {
        unwrap_status(self.http.post("/sync/upgrade", &SyncRequest { block }).await?)
    }

    pub async fn release_sync(&self, block: BlockId) -> Result<()> {
        unwrap_status(self.http.post("/sync/release", &SyncRequest { block }).await?)
    }

    pub async fn confirm_sync(&self, block: BlockId) -> Result<bool> {
        let response: ConfirmSyncResponse =
            self.http.post("/sync/confirm", &SyncRequest { block }).await?;
        match response.error {
            Some(error) => Err(error.into_error()),
            None => Ok(response.held),
        }
    }

    pub async fn get_fs_root(&self) -> Result<BlockId> {
        let response: FsRootResponse =
            self.http.post("/sync/fs_root", &EmptyRequest::default()).await?;
        match response.error {
            Some(error) => Err(error.into_error()),
            None => Ok(response.block),
        }
    }
}
