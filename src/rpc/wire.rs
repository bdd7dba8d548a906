//! On-wire request/response types shared by the serve and client shims.
//!
//! Byte payloads travel base64-encoded inside JSON bodies. Structured
//! errors round-trip through [`WireError`] so the client shim rebuilds the
//! same variant the remote side produced; `Read` additionally reports the
//! observed version even when it fails, so stale-replica callers can
//! diagnose without a second round trip.

use serde::{Deserialize, Serialize};

use crate::error::ZirconError;
use crate::model::{BlockId, ChunkNum, ServerAddress, ServerName, Version};

/// Base64 (de)serialization for binary payload fields.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod code {
    pub const PRECONDITION_FAILED: &str = "precondition_failed";
    pub const VERSION_MISMATCH: &str = "version_mismatch";
    pub const NOT_OWNER: &str = "not_owner";
    pub const STALE_REPLICA: &str = "stale_replica";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONTENDED: &str = "contended";
    pub const TIMEOUT: &str = "timeout";
    pub const TRANSPORT: &str = "transport";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const CORRUPTION: &str = "corruption";
    pub const SERIALIZATION: &str = "serialization";
    pub const INTERNAL: &str = "internal";
}

/// Structured error carried inside responses. `message` is always a
/// non-empty diagnostic; the optional fields carry the payload of the
/// variants that have one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ServerName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

impl From<&ZirconError> for WireError {
    fn from(err: &ZirconError) -> Self {
        let mut wire = WireError {
            code: code::INTERNAL.to_string(),
            message: err.to_string(),
            owner: None,
            version: None,
            expected_version: None,
        };
        match err {
            ZirconError::PreconditionFailed(_) => wire.code = code::PRECONDITION_FAILED.into(),
            ZirconError::VersionMismatch { expected, found } => {
                wire.code = code::VERSION_MISMATCH.into();
                wire.expected_version = Some(*expected);
                wire.version = Some(*found);
            }
            ZirconError::NotOwner { owner } => {
                wire.code = code::NOT_OWNER.into();
                wire.owner = Some(owner.clone());
            }
            ZirconError::StaleReplica { current } => {
                wire.code = code::STALE_REPLICA.into();
                wire.version = Some(current.0);
            }
            ZirconError::NotFound(_) => wire.code = code::NOT_FOUND.into(),
            ZirconError::Contended(_) => wire.code = code::CONTENDED.into(),
            ZirconError::Timeout(_) => wire.code = code::TIMEOUT.into(),
            ZirconError::Transport(_) => wire.code = code::TRANSPORT.into(),
            ZirconError::InvalidArgument(_) => wire.code = code::INVALID_ARGUMENT.into(),
            ZirconError::Corruption(_) => wire.code = code::CORRUPTION.into(),
            ZirconError::Serialization(_) => wire.code = code::SERIALIZATION.into(),
            ZirconError::Internal(_) | ZirconError::Io(_) => {}
        }
        wire
    }
}

impl WireError {
    /// Rebuilds the structured error on the client side.
    pub fn into_error(self) -> ZirconError {
        match self.code.as_str() {
            code::PRECONDITION_FAILED => ZirconError::PreconditionFailed(self.message),
            code::VERSION_MISMATCH => ZirconError::VersionMismatch {
                expected: self.expected_version.unwrap_or_default(),
                found: self.version.unwrap_or_default(),
            },
            code::NOT_OWNER => ZirconError::NotOwner {
                owner: self.owner.unwrap_or_default(),
            },
            code::STALE_REPLICA => ZirconError::StaleReplica {
                current: Version(self.version.unwrap_or_default()),
            },
            code::NOT_FOUND => ZirconError::NotFound("remote resource"),
            code::CONTENDED => ZirconError::Contended("remote contention"),
            code::TIMEOUT => ZirconError::Timeout(self.message),
            code::TRANSPORT => ZirconError::Transport(self.message),
            code::INVALID_ARGUMENT => ZirconError::InvalidArgument(self.message),
            code::CORRUPTION => ZirconError::Corruption(self.message),
            code::SERIALIZATION => ZirconError::Serialization(self.message),
            _ => ZirconError::Internal(self.message),
        }
    }
}

/// Response envelope for mutating chunkserver and sync calls.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartWriteReplicatedRequest {
    pub chunk: ChunkNum,
    pub offset: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub addresses: Vec<ServerAddress>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub chunk: ChunkNum,
    pub server_address: ServerAddress,
    pub version: Version,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    pub chunk: ChunkNum,
    pub offset: u32,
    pub length: u32,
    /// Minimum committed version the caller will accept.
    pub version: Version,
}

/// `Read` reports `version` even on error: a stale replica fills in its own
/// committed version next to the `stale_replica` error.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartWriteRequest {
    pub chunk: ChunkNum,
    pub offset: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitWriteRequest {
    pub chunk: ChunkNum,
    pub hash: String,
    pub old_version: Version,
    pub new_version: Version,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateLatestVersionRequest {
    pub chunk: ChunkNum,
    pub old_version: Version,
    pub new_version: Version,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddRequest {
    pub chunk: ChunkNum,
    #[serde(with = "base64_bytes")]
    pub initial_data: Vec<u8>,
    pub version: Version,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub chunk: ChunkNum,
    pub version: Version,
}

/// Body for calls that take no arguments (`ListAllChunks`, `GetFSRoot`).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EmptyRequest {}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkAtVersion {
    pub chunk: ChunkNum,
    pub version: Version,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListAllChunksResponse {
    pub chunks: Vec<ChunkAtVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub block: BlockId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmSyncResponse {
    pub held: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FsRootResponse {
    pub block: BlockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_errors_roundtrip() {
        let cases = vec![
            ZirconError::PreconditionFailed("old version".into()),
            ZirconError::VersionMismatch { expected: 3, found: 5 },
            ZirconError::NotOwner { owner: "frontend-b".into() },
            ZirconError::StaleReplica { current: Version(9) },
            ZirconError::NotFound("chunk"),
        ];
        for original in cases {
            let wire = WireError::from(&original);
            assert!(!wire.message.is_empty(), "diagnostics must be non-empty");
            let rebuilt = wire.into_error();
            assert_eq!(
                std::mem::discriminant(&original),
                std::mem::discriminant(&rebuilt)
            );
        }
    }

    #[test]
    fn stale_replica_keeps_its_version_across_the_wire() {
        let wire = WireError::from(&ZirconError::StaleReplica { current: Version(7) });
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireError = serde_json::from_str(&json).unwrap();
        match back.into_error() {
            ZirconError::StaleReplica { current } => assert_eq!(current, Version(7)),
            other => panic!("expected StaleReplica, got {other:?}"),
        }
    }

    #[test]
    fn payload_bytes_survive_base64() {
        let request = StartWriteRequest {
            chunk: ChunkNum(7),
            offset: 1,
            data: vec![0, 159, 146, 150],
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: StartWriteRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, request.data);
        assert_eq!(back.chunk, ChunkNum(7));
    }
}
