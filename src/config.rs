//! Deployment configuration for chunkservers and metadata frontends.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ZirconError};
use crate::model::{ServerAddress, ServerName};

/// Settings for one chunkserver process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkserverConfig {
    /// Address peers dial to reach this server; also its identity in
    /// replica sets.
    pub address: ServerAddress,
    /// Socket the RPC surface binds to.
    pub listen: String,
    /// Per-call deadline applied to outbound peer RPCs, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ChunkserverConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9600".into(),
            listen: "127.0.0.1:9600".into(),
            request_timeout_ms: 5_000,
        }
    }
}

impl ChunkserverConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Settings for one metadata frontend (lease agent + metadata cache).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Identity recorded in lease records and surfaced in redirects.
    pub server_name: ServerName,
    /// Socket the sync RPC surface binds to.
    pub listen: String,
    /// Lifetime of a lease record in the KV store, in milliseconds.
    pub lease_ttl_ms: u64,
    /// Cadence of the background renewal task, in milliseconds. Must be
    /// comfortably below the TTL; `validate` enforces a 2x margin.
    pub refresh_interval_ms: u64,
    /// Per-call deadline for outbound RPCs, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            server_name: "frontend-0".into(),
            listen: "127.0.0.1:9700".into(),
            lease_ttl_ms: 10_000,
            refresh_interval_ms: 3_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl FrontendConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(ZirconError::InvalidArgument(
                "server_name must be non-empty".into(),
            ));
        }
        if self.lease_ttl_ms == 0 {
            return Err(ZirconError::InvalidArgument("lease_ttl_ms must be > 0".into()));
        }
        if self.refresh_interval_ms * 2 > self.lease_ttl_ms {
            return Err(ZirconError::InvalidArgument(
                "refresh_interval_ms must be at most half of lease_ttl_ms".into(),
            ));
        }
        Ok(())
    }
}

fn parse_toml<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    toml::from_str(text).map_err(|err| ZirconError::Serialization(err.to_string()))
}

/// Loads a [`ChunkserverConfig`] from a TOML file.
pub fn load_chunkserver_config(path: impl AsRef<Path>) -> Result<ChunkserverConfig> {
    parse_toml(&std::fs::read_to_string(path)?)
}

/// Loads a [`FrontendConfig`] from a TOML file, validating it.
pub fn load_frontend_config(path: impl AsRef<Path>) -> Result<FrontendConfig> {
    let config: FrontendConfig = parse_toml(&std::fs::read_to_string(path)?)?;
    config.validate()?;
    Ok(config)
}
