//! Lease coordination over the external consensus KV.

pub mod agent;
pub mod kv;

pub use agent::{LeaseAgent, LeaseMetricsSnapshot};
pub use kv::{KvStore, MemoryKv, VersionedValue};
