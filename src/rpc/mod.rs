//! RPC adapters: symmetric shims between the in-process capabilities and
//! the HTTP wire surface.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{HttpConnector, RemoteChunkserver, RemoteSync};
pub use server::{publish_chunkserver, publish_sync, ServeHandle};
