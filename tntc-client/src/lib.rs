//! # tntc-client
//!
//! Client library for Tarantool-compatible servers.
//!
//! This crate provides:
//! - A multiplexed async client over a single connection
//! - Automatic reconnection with round-robin failover
//! - Blocking, future, composable and fire-and-forget operation views
//! - Space and index name resolution through a schema cache

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod ops;
pub mod provider;
pub mod schema;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{Client, ClientStats, OperationResult, Phase};
pub use config::ClientConfig;
pub use error::{ClientError, ConnectionError};
pub use ops::{
    CompletionStage, ComposableOps, FireAndForgetOps, FutureOps, ResponseFuture, SyncOps,
    TarantoolOps,
};
pub use provider::{
    Address, Channel, FnProvider, RoundRobinSocketProvider, SingleSocketProvider, SocketProvider,
    Transport,
};
pub use schema::{SchemaCache, SpaceInfo};
