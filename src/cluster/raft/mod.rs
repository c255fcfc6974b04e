//! Embedded consensus layer.
//!
//! Writers host a replica of the replicated key/value + lease store; the
//! replicas form a quorum over a TCP/bincode transport. The layer is split
//! the usual way:
//!
//! - [`commands`] — replicated commands and read-only queries
//! - [`state_machine`] — the deterministic KV + lease + member store
//! - [`storage`] — log storage and snapshot persistence
//! - [`network`] — transport, RPC server, and client-plane messages
//! - [`node`] — the replica wrapper the cluster layer drives
//! - [`config`] — replica tuning derived from cluster options

pub mod commands;
pub mod config;
pub mod network;
pub mod node;
pub mod state_machine;
pub mod storage;
pub mod types;

pub use commands::{QueryResponse, StoreCommand, StoreQuery, StoreResponse};
pub use config::ReplicaConfig;
pub use network::{MeshNetworkFactory, RpcMessage, RpcResponse, RpcServer, send_rpc};
pub use node::{ReplicaNode, ReplicaStats};
pub use state_machine::StoreStateMachine;
pub use storage::ReplicaStore;
pub use types::{NodeId, TypeConfig};
