//! # Meshgate
//! Cluster-aware API gateway control plane core.
//!
//! This crate provides the two coordination-heavy subsystems of the meshgate
//! control plane:
//!
//! - [`cluster`] — a self-hosted, embedded consensus store used as the single
//!   source of truth for configuration and per-member status. Members assume
//!   one of two roles (writer or reader), bootstrap or join a quorum, hold a
//!   liveness lease, and publish heartbeats whose absence expires their state.
//! - [`mqtt`] — a concurrent hierarchical topic subscription index with MQTT
//!   wildcard matching (`+` single level, `#` multi-level), used to dispatch
//!   published messages to subscribing clients.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/),
//!   [openraft](https://docs.rs/openraft/latest/openraft/)
//! - Be a building block for gateway nodes: the REST admin surface and the
//!   MQTT packet layer sit on top of these cores
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use meshgate::cluster::{Cluster, ClusterOptions, ClusterRole};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ClusterOptions {
//!         name: "member-001".to_string(),
//!         role: ClusterRole::Writer,
//!         data_dir: "/var/lib/meshgate".to_string(),
//!         peer_url: "127.0.0.1:2380".to_string(),
//!         client_url: "127.0.0.1:2379".to_string(),
//!         ..ClusterOptions::default()
//!     };
//!     let cluster = Cluster::new(options)?;
//!
//!     // The broker-side subscription index is sized from the options.
//!     let topics = cluster.topic_manager();
//!     topics.subscribe(&["sport/#".to_string()], &[1], "client-1")?;
//!
//!     // ... serve traffic ...
//!
//!     cluster.close().await;
//!     Ok(())
//! }
//! ```
//!
//! Topic routing is independent of the cluster and purely in-memory:
//!
//! ```rust
//! use meshgate::mqtt::TopicManager;
//!
//! let manager = TopicManager::new(4096);
//! manager.subscribe(&["sport/#".to_string()], &[1], "client-1").unwrap();
//! let subscribers = manager.find_subscribers("sport/tennis/player1").unwrap();
//! assert_eq!(subscribers.get("client-1"), Some(&1));
//! ```

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod mqtt;
pub mod telemetry;
