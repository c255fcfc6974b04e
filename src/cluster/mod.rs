//! Cluster coordination layer.
//!
//! An embedded consensus store is the single source of truth for
//! configuration and per-member status. Members assume one of two roles:
//! writers host a replica of the replicated store and may mutate it;
//! readers connect as pure clients. Every member holds a liveness lease and
//! publishes a heartbeat document under it, so a member that stops
//! heartbeating eventually has its status rows expire from the store.
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │ writer A │   │ writer B │   │ writer C │
//!        │ replica  │◄─►│ replica  │◄─►│ replica  │   raft quorum
//!        └────▲─────┘   └────▲─────┘   └────▲─────┘
//!             │              │              │
//!        ┌────┴─────┐   ┌────┴─────┐   ┌────┴─────┐
//!        │coordintr │   │coordintr │   │coordintr │   heartbeat loops
//!        └──────────┘   └──────────┘   └──────────┘
//!                            ▲
//!                            │ client plane (reads/writes/leases)
//!                       ┌────┴─────┐
//!                       │ reader   │
//!                       └──────────┘
//! ```
//!
//! The coordinator of each member runs a single dedicated task: it drives
//! the readiness protocol (`Booting` self-loops on transient failures with
//! a fixed backoff), then settles into the heartbeat loop until `Closed`.

pub mod admin;
pub mod client;
pub mod config;
pub mod error;
pub mod layout;
pub mod lease;
pub mod members;
pub mod mock;
pub mod raft;
pub mod server;
pub mod traits;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub use admin::{AdminApi, ObjectSpec};
pub use client::ConsensusClient;
pub use config::{ClusterOptions, ClusterRole};
pub use error::{ClusterError, ClusterResult};
pub use layout::Layout;
pub use lease::{LeaseManager, Session, format_lease, parse_lease};
pub use members::{Member, MemberRegistry};
pub use mock::MockCluster;
pub use raft::{NodeId, ReplicaStats};
pub use server::{EmbeddedServer, StartMode};
pub use traits::ClusterApi;

use crate::constants::HEARTBEAT_INTERVAL;
use crate::mqtt::TopicManager;

/// The heartbeat document a member publishes under its lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatus {
    pub options: ClusterOptions,

    /// RFC3339 format.
    pub last_heartbeat_time: String,

    /// Embedded replica stats; present only on writers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raft: Option<ReplicaStats>,
}

/// One member of the cluster: the embedded server (writers), the consensus
/// client, the liveness lease, and the coordinator task gluing them.
#[derive(Debug)]
pub struct Cluster {
    options: ClusterOptions,
    request_timeout: Duration,
    layout: Layout,
    members: Arc<MemberRegistry>,
    lease_manager: LeaseManager,

    server: RwLock<Option<Arc<EmbeddedServer>>>,
    client: RwLock<Option<Arc<ConsensusClient>>>,

    /// The broker-side subscription index, sized from the options.
    topic_manager: Arc<TopicManager>,

    done_tx: tokio::sync::broadcast::Sender<()>,
    closed: AtomicBool,
    pending_promotion: AtomicBool,
}

impl Cluster {
    /// Create a cluster member and start its coordinator task.
    ///
    /// Returns an error only on invalid options; readiness is pursued
    /// asynchronously and retried forever on transient failures.
    pub fn new(options: ClusterOptions) -> ClusterResult<Arc<Self>> {
        if let Err(errors) = options.validate() {
            return Err(ClusterError::Config(format!(
                "invalid cluster options: {}",
                errors.join("; ")
            )));
        }

        let members = Arc::new(MemberRegistry::new(&options)?);
        let layout = Layout::new(&options.name);
        let (done_tx, _) = tokio::sync::broadcast::channel(1);

        let cluster = Arc::new(Self {
            request_timeout: options.request_timeout,
            layout: layout.clone(),
            members,
            lease_manager: LeaseManager::new(layout),
            topic_manager: Arc::new(TopicManager::new(options.topic_cache_size)),
            options,
            server: RwLock::new(None),
            client: RwLock::new(None),
            done_tx,
            closed: AtomicBool::new(false),
            pending_promotion: AtomicBool::new(false),
        });

        let coordinator = cluster.clone();
        tokio::spawn(async move { coordinator.run().await });

        Ok(cluster)
    }

    /// Coordinator task: Booting (self-loop on failure) -> Ready -> Closed.
    async fn run(self: Arc<Self>) {
        let mut done_rx = self.done_tx.subscribe();

        loop {
            match self.get_ready().await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, "Readiness attempt failed");
                    tokio::select! {
                        _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                        _ = done_rx.recv() => return,
                    }
                }
            }
        }

        info!("Cluster is ready");

        self.heartbeat(&mut done_rx).await;
    }

    /// Readiness protocol, per role.
    async fn get_ready(&self) -> ClusterResult<()> {
        if self.options.role == ClusterRole::Reader {
            let client = self.get_client().await?;
            self.lease_manager.init_lease(&client).await?;
            return Ok(());
        }

        let server = match self.get_server().await {
            Ok(server) => server,
            Err(_) => {
                let mode = if !self.options.force_new_cluster
                    && self.members.known_members_len() > 1
                {
                    // Joining an existing quorum: evict any stale
                    // incarnation of this name, register afresh, and clear
                    // old disk state.
                    let assigned_id = self.add_self_to_cluster().await?;
                    self.pending_promotion.store(true, Ordering::SeqCst);
                    StartMode::Join { assigned_id }
                } else {
                    StartMode::Bootstrap
                };
                self.start_server(mode).await?
            }
        };

        // A joiner enters as a learner; promotion is idempotent and is
        // re-attempted on each readiness pass until it lands.
        if self.pending_promotion.load(Ordering::SeqCst) {
            server.promote_self().await?;
            self.pending_promotion.store(false, Ordering::SeqCst);
        }

        let client = self.get_client().await?;
        self.lease_manager
            .init_lease(&client)
            .await
            .map_err(|e| ClusterError::Unavailable(format!("init lease failed: {}", e)))?;

        Ok(())
    }

    /// Self-rejoin: remove any member record carrying this name, add self,
    /// and back up and clear stale local data.
    async fn add_self_to_cluster(&self) -> ClusterResult<NodeId> {
        let client = self.get_client().await?;
        let self_member = self.members.self_member();

        let member_list = client.member_list().await?;
        for member in &member_list {
            if member.name == self_member.name {
                if let Some(id) = member.id {
                    client.member_remove(id).await?;
                    info!(member = %self_member.name, "Removed stale self from member list");
                }
                break;
            }
        }

        let (assigned_id, member_list) = client
            .member_add(
                &self_member.name,
                &self_member.peer_url,
                &self_member.client_url,
            )
            .await?;
        info!(member = %self_member.name, node_id = assigned_id, "Added self to member list");

        self.members.update_cluster_members(member_list);
        self.members.set_self_id(assigned_id);

        // Disk state from a previous incarnation must not interfere with a
        // fresh join.
        if !is_dir_empty(&self.options.data_dir) {
            info!(dir = %self.options.data_dir, "Backing up and cleaning data dir");
            if let Err(e) = backup_and_clean_dir(&self.options.data_dir) {
                error!(dir = %self.options.data_dir, error = %e, "Backup and clean failed");
            }
        }

        Ok(assigned_id)
    }

    /// Start the embedded server, reusing the running one if present.
    async fn start_server(&self, mode: StartMode) -> ClusterResult<Arc<EmbeddedServer>> {
        if let Some(server) = self.server.read().await.as_ref() {
            return Ok(server.clone());
        }

        let mut guard = self.server.write().await;
        if let Some(server) = guard.as_ref() {
            return Ok(server.clone());
        }

        let server = EmbeddedServer::start(&self.options, mode).await?;
        info!("Server is ready");
        *guard = Some(server.clone());
        Ok(server)
    }

    /// The embedded server handle; writers only, after readiness.
    pub async fn get_server(&self) -> ClusterResult<Arc<EmbeddedServer>> {
        self.server
            .read()
            .await
            .clone()
            .ok_or(ClusterError::NotReady("server"))
    }

    /// The shared consensus client, built on first use (double-checked).
    pub async fn get_client(&self) -> ClusterResult<Arc<ConsensusClient>> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(client.clone());
        }

        let mut guard = self.client.write().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let local = self
            .server
            .read()
            .await
            .as_ref()
            .map(|server| server.node());
        let client = Arc::new(ConsensusClient::new(
            self.members.clone(),
            self.request_timeout,
            local,
        ));
        info!("Client is ready");
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Heartbeat loop: publish status, then refresh the member registry,
    /// every tick until shutdown. Per-tick failures are logged and the next
    /// tick retries.
    async fn heartbeat(&self, done_rx: &mut tokio::sync::broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    if let Err(e) = self.sync_status().await {
                        error!(error = %e, "Sync status failed");
                    }
                    if let Err(e) = self.update_members().await {
                        error!(error = %e, "Update members failed");
                    }
                }
                _ = done_rx.recv() => return,
            }
        }
    }

    /// Build and publish this member's status document under its lease.
    async fn sync_status(&self) -> ClusterResult<()> {
        let mut status = MemberStatus {
            options: self.options.clone(),
            last_heartbeat_time: chrono::Utc::now().to_rfc3339(),
            raft: None,
        };

        match self.options.role {
            ClusterRole::Writer => {
                let server = self.get_server().await?;
                status.raft = Some(server.self_stats());
            }
            ClusterRole::Reader => {
                if !self.options.publish_reader_status {
                    return Ok(());
                }
            }
        }

        let document = serde_json::to_string_pretty(&status)?;
        self.put_under_lease(&self.layout.status_member_key(), &document)
            .await
    }

    /// Refresh the registry from the consensus member list.
    async fn update_members(&self) -> ClusterResult<()> {
        let client = self.get_client().await?;
        let member_list = client.member_list().await?;
        self.members.update_cluster_members(member_list);
        Ok(())
    }

    /// The member registry.
    pub fn members(&self) -> &MemberRegistry {
        &self.members
    }

    /// The broker's topic subscription index.
    ///
    /// Purely in-memory; the cluster only sizes it (from
    /// `topic_cache_size`) and ties its lifetime to this member.
    pub fn topic_manager(&self) -> Arc<TopicManager> {
        self.topic_manager.clone()
    }

    /// This member's options.
    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// The election/mutex session, created lazily.
    pub async fn session(&self) -> ClusterResult<Session> {
        let client = self.get_client().await?;
        self.lease_manager.get_session(&client).await
    }

    /// Signal the coordinator and close session, client, and server, in
    /// that order. Safe to call exactly once; later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.done_tx.send(());

        let client = self.client.read().await.clone();
        if let Some(client) = client {
            self.lease_manager.close_session(&client).await;
            client.close().await;
        }

        let server = self.server.write().await.take();
        if let Some(server) = server {
            server.close().await;
        }

        info!("Cluster closed");
    }
}

#[async_trait]
impl ClusterApi for Cluster {
    fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        self.get_client().await?.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> ClusterResult<BTreeMap<String, String>> {
        self.get_client().await?.get_prefix(prefix).await
    }

    async fn put(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.get_client().await?.put(key, value).await
    }

    async fn put_under_lease(&self, key: &str, value: &str) -> ClusterResult<()> {
        let lease = self.lease_manager.lease()?;
        self.get_client()
            .await?
            .put_under_lease(key, value, lease)
            .await
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        self.get_client().await?.delete(key).await
    }

    /// Evict a dead member: drop its quorum membership if still listed,
    /// then revoke its lease so its status rows vanish.
    async fn purge_member(&self, member_name: &str) -> ClusterResult<()> {
        let client = self.get_client().await?;

        let member_list = client.member_list().await?;
        let stale_id = member_list
            .iter()
            .find(|m| m.name == member_name)
            .and_then(|m| m.id);
        if let Some(id) = stale_id {
            client.member_remove(id).await?;
        }

        let lease_key = self.layout.other_lease(member_name);
        let lease_str = client
            .get(&lease_key)
            .await?
            .ok_or(ClusterError::KeyNotFound(lease_key))?;
        let lease = parse_lease(&lease_str)?;

        client.lease_revoke(lease).await?;

        warn!(member = %member_name, "Purged member");
        Ok(())
    }
}

/// Check whether a directory is missing or has no entries.
fn is_dir_empty(dir: &str) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// Move a directory aside to `<dir>.bak-<unix-ms>` and recreate it empty.
fn backup_and_clean_dir(dir: &str) -> std::io::Result<()> {
    let backup = format!("{}.bak-{}", dir, chrono::Utc::now().timestamp_millis());
    std::fs::rename(dir, &backup)?;
    std::fs::create_dir_all(dir)?;
    info!(from = %dir, to = %backup, "Backed up data dir");
    Ok(())
}
