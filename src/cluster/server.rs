//! Embedded consensus server lifecycle.
//!
//! Writers host a local replica of the replicated store. Startup is a small
//! three-state automaton {Starting, Ready, TimedOut} driven by two one-shot
//! signals: the replica observing a leader, and a fixed timeout. On timeout
//! the partially started replica is hard-closed and failure is reported to
//! the coordinator, which retries at the next readiness attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::config::ClusterOptions;
use super::error::{ClusterError, ClusterResult};
use super::raft::{
    NodeId, ReplicaConfig, ReplicaNode, ReplicaStats, RpcMessage, RpcResponse, StoreCommand,
    send_rpc,
};
use crate::constants::{HEARTBEAT_INTERVAL, WAIT_SERVER_TIMEOUT};

/// How a writer enters the quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Form (or re-form) the quorum with this node as first voter.
    Bootstrap,
    /// Join an existing quorum under a consensus-assigned node id.
    Join { assigned_id: NodeId },
}

/// Startup automaton outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartState {
    Ready,
    TimedOut,
}

/// The embedded consensus server of a writer member.
#[derive(Debug)]
pub struct EmbeddedServer {
    node: Arc<ReplicaNode>,
    ready: AtomicBool,
    monitor_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    sweeper_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl EmbeddedServer {
    /// Start the embedded server and wait for it to become ready.
    ///
    /// On timeout the server is hard-closed and an error is returned; the
    /// coordinator sleeps and retries.
    pub async fn start(options: &ClusterOptions, mode: StartMode) -> ClusterResult<Arc<Self>> {
        let node_id = match mode {
            StartMode::Bootstrap => 1,
            StartMode::Join { assigned_id } => assigned_id,
        };

        let config = ReplicaConfig {
            node_id,
            member_name: options.name.clone(),
            raft_addr: options.peer_url.clone(),
            data_dir: options.data_dir.clone(),
            ..ReplicaConfig::default()
        };

        let node = Arc::new(ReplicaNode::new(config, options.force_new_cluster).await?);

        if mode == StartMode::Bootstrap && !node.is_initialized() {
            node.initialize_cluster().await?;
        }

        let state = match node.wait_leader(WAIT_SERVER_TIMEOUT).await {
            Ok(()) => StartState::Ready,
            Err(_) => StartState::TimedOut,
        };

        if state == StartState::TimedOut {
            node.hard_stop().await;
            return Err(ClusterError::Timeout("start server"));
        }

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let server = Arc::new(Self {
            node,
            ready: AtomicBool::new(true),
            monitor_task: Mutex::new(None),
            sweeper_task: Mutex::new(None),
            shutdown_tx,
        });

        server.spawn_monitor().await;
        server.spawn_lease_sweeper().await;

        info!(node_id, "Embedded server is ready");
        Ok(server)
    }

    /// Monitor: close the server if it errors after becoming ready.
    async fn spawn_monitor(self: &Arc<Self>) {
        let server = self.clone();
        let mut fatal_rx = self.node.subscribe_fatal();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = fatal_rx.changed() => {
                    if *fatal_rx.borrow() {
                        error!("Embedded server failed while serving, closing it");
                        server.ready.store(false, Ordering::SeqCst);
                        server.node.hard_stop().await;
                    }
                }
                _ = shutdown_rx.recv() => {}
            }
        });
        *self.monitor_task.lock().await = Some(task);
    }

    /// Leader-side sweeper revoking leases whose keepalive deadline passed.
    ///
    /// Expiry is decided here, on one node, and replicated as explicit
    /// revoke commands so the state machine stays deterministic.
    async fn spawn_lease_sweeper(self: &Arc<Self>) {
        let node = self.node.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                        if !node.is_leader() {
                            continue;
                        }
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        for id in node.state_machine().expired_leases(now_ms).await {
                            match node.write(StoreCommand::LeaseRevoke { id }).await {
                                Ok(_) => info!(lease = %format!("{:x}", id), "Revoked expired lease"),
                                Err(e) => warn!(lease = %format!("{:x}", id), error = %e, "Failed to revoke expired lease"),
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => return,
                }
            }
        });
        *self.sweeper_task.lock().await = Some(task);
    }

    /// Ask the leader to promote this node from learner to voter.
    ///
    /// Idempotent: promoting an existing voter re-commits the same voter
    /// set. Called by the coordinator after a join-mode start.
    pub async fn promote_self(&self) -> ClusterResult<()> {
        let mut addr = self
            .node
            .leader_addr()
            .ok_or(ClusterError::Unavailable("No leader known".to_string()))?;

        // One redial on a stale leader hint.
        for _ in 0..2 {
            match send_rpc(
                &addr,
                &RpcMessage::PromoteMember {
                    id: self.node.node_id(),
                },
            )
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?
            {
                RpcResponse::Ok => return Ok(()),
                RpcResponse::NotLeader {
                    leader_addr: Some(hint),
                } => addr = hint,
                RpcResponse::NotLeader { leader_addr: None } => {
                    return Err(ClusterError::Unavailable("No leader known".to_string()));
                }
                RpcResponse::Error(e) => return Err(ClusterError::Raft(e)),
                _ => return Err(ClusterError::Raft("unexpected response".to_string())),
            }
        }
        Err(ClusterError::Unavailable(
            "Leadership kept moving during promotion".to_string(),
        ))
    }

    /// The underlying replica.
    pub fn node(&self) -> Arc<ReplicaNode> {
        self.node.clone()
    }

    /// Whether the server reached ready and is still serving.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Self stats for the member status document.
    pub fn self_stats(&self) -> ReplicaStats {
        self.node.self_stats()
    }

    /// Close the server: graceful when ready, hard stop otherwise. The
    /// monitor and sweeper tasks are stopped either way.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());

        if let Some(task) = self.sweeper_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.monitor_task.lock().await.take() {
            task.abort();
        }

        if self.ready.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.node.shutdown().await {
                warn!(error = %e, "Graceful close failed, hard stopping");
                self.node.hard_stop().await;
            }
        } else {
            self.node.hard_stop().await;
        }
    }
}
