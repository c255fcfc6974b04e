//! Consensus replica wrapper providing a simpler interface.
//!
//! Wraps the openraft node and exposes the handful of operations the
//! cluster layer needs: initialize, replicated writes with leader
//! forwarding, linearizable reads, readiness waiting, and shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::storage::Adaptor;
use openraft::{BasicNode, Raft};
use tokio::sync::RwLock;
use tracing::info;

use super::commands::{QueryResponse, StoreCommand, StoreQuery, StoreResponse};
use super::config::ReplicaConfig;
use super::network::{MeshNetworkFactory, RpcMessage, RpcResponse, RpcServer, send_rpc};
use super::state_machine::StoreStateMachine;
use super::storage::ReplicaStore;
use super::types::{NodeId, TypeConfig};

use crate::cluster::error::{ClusterError, ClusterResult};

/// Self-reported stats of the embedded replica, published in the member
/// status document of writers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ReplicaStats {
    pub id: String,
    pub state: String,
    pub start_time: String,
}

/// An embedded consensus replica.
pub struct ReplicaNode {
    raft: Arc<Raft<TypeConfig>>,
    state_machine: StoreStateMachine,
    network: MeshNetworkFactory,
    node_id: NodeId,
    config: ReplicaConfig,
    start_time: String,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    fatal_rx: tokio::sync::watch::Receiver<bool>,
    rpc_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaNode")
            .field("state_machine", &self.state_machine)
            .field("network", &self.network)
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .field("start_time", &self.start_time)
            .field("shutdown_tx", &self.shutdown_tx)
            .field("fatal_rx", &self.fatal_rx)
            .field("rpc_task", &self.rpc_task)
            .finish()
    }
}

impl ReplicaNode {
    /// Create and start a new replica.
    ///
    /// Restores any persisted snapshot from the data directory, starts the
    /// RPC server, and leaves the node waiting for a quorum. When
    /// `force_new_cluster` is set, persisted membership is discarded so the
    /// node can re-form a singleton quorum over its existing data.
    pub async fn new(config: ReplicaConfig, force_new_cluster: bool) -> ClusterResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(ClusterError::Config(format!(
                "Invalid replica config: {}",
                errors.join(", ")
            )));
        }

        std::fs::create_dir_all(&config.data_dir)?;
        let object_store = Arc::new(
            object_store::local::LocalFileSystem::new_with_prefix(&config.data_dir)
                .map_err(|e| ClusterError::Config(format!("Invalid data dir: {}", e)))?,
        );

        let store = ReplicaStore::new(object_store, "snapshots");

        match store.load_snapshot_from_store().await {
            Ok(true) => {
                info!(node_id = config.node_id, "Restored state from snapshot");
            }
            Ok(false) => {
                info!(
                    node_id = config.node_id,
                    "No existing snapshot found, starting fresh"
                );
            }
            Err(e) => {
                tracing::warn!(
                    node_id = config.node_id,
                    error = %e,
                    "Failed to load snapshot, starting with empty state"
                );
            }
        }

        if force_new_cluster {
            store.reset_membership().await;
            info!(
                node_id = config.node_id,
                "Discarded persisted membership (force new cluster)"
            );
        }

        let state_machine = store.state_machine();
        let network = MeshNetworkFactory::new();

        let openraft_config = Arc::new(
            config
                .to_openraft_config()
                .validate()
                .map_err(|e| ClusterError::Config(format!("Invalid openraft config: {}", e)))?,
        );

        let (log_store, sm_store) = Adaptor::new(store);

        let raft = Raft::new(
            config.node_id,
            openraft_config,
            network.clone(),
            log_store,
            sm_store,
        )
        .await
        .map_err(|e| ClusterError::Raft(format!("Failed to create replica: {}", e)))?;

        let raft = Arc::new(raft);
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let rpc_server = RpcServer::new(
            raft.clone(),
            state_machine.clone(),
            config.raft_addr.clone(),
        );
        let mut shutdown_rx = shutdown_tx.subscribe();
        let (fatal_tx, fatal_rx) = tokio::sync::watch::channel(false);
        let rpc_task = tokio::spawn(async move {
            tokio::select! {
                result = rpc_server.run() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Consensus RPC server error");
                        let _ = fatal_tx.send(true);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Consensus RPC server shutting down");
                }
            }
        });

        let node = Self {
            raft,
            state_machine,
            network,
            node_id: config.node_id,
            config: config.clone(),
            start_time: chrono::Utc::now().to_rfc3339(),
            shutdown_tx,
            fatal_rx,
            rpc_task: RwLock::new(Some(rpc_task)),
        };

        info!(
            node_id = config.node_id,
            raft_addr = %config.raft_addr,
            "Consensus replica started"
        );

        Ok(node)
    }

    /// Initialize the cluster with this node as the only voter.
    ///
    /// Called on the bootstrap member; other members join dynamically
    /// through the AddMember/PromoteMember RPCs.
    pub async fn initialize_cluster(&self) -> ClusterResult<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            BasicNode {
                addr: self.config.raft_addr.clone(),
            },
        );

        self.raft
            .initialize(members)
            .await
            .map_err(|e| ClusterError::Raft(format!("Failed to initialize cluster: {}", e)))?;

        info!(node_id = self.node_id, "Cluster initialized as single node");
        Ok(())
    }

    /// Check if the cluster already has voters (from a restored snapshot or
    /// a previous initialization). Checked before `initialize_cluster` to
    /// avoid re-initialization errors on restart.
    pub fn is_initialized(&self) -> bool {
        let metrics_watch = self.raft.metrics();
        let metrics = metrics_watch.borrow();
        metrics
            .membership_config
            .membership()
            .voter_ids()
            .next()
            .is_some()
    }

    /// Wait until this replica observes a leader, or time out.
    pub async fn wait_leader(&self, timeout: Duration) -> ClusterResult<()> {
        self.raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|e| ClusterError::Raft(format!("Waiting for leader failed: {}", e)))?;
        Ok(())
    }

    /// Write a command through the replicated log.
    ///
    /// If this node is not the leader the request is forwarded once to the
    /// leader's RPC endpoint.
    pub async fn write(&self, command: StoreCommand) -> ClusterResult<StoreResponse> {
        match self.raft.client_write(command.clone()).await {
            Ok(response) => Ok(response.data),
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("forward request to") || err_str.contains("ForwardToLeader") {
                    let Some(leader_addr) = self.leader_addr() else {
                        return Err(ClusterError::Unavailable(format!(
                            "Not the leader and no leader known: {}",
                            e
                        )));
                    };
                    match send_rpc(&leader_addr, &RpcMessage::ClientWrite(command))
                        .await
                        .map_err(|e| ClusterError::Unavailable(e.to_string()))?
                    {
                        RpcResponse::ClientWriteOk(response) => Ok(response),
                        RpcResponse::NotLeader { .. } => Err(ClusterError::Unavailable(
                            "Leadership changed while forwarding".to_string(),
                        )),
                        RpcResponse::Error(e) => Err(ClusterError::Raft(e)),
                        _ => Err(ClusterError::Raft("unexpected response".to_string())),
                    }
                } else {
                    Err(ClusterError::Raft(format!("Write failed: {}", e)))
                }
            }
        }
    }

    /// Answer a query with linearizable semantics.
    ///
    /// On the leader this applies a read barrier and serves from local
    /// state; otherwise the query is forwarded to the leader.
    pub async fn read(&self, query: StoreQuery) -> ClusterResult<QueryResponse> {
        if self.is_leader() {
            self.raft
                .ensure_linearizable()
                .await
                .map_err(|e| ClusterError::Raft(format!("Read barrier failed: {}", e)))?;
            return Ok(self.state_machine.query(query).await);
        }

        let Some(leader_addr) = self.leader_addr() else {
            return Err(ClusterError::Unavailable("No leader known".to_string()));
        };
        match send_rpc(&leader_addr, &RpcMessage::ClientRead(query))
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?
        {
            RpcResponse::ClientReadOk(response) => Ok(response),
            RpcResponse::NotLeader { .. } => Err(ClusterError::Unavailable(
                "Leadership changed while forwarding".to_string(),
            )),
            RpcResponse::Error(e) => Err(ClusterError::Raft(e)),
            _ => Err(ClusterError::Raft("unexpected response".to_string())),
        }
    }

    /// Get the current leader id.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Check if this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.node_id)
    }

    /// Transport address of the current leader, if known.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        if let Some(node) = metrics.membership_config.membership().get_node(&leader) {
            return Some(node.addr.clone());
        }
        self.network.node_addr(leader)
    }

    /// The local state machine. Local reads may be stale; use [`Self::read`]
    /// for linearizable reads.
    pub fn state_machine(&self) -> StoreStateMachine {
        self.state_machine.clone()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Receiver flipping to `true` when the replica hits a fatal serving
    /// error after startup.
    pub fn subscribe_fatal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.fatal_rx.clone()
    }

    /// Self stats for the member status document.
    pub fn self_stats(&self) -> ReplicaStats {
        let metrics = self.raft.metrics().borrow().clone();
        ReplicaStats {
            id: format!("{:x}", self.node_id),
            state: format!("{:?}", metrics.state),
            start_time: self.start_time.clone(),
        }
    }

    /// Gracefully shut down the replica: stop the Raft core, then the RPC
    /// listener. Safe to call once; later calls are no-ops.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        let _ = self.shutdown_tx.send(());

        self.raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Raft(format!("Failed to shut down replica: {}", e)))?;

        if let Some(task) = self.rpc_task.write().await.take() {
            task.abort();
        }

        info!(node_id = self.node_id, "Consensus replica shut down");
        Ok(())
    }

    /// Hard stop: abort the RPC listener immediately and tear down the Raft
    /// core without surfacing its errors.
    pub async fn hard_stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.rpc_task.write().await.take() {
            task.abort();
        }
        let _ = self.raft.shutdown().await;
        info!(node_id = self.node_id, "Hard stopped replica");
    }
}
