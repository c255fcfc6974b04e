//! Network transport for consensus RPCs.
//!
//! A simple TCP transport with length-prefixed bincode frames carries both
//! the Raft-internal RPCs (append entries, vote, install snapshot) and the
//! client plane (writes, linearizable reads, membership operations). Writes
//! and reads are only served by the leader; other nodes answer with a leader
//! hint and the caller redials.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use openraft::BasicNode;
use openraft::error::{InstallSnapshotError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::{QueryResponse, StoreCommand, StoreQuery, StoreResponse};
use super::state_machine::StoreStateMachine;
use super::types::{NodeId, TypeConfig};
use crate::cluster::members::Member;

/// Timeout for RPC connection establishment.
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for RPC read/write operations.
const RPC_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of RPC retry attempts.
const RPC_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff between retries.
const RPC_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Maximum delay for exponential backoff.
const RPC_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Maximum frame size accepted from a peer.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Message types carried over the transport.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RpcMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),

    /// Client write, applied through the replicated log. Leader only.
    ClientWrite(StoreCommand),
    /// Linearizable read. Leader only.
    ClientRead(StoreQuery),
    /// Register a member and start replicating to it as a learner.
    AddMember {
        name: String,
        peer_url: String,
        client_url: String,
    },
    /// Promote a caught-up learner to voter.
    PromoteMember { id: NodeId },
    /// Remove a member from the voter set and drop its record.
    RemoveMember { id: NodeId },
    /// Fetch the registered member list.
    MemberList,
}

/// Responses to [`RpcMessage`].
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RpcResponse {
    AppendEntries(AppendEntriesResponse<NodeId>),
    Vote(VoteResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),

    ClientWriteOk(StoreResponse),
    ClientReadOk(QueryResponse),
    MemberAdded { id: NodeId, members: Vec<Member> },
    Members(Vec<Member>),
    Ok,

    /// This node is not the leader; redial the hinted address.
    NotLeader { leader_addr: Option<String> },
    Error(String),
}

/// Send one RPC to `addr` and await the response. Used by the client plane
/// with the client dial timeout; the Raft-internal path goes through
/// [`RaftNetworkConnection`] which caches its connection.
pub async fn send_rpc(addr: &str, message: &RpcMessage) -> Result<RpcResponse, std::io::Error> {
    let data = bincode::serialize(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut stream = timeout(crate::constants::DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("Connection timeout to {}", addr),
            )
        })??;
    stream.set_nodelay(true)?;

    do_rpc_with_timeout(&mut stream, &data).await
}

async fn do_rpc_with_timeout(
    stream: &mut TcpStream,
    data: &[u8],
) -> Result<RpcResponse, std::io::Error> {
    timeout(RPC_OPERATION_TIMEOUT, do_rpc(stream, data))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "RPC operation timeout"))?
}

async fn do_rpc(stream: &mut TcpStream, data: &[u8]) -> Result<RpcResponse, std::io::Error> {
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let response_len = u32::from_be_bytes(len_buf) as usize;
    if response_len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "response frame too large",
        ));
    }

    let mut response_buf = vec![0u8; response_len];
    stream.read_exact(&mut response_buf).await?;

    bincode::deserialize(&response_buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Network factory handing out per-target connections.
#[derive(Debug, Clone, Default)]
pub struct MeshNetworkFactory {
    nodes: Arc<DashMap<NodeId, String>>,
}

impl MeshNetworkFactory {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
        }
    }

    /// Record a node's transport address.
    pub fn add_node(&self, node_id: NodeId, addr: String) {
        self.nodes.insert(node_id, addr);
    }

    /// Look up a node's transport address.
    pub fn node_addr(&self, node_id: NodeId) -> Option<String> {
        self.nodes.get(&node_id).map(|a| a.clone())
    }
}

impl RaftNetworkFactory<TypeConfig> for MeshNetworkFactory {
    type Network = RaftNetworkConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        self.nodes.insert(target, node.addr.clone());

        RaftNetworkConnection {
            target_addr: node.addr.clone(),
            cached_conn: tokio::sync::Mutex::new(None),
        }
    }
}

/// A connection to a remote replica.
pub struct RaftNetworkConnection {
    target_addr: String,
    /// Cached TCP connection for reuse.
    cached_conn: tokio::sync::Mutex<Option<TcpStream>>,
}

impl RaftNetworkConnection {
    /// Send an RPC with timeout and bounded retries.
    async fn send_rpc(&self, message: RpcMessage) -> Result<RpcResponse, std::io::Error> {
        let data = bincode::serialize(&message)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut last_error = None;

        for attempt in 0..=RPC_MAX_RETRIES {
            if attempt > 0 {
                let delay = std::cmp::min(
                    RPC_RETRY_BASE_DELAY * (1 << (attempt - 1)),
                    RPC_RETRY_MAX_DELAY,
                );
                // jitter of +/-25%
                let jitter_factor = 0.75 + (fastrand::f64() * 0.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor);
                debug!(
                    target = %self.target_addr,
                    attempt,
                    delay_ms = jittered.as_millis(),
                    "Retrying RPC after backoff"
                );
                tokio::time::sleep(jittered).await;
            }

            match self.try_send_rpc(&data).await {
                Ok(response) => return Ok(response),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| std::io::Error::other("RPC failed with no error")))
    }

    /// Single attempt, reusing the cached connection when it is still alive.
    async fn try_send_rpc(&self, data: &[u8]) -> Result<RpcResponse, std::io::Error> {
        let mut guard = self.cached_conn.lock().await;
        if let Some(ref mut stream) = *guard {
            match do_rpc_with_timeout(stream, data).await {
                Ok(response) => return Ok(response),
                Err(_) => {
                    *guard = None;
                }
            }
        }

        let stream = timeout(RPC_CONNECT_TIMEOUT, TcpStream::connect(&self.target_addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Connection timeout to {}", self.target_addr),
                )
            })??;

        let mut stream = stream;
        stream.set_nodelay(true)?;

        let response = do_rpc_with_timeout(&mut stream, data).await?;
        *guard = Some(stream);
        Ok(response)
    }
}

fn network_error<E: std::error::Error + 'static>(
    e: &E,
) -> RPCError<NodeId, BasicNode, RaftError<NodeId>> {
    RPCError::Network(openraft::error::NetworkError::new(e))
}

impl RaftNetwork<TypeConfig> for RaftNetworkConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        let response = self
            .send_rpc(RpcMessage::AppendEntries(req))
            .await
            .map_err(|e| network_error(&e))?;

        match response {
            RpcResponse::AppendEntries(resp) => Ok(resp),
            RpcResponse::Error(e) => Err(network_error(&std::io::Error::other(e))),
            _ => Err(network_error(&std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Unexpected response type",
            ))),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let response = self
            .send_rpc(RpcMessage::Vote(req))
            .await
            .map_err(|e| network_error(&e))?;

        match response {
            RpcResponse::Vote(resp) => Ok(resp),
            RpcResponse::Error(e) => Err(network_error(&std::io::Error::other(e))),
            _ => Err(network_error(&std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Unexpected response type",
            ))),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let response = self
            .send_rpc(RpcMessage::InstallSnapshot(req))
            .await
            .map_err(|e| RPCError::Network(openraft::error::NetworkError::new(&e)))?;

        match response {
            RpcResponse::InstallSnapshot(resp) => Ok(resp),
            RpcResponse::Error(e) => Err(RPCError::Network(openraft::error::NetworkError::new(
                &std::io::Error::other(e),
            ))),
            _ => Err(RPCError::Network(openraft::error::NetworkError::new(
                &std::io::Error::new(std::io::ErrorKind::InvalidData, "Unexpected response type"),
            ))),
        }
    }
}

/// Server for incoming consensus RPCs on one replica.
pub struct RpcServer {
    raft: Arc<openraft::Raft<TypeConfig>>,
    state_machine: StoreStateMachine,
    listen_addr: String,
}

impl RpcServer {
    pub fn new(
        raft: Arc<openraft::Raft<TypeConfig>>,
        state_machine: StoreStateMachine,
        listen_addr: String,
    ) -> Self {
        Self {
            raft,
            state_machine,
            listen_addr,
        }
    }

    /// Accept loop. Runs until the task is aborted.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        info!(addr = %self.listen_addr, "Consensus RPC server listening");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let raft = self.raft.clone();
            let state_machine = self.state_machine.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(raft, state_machine, stream).await {
                    debug!(peer = %peer_addr, error = %e, "RPC connection ended");
                }
            });
        }
    }

    /// Serve frames on one connection until the peer hangs up.
    async fn handle_connection(
        raft: Arc<openraft::Raft<TypeConfig>>,
        state_machine: StoreStateMachine,
        mut stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let mut len_buf = [0u8; 4];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let msg_len = u32::from_be_bytes(len_buf) as usize;
            if msg_len > MAX_FRAME_SIZE {
                return Err("request frame too large".into());
            }

            let mut msg_buf = vec![0u8; msg_len];
            stream.read_exact(&mut msg_buf).await?;
            let message: RpcMessage = bincode::deserialize(&msg_buf)?;

            let response = Self::handle_message(&raft, &state_machine, message).await;

            let response_data = bincode::serialize(&response)?;
            let len = response_data.len() as u32;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(&response_data).await?;
        }
    }

    async fn handle_message(
        raft: &Arc<openraft::Raft<TypeConfig>>,
        state_machine: &StoreStateMachine,
        message: RpcMessage,
    ) -> RpcResponse {
        match message {
            RpcMessage::AppendEntries(req) => match raft.append_entries(req).await {
                Ok(resp) => RpcResponse::AppendEntries(resp),
                Err(e) => RpcResponse::Error(e.to_string()),
            },
            RpcMessage::Vote(req) => match raft.vote(req).await {
                Ok(resp) => RpcResponse::Vote(resp),
                Err(e) => RpcResponse::Error(e.to_string()),
            },
            RpcMessage::InstallSnapshot(req) => match raft.install_snapshot(req).await {
                Ok(resp) => RpcResponse::InstallSnapshot(resp),
                Err(e) => RpcResponse::Error(e.to_string()),
            },

            RpcMessage::ClientWrite(command) => match Self::require_leader(raft) {
                Some(not_leader) => not_leader,
                None => match raft.client_write(command).await {
                    Ok(resp) => RpcResponse::ClientWriteOk(resp.data),
                    Err(e) => RpcResponse::Error(e.to_string()),
                },
            },

            RpcMessage::ClientRead(query) => match Self::require_leader(raft) {
                Some(not_leader) => not_leader,
                None => match raft.ensure_linearizable().await {
                    Ok(_) => RpcResponse::ClientReadOk(state_machine.query(query).await),
                    Err(e) => RpcResponse::Error(e.to_string()),
                },
            },

            RpcMessage::AddMember {
                name,
                peer_url,
                client_url,
            } => match Self::require_leader(raft) {
                Some(not_leader) => not_leader,
                None => {
                    Self::handle_add_member(raft, state_machine, name, peer_url, client_url).await
                }
            },

            RpcMessage::PromoteMember { id } => match Self::require_leader(raft) {
                Some(not_leader) => not_leader,
                None => {
                    let mut voters: std::collections::BTreeSet<NodeId> = {
                        let metrics = raft.metrics().borrow().clone();
                        metrics.membership_config.membership().voter_ids().collect()
                    };
                    voters.insert(id);
                    match raft.change_membership(voters, false).await {
                        Ok(_) => {
                            info!(node_id = id, "Promoted member to voter");
                            RpcResponse::Ok
                        }
                        Err(e) => RpcResponse::Error(e.to_string()),
                    }
                }
            },

            RpcMessage::RemoveMember { id } => match Self::require_leader(raft) {
                Some(not_leader) => not_leader,
                None => Self::handle_remove_member(raft, id).await,
            },

            RpcMessage::MemberList => {
                // Member lists are read-mostly and tolerate staleness; serve
                // them from local state on any node.
                match state_machine.query(StoreQuery::MemberList).await {
                    QueryResponse::Members(members) => RpcResponse::Members(members),
                    _ => RpcResponse::Error("unexpected query response".to_string()),
                }
            }
        }
    }

    /// Returns a `NotLeader` response when this node is not the leader.
    fn require_leader(raft: &Arc<openraft::Raft<TypeConfig>>) -> Option<RpcResponse> {
        let metrics = raft.metrics().borrow().clone();
        if metrics.current_leader == Some(metrics.id) {
            return None;
        }
        let leader_addr = metrics.current_leader.and_then(|id| {
            metrics
                .membership_config
                .membership()
                .get_node(&id)
                .map(|n| n.addr.clone())
        });
        Some(RpcResponse::NotLeader { leader_addr })
    }

    async fn handle_add_member(
        raft: &Arc<openraft::Raft<TypeConfig>>,
        state_machine: &StoreStateMachine,
        name: String,
        peer_url: String,
        client_url: String,
    ) -> RpcResponse {
        info!(member = %name, peer_url = %peer_url, "Received add member request");

        let registered = match raft
            .client_write(StoreCommand::RegisterMember {
                name: name.clone(),
                peer_url: peer_url.clone(),
                client_url,
            })
            .await
        {
            Ok(resp) => resp.data,
            Err(e) => return RpcResponse::Error(e.to_string()),
        };
        let StoreResponse::MemberId(id) = registered else {
            return RpcResponse::Error("unexpected register response".to_string());
        };

        // Start replicating to the new member. Non-blocking: its server has
        // not started yet; it will catch up and then request promotion.
        let node = BasicNode {
            addr: peer_url.clone(),
        };
        if let Err(e) = raft.add_learner(id, node, false).await {
            let err_str = e.to_string();
            if err_str.contains("already") {
                info!(node_id = id, "Node already in cluster");
            } else {
                warn!(node_id = id, error = %e, "Failed to add learner");
                return RpcResponse::Error(format!("Failed to add learner: {}", e));
            }
        }

        let members = match state_machine.query(StoreQuery::MemberList).await {
            QueryResponse::Members(members) => members,
            _ => Vec::new(),
        };
        RpcResponse::MemberAdded { id, members }
    }

    async fn handle_remove_member(
        raft: &Arc<openraft::Raft<TypeConfig>>,
        id: NodeId,
    ) -> RpcResponse {
        let voters: std::collections::BTreeSet<NodeId> = {
            let metrics = raft.metrics().borrow().clone();
            metrics.membership_config.membership().voter_ids().collect()
        };

        if voters.contains(&id) {
            let remaining: std::collections::BTreeSet<NodeId> =
                voters.into_iter().filter(|v| *v != id).collect();
            if let Err(e) = raft.change_membership(remaining, false).await {
                return RpcResponse::Error(e.to_string());
            }
        }

        match raft.client_write(StoreCommand::RemoveMember { id }).await {
            Ok(_) => {
                info!(node_id = id, "Removed member");
                RpcResponse::Ok
            }
            Err(e) => RpcResponse::Error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_message_roundtrip() {
        let msg = RpcMessage::ClientWrite(StoreCommand::Put {
            key: "/config/version".to_string(),
            value: "1".to_string(),
            lease: None,
        });
        let data = bincode::serialize(&msg).unwrap();
        let decoded: RpcMessage = bincode::deserialize(&data).unwrap();
        assert!(matches!(decoded, RpcMessage::ClientWrite(_)));
    }

    #[test]
    fn test_rpc_response_not_leader_roundtrip() {
        let resp = RpcResponse::NotLeader {
            leader_addr: Some("10.0.0.1:2380".to_string()),
        };
        let data = bincode::serialize(&resp).unwrap();
        let decoded: RpcResponse = bincode::deserialize(&data).unwrap();
        match decoded {
            RpcResponse::NotLeader { leader_addr } => {
                assert_eq!(leader_addr.as_deref(), Some("10.0.0.1:2380"));
            }
            _ => panic!("expected NotLeader"),
        }
    }

    #[test]
    fn test_factory_address_book() {
        let factory = MeshNetworkFactory::new();
        factory.add_node(1, "10.0.0.1:2380".to_string());
        assert_eq!(factory.node_addr(1).as_deref(), Some("10.0.0.1:2380"));
        assert_eq!(factory.node_addr(2), None);
    }
}
