//! Consensus client: reads, writes, watches over the quorum.
//!
//! The client connects to the union of known peer URLs. On a writer it also
//! holds the local replica handle and uses it as a fast path; readers always
//! go over the wire. Every call is bounded by the configured request timeout
//! and cancellation releases both the caller and the in-flight RPC.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{ClusterError, ClusterResult};
use super::members::{Member, MemberRegistry};
use super::raft::{
    NodeId, QueryResponse, ReplicaNode, RpcMessage, RpcResponse, StoreCommand, StoreQuery,
    StoreResponse, send_rpc,
};

/// Client handle over the quorum.
#[derive(Debug)]
pub struct ConsensusClient {
    registry: Arc<MemberRegistry>,
    request_timeout: Duration,
    /// Local replica fast path; writers only.
    local: Option<Arc<ReplicaNode>>,
    /// Keepalive loops owned by this client, aborted on close.
    keepalive_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ConsensusClient {
    pub fn new(
        registry: Arc<MemberRegistry>,
        request_timeout: Duration,
        local: Option<Arc<ReplicaNode>>,
    ) -> Self {
        Self {
            registry,
            request_timeout,
            local,
            keepalive_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Fetch a single key.
    pub async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        let response = self
            .query(StoreQuery::Get {
                key: key.to_string(),
            })
            .await?;
        match response {
            QueryResponse::Value(value) => Ok(value),
            _ => Err(ClusterError::Raft("unexpected query response".to_string())),
        }
    }

    /// Fetch all keys under a prefix.
    pub async fn get_prefix(&self, prefix: &str) -> ClusterResult<BTreeMap<String, String>> {
        let response = self
            .query(StoreQuery::GetPrefix {
                prefix: prefix.to_string(),
            })
            .await?;
        match response {
            QueryResponse::Values(values) => Ok(values),
            _ => Err(ClusterError::Raft("unexpected query response".to_string())),
        }
    }

    /// Set a key.
    pub async fn put(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.write(StoreCommand::Put {
            key: key.to_string(),
            value: value.to_string(),
            lease: None,
        })
        .await?;
        Ok(())
    }

    /// Set a key attached to a lease; the key vanishes when the lease goes.
    pub async fn put_under_lease(&self, key: &str, value: &str, lease: u64) -> ClusterResult<()> {
        let response = self
            .write(StoreCommand::Put {
                key: key.to_string(),
                value: value.to_string(),
                lease: Some(lease),
            })
            .await?;
        if response == StoreResponse::NotFound {
            return Err(ClusterError::KeyNotFound(format!("lease {:x}", lease)));
        }
        Ok(())
    }

    /// Remove a key.
    pub async fn delete(&self, key: &str) -> ClusterResult<()> {
        self.write(StoreCommand::Delete {
            key: key.to_string(),
        })
        .await?;
        Ok(())
    }

    /// List registered members.
    ///
    /// Member lists are read-mostly and tolerate staleness: writers answer
    /// from their local state machine, and any quorum node serves the RPC
    /// without a leader barrier.
    pub async fn member_list(&self) -> ClusterResult<Vec<Member>> {
        self.with_timeout("member list", async {
            if let Some(local) = &self.local {
                return match local.state_machine().query(StoreQuery::MemberList).await {
                    QueryResponse::Members(members) => Ok(members),
                    _ => Err(ClusterError::Raft("unexpected query response".to_string())),
                };
            }
            match self.call_quorum(&RpcMessage::MemberList).await? {
                RpcResponse::Members(members) => Ok(members),
                RpcResponse::Error(e) => Err(ClusterError::Raft(e)),
                _ => Err(ClusterError::Raft("unexpected response".to_string())),
            }
        })
        .await
    }

    /// Register a member with the quorum and start replicating to it.
    ///
    /// Returns the assigned node id and the updated member list.
    pub async fn member_add(
        &self,
        name: &str,
        peer_url: &str,
        client_url: &str,
    ) -> ClusterResult<(NodeId, Vec<Member>)> {
        let message = RpcMessage::AddMember {
            name: name.to_string(),
            peer_url: peer_url.to_string(),
            client_url: client_url.to_string(),
        };
        self.with_timeout("member add", async {
            match self.call_quorum(&message).await? {
                RpcResponse::MemberAdded { id, members } => Ok((id, members)),
                RpcResponse::Error(e) => Err(ClusterError::Raft(e)),
                _ => Err(ClusterError::Raft("unexpected response".to_string())),
            }
        })
        .await
    }

    /// Remove a member from the quorum by node id.
    pub async fn member_remove(&self, id: NodeId) -> ClusterResult<()> {
        self.with_timeout("member remove", async {
            match self.call_quorum(&RpcMessage::RemoveMember { id }).await? {
                RpcResponse::Ok => Ok(()),
                RpcResponse::Error(e) => Err(ClusterError::Raft(e)),
                _ => Err(ClusterError::Raft("unexpected response".to_string())),
            }
        })
        .await
    }

    /// Grant a lease.
    pub async fn lease_grant(&self, ttl_secs: u64) -> ClusterResult<u64> {
        let response = self
            .write(StoreCommand::LeaseGrant {
                ttl_secs,
                now_ms: chrono::Utc::now().timestamp_millis(),
            })
            .await?;
        match response {
            StoreResponse::LeaseId(id) => Ok(id),
            _ => Err(ClusterError::Raft("unexpected grant response".to_string())),
        }
    }

    /// Revoke a lease, deleting every key attached to it.
    pub async fn lease_revoke(&self, id: u64) -> ClusterResult<()> {
        let response = self.write(StoreCommand::LeaseRevoke { id }).await?;
        if response == StoreResponse::NotFound {
            return Err(ClusterError::KeyNotFound(format!("lease {:x}", id)));
        }
        Ok(())
    }

    /// Refresh a lease's expiry deadline once.
    pub async fn lease_keep_alive(&self, id: u64) -> ClusterResult<()> {
        let response = self
            .write(StoreCommand::LeaseKeepAlive {
                id,
                now_ms: chrono::Utc::now().timestamp_millis(),
            })
            .await?;
        if response == StoreResponse::NotFound {
            return Err(ClusterError::KeyNotFound(format!("lease {:x}", id)));
        }
        Ok(())
    }

    /// Spawn a keepalive loop for a lease, pinging at a third of its TTL,
    /// clamped to [1s, 60s] so effectively-forever leases still carry a
    /// liveness signal at the dial keepalive cadence.
    ///
    /// The loop runs until the client is closed. Individual failures are
    /// logged; the next ping retries.
    pub async fn spawn_keepalive(self: &Arc<Self>, id: u64, ttl_secs: u64) {
        let client = self.clone();
        let interval = Duration::from_secs(
            (ttl_secs / 3)
                .max(1)
                .min(crate::constants::DIAL_KEEPALIVE_TIME.as_secs()),
        );
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = client.lease_keep_alive(id).await {
                    warn!(lease = %format!("{:x}", id), error = %e, "Lease keepalive failed");
                }
            }
        });
        self.keepalive_tasks.lock().await.push(task);
        debug!(lease = %format!("{:x}", id), ?interval, "Keepalive loop started");
    }

    /// Stop keepalive loops. Idempotent.
    pub async fn close(&self) {
        for task in self.keepalive_tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("Consensus client closed");
    }

    async fn write(&self, command: StoreCommand) -> ClusterResult<StoreResponse> {
        self.with_timeout("consensus write", async {
            if let Some(local) = &self.local {
                return local.write(command.clone()).await;
            }
            match self.call_quorum(&RpcMessage::ClientWrite(command.clone())).await? {
                RpcResponse::ClientWriteOk(response) => Ok(response),
                RpcResponse::Error(e) => Err(ClusterError::Raft(e)),
                _ => Err(ClusterError::Raft("unexpected response".to_string())),
            }
        })
        .await
    }

    async fn query(&self, query: StoreQuery) -> ClusterResult<QueryResponse> {
        self.with_timeout("consensus read", async {
            if let Some(local) = &self.local {
                return local.read(query.clone()).await;
            }
            match self.call_quorum(&RpcMessage::ClientRead(query.clone())).await? {
                RpcResponse::ClientReadOk(response) => Ok(response),
                RpcResponse::Error(e) => Err(ClusterError::Raft(e)),
                _ => Err(ClusterError::Raft("unexpected response".to_string())),
            }
        })
        .await
    }

    /// Try each known endpoint until one answers, following leader hints.
    async fn call_quorum(&self, message: &RpcMessage) -> ClusterResult<RpcResponse> {
        let endpoints = self.registry.known_peer_urls();
        if endpoints.is_empty() {
            return Err(ClusterError::Unavailable("no known endpoints".to_string()));
        }

        let mut last_error: Option<ClusterError> = None;
        for endpoint in &endpoints {
            let mut addr = endpoint.clone();
            // Follow at most two leader hints from this endpoint.
            for _ in 0..3 {
                match send_rpc(&addr, message).await {
                    Ok(RpcResponse::NotLeader {
                        leader_addr: Some(hint),
                    }) => {
                        addr = hint;
                    }
                    Ok(RpcResponse::NotLeader { leader_addr: None }) => {
                        last_error =
                            Some(ClusterError::Unavailable("no leader elected".to_string()));
                        break;
                    }
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        debug!(endpoint = %addr, error = %e, "Endpoint unreachable");
                        last_error = Some(ClusterError::Unavailable(e.to_string()));
                        break;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ClusterError::Unavailable("all endpoints failed".to_string())))
    }

    async fn with_timeout<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = ClusterResult<T>>,
    ) -> ClusterResult<T> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| ClusterError::Timeout(what))?
    }
}
