//! Replicated state machine for the consensus store.
//!
//! The state machine holds the key/value space, the lease table, and the
//! member records, and applies commands to produce deterministic state
//! transitions. Lease expiry is *not* decided here: the leader-side sweeper
//! compares deadlines against its clock and proposes explicit `LeaseRevoke`
//! commands, so replicas never diverge on time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::commands::{QueryResponse, StoreCommand, StoreQuery, StoreResponse};
use crate::cluster::members::Member;

/// A stored value, possibly attached to a lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValueRecord {
    pub value: String,
    pub lease: Option<u64>,
}

/// A granted lease and the keys attached to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRecord {
    pub ttl_secs: u64,
    /// Expiry deadline in unix milliseconds, refreshed by keepalives.
    pub deadline_ms: i64,
    pub keys: BTreeSet<String>,
}

/// The complete replicated store state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreState {
    /// State version (incremented on each applied command).
    pub version: u64,

    /// The key space.
    #[serde(default)]
    pub kv: BTreeMap<String, ValueRecord>,

    /// Granted leases by id.
    #[serde(default)]
    pub leases: BTreeMap<u64, LeaseRecord>,

    /// Registered members by node id.
    #[serde(default)]
    pub members: BTreeMap<u64, Member>,

    /// Next lease id to grant.
    #[serde(default)]
    pub next_lease_id: u64,

    /// Next node id to assign.
    #[serde(default)]
    pub next_node_id: u64,
}

impl StoreState {
    fn apply(&mut self, command: StoreCommand) -> StoreResponse {
        self.version += 1;

        match command {
            StoreCommand::Noop => StoreResponse::Ok,

            StoreCommand::Put { key, value, lease } => {
                if let Some(lease_id) = lease {
                    let Some(record) = self.leases.get_mut(&lease_id) else {
                        return StoreResponse::NotFound;
                    };
                    record.keys.insert(key.clone());
                }
                // Re-putting a key under a different lease detaches it from
                // the old one.
                if let Some(old) = self.kv.get(&key)
                    && old.lease != lease
                    && let Some(old_lease) = old.lease
                    && let Some(old_record) = self.leases.get_mut(&old_lease)
                {
                    old_record.keys.remove(&key);
                }
                self.kv.insert(key, ValueRecord { value, lease });
                StoreResponse::Ok
            }

            StoreCommand::Delete { key } => {
                if let Some(record) = self.kv.remove(&key)
                    && let Some(lease_id) = record.lease
                    && let Some(lease) = self.leases.get_mut(&lease_id)
                {
                    lease.keys.remove(&key);
                }
                StoreResponse::Ok
            }

            StoreCommand::LeaseGrant { ttl_secs, now_ms } => {
                self.next_lease_id += 1;
                let id = self.next_lease_id;
                self.leases.insert(
                    id,
                    LeaseRecord {
                        ttl_secs,
                        deadline_ms: now_ms.saturating_add((ttl_secs as i64).saturating_mul(1000)),
                        keys: BTreeSet::new(),
                    },
                );
                StoreResponse::LeaseId(id)
            }

            StoreCommand::LeaseRevoke { id } => {
                let Some(record) = self.leases.remove(&id) else {
                    return StoreResponse::NotFound;
                };
                for key in record.keys {
                    self.kv.remove(&key);
                }
                StoreResponse::Ok
            }

            StoreCommand::LeaseKeepAlive { id, now_ms } => {
                let Some(record) = self.leases.get_mut(&id) else {
                    return StoreResponse::NotFound;
                };
                record.deadline_ms =
                    now_ms.saturating_add((record.ttl_secs as i64).saturating_mul(1000));
                StoreResponse::Ok
            }

            StoreCommand::RegisterMember {
                name,
                peer_url,
                client_url,
            } => {
                // A member re-registering under the same name replaces its
                // previous record; the id is assigned fresh on every join.
                self.members.retain(|_, m| m.name != name);
                self.next_node_id += 1;
                let id = self.next_node_id;
                self.members.insert(
                    id,
                    Member {
                        id: Some(id),
                        name,
                        peer_url,
                        client_url,
                    },
                );
                StoreResponse::MemberId(id)
            }

            StoreCommand::RemoveMember { id } => {
                if self.members.remove(&id).is_none() {
                    return StoreResponse::NotFound;
                }
                StoreResponse::Ok
            }
        }
    }

    fn query(&self, query: StoreQuery) -> QueryResponse {
        match query {
            StoreQuery::Get { key } => {
                QueryResponse::Value(self.kv.get(&key).map(|r| r.value.clone()))
            }
            StoreQuery::GetPrefix { prefix } => {
                let values = self
                    .kv
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, r)| (k.clone(), r.value.clone()))
                    .collect();
                QueryResponse::Values(values)
            }
            StoreQuery::MemberList => {
                let mut members: Vec<Member> = self.members.values().cloned().collect();
                members.sort_by(|a, b| a.name.cmp(&b.name));
                QueryResponse::Members(members)
            }
        }
    }
}

/// The state machine wrapper shared between the log storage and readers.
#[derive(Debug, Clone)]
pub struct StoreStateMachine {
    state: Arc<RwLock<StoreState>>,
}

impl StoreStateMachine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    /// Apply a replicated command.
    pub async fn apply_command(&self, command: StoreCommand) -> StoreResponse {
        self.state.write().await.apply(command)
    }

    /// Answer a read-only query from local state.
    pub async fn query(&self, query: StoreQuery) -> QueryResponse {
        self.state.read().await.query(query)
    }

    /// Current state version.
    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    /// Leases whose deadline has passed, for the leader-side sweeper.
    pub async fn expired_leases(&self, now_ms: i64) -> Vec<u64> {
        self.state
            .read()
            .await
            .leases
            .iter()
            .filter(|(_, record)| record.deadline_ms < now_ms)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Create a snapshot of the current state for persistence.
    pub async fn snapshot(&self) -> Vec<u8> {
        let state = self.state.read().await;
        bincode::serialize(&*state).expect("Failed to serialize state")
    }

    /// Restore state from a snapshot.
    ///
    /// Snapshot bytes arrive from disk or from a peer's InstallSnapshot
    /// RPC; a malformed document is reported to the caller, never a
    /// process abort.
    pub async fn restore(&self, snapshot: &[u8]) -> Result<(), bincode::Error> {
        let restored: StoreState = bincode::deserialize(snapshot)?;
        *self.state.write().await = restored;
        Ok(())
    }
}

impl Default for StoreStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
