//! Replicated commands and responses for the consensus store.
//!
//! Commands are the inputs to the state machine; they are replicated through
//! the log and applied deterministically on every replica. Anything
//! nondeterministic (wall-clock time) travels inside the command, never
//! inside `apply`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cluster::members::Member;

/// Commands applied to the replicated key/value + lease store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreCommand {
    /// No-op command (used for linearizable reads).
    Noop,

    /// Set a key, optionally attaching it to a lease.
    Put {
        key: String,
        value: String,
        lease: Option<u64>,
    },

    /// Remove a key.
    Delete { key: String },

    /// Grant a new lease with the given TTL.
    LeaseGrant { ttl_secs: u64, now_ms: i64 },

    /// Revoke a lease, deleting every key attached to it.
    LeaseRevoke { id: u64 },

    /// Refresh a lease's expiry deadline.
    LeaseKeepAlive { id: u64, now_ms: i64 },

    /// Record a member joining the cluster, assigning it a node id.
    RegisterMember {
        name: String,
        peer_url: String,
        client_url: String,
    },

    /// Remove a member record by node id.
    RemoveMember { id: u64 },
}

/// Responses from applying commands to the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreResponse {
    /// Generic success.
    Ok,

    /// A granted lease id.
    LeaseId(u64),

    /// The node id assigned to a registered member.
    MemberId(u64),

    /// The targeted lease or member does not exist.
    NotFound,
}

/// Read-only queries served outside the log.
///
/// Reads do not mutate state and are answered from the local state machine
/// (after a linearizability barrier on the serving node).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreQuery {
    /// Fetch a single key.
    Get { key: String },

    /// Fetch all keys under a prefix.
    GetPrefix { prefix: String },

    /// List registered members.
    MemberList,
}

/// Answers to [`StoreQuery`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueryResponse {
    Value(Option<String>),
    Values(BTreeMap<String, String>),
    Members(Vec<Member>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_command_roundtrip() {
        let cmd = StoreCommand::Put {
            key: "/config/objects/http-server".to_string(),
            value: "kind: HTTPServer".to_string(),
            lease: None,
        };
        let serialized = bincode::serialize(&cmd).unwrap();
        let deserialized: StoreCommand = bincode::deserialize(&serialized).unwrap();
        assert_eq!(cmd, deserialized);
    }

    #[test]
    fn test_lease_grant_command_roundtrip() {
        let cmd = StoreCommand::LeaseGrant {
            ttl_secs: 10,
            now_ms: 1_700_000_000_000,
        };
        let serialized = bincode::serialize(&cmd).unwrap();
        let deserialized: StoreCommand = bincode::deserialize(&serialized).unwrap();
        assert_eq!(cmd, deserialized);
    }

    #[test]
    fn test_register_member_command_roundtrip() {
        let cmd = StoreCommand::RegisterMember {
            name: "member-002".to_string(),
            peer_url: "10.0.0.2:2380".to_string(),
            client_url: "10.0.0.2:2379".to_string(),
        };
        let serialized = serde_json::to_string(&cmd).unwrap();
        let deserialized: StoreCommand = serde_json::from_str(&serialized).unwrap();
        assert_eq!(cmd, deserialized);
    }

    #[test]
    fn test_query_roundtrip() {
        let query = StoreQuery::GetPrefix {
            prefix: "/status/objects/".to_string(),
        };
        let serialized = bincode::serialize(&query).unwrap();
        let deserialized: StoreQuery = bincode::deserialize(&serialized).unwrap();
        assert_eq!(query, deserialized);
    }
}
