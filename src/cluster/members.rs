//! Member registry: tracks known peers.
//!
//! The registry merges three sources of peers: the member itself, the
//! configured initial peers, and the members learned from consensus. A
//! refresh replaces the cluster-known set wholesale but never forgets self.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::config::{ClusterOptions, parse_peer_entry};
use super::error::{ClusterError, ClusterResult};

/// A known cluster member.
///
/// The `id` is transient: it is assigned by consensus when the member joins
/// and is absent for configured peers that have not been observed yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: Option<u64>,
    pub name: String,
    pub peer_url: String,
    pub client_url: String,
}

/// Registry of known peers for one member.
#[derive(Debug)]
pub struct MemberRegistry {
    self_member: RwLock<Member>,
    configured: Vec<Member>,
    cluster_known: RwLock<Vec<Member>>,
}

impl MemberRegistry {
    /// Build the registry from options, parsing the initial peer list.
    pub fn new(options: &ClusterOptions) -> ClusterResult<Self> {
        let mut configured = Vec::new();
        for entry in &options.initial_peers {
            let (name, url) = parse_peer_entry(entry).ok_or_else(|| {
                ClusterError::Config(format!("invalid initial peer '{}'", entry))
            })?;
            if name == options.name {
                continue;
            }
            configured.push(Member {
                id: None,
                name: name.to_string(),
                peer_url: url.to_string(),
                client_url: String::new(),
            });
        }

        Ok(Self {
            self_member: RwLock::new(Member {
                id: None,
                name: options.name.clone(),
                peer_url: options.peer_url.clone(),
                client_url: options.client_url.clone(),
            }),
            configured,
            cluster_known: RwLock::new(Vec::new()),
        })
    }

    /// This member.
    pub fn self_member(&self) -> Member {
        self.self_member.read().unwrap().clone()
    }

    /// Record the consensus-assigned id for this member.
    pub fn set_self_id(&self, id: u64) {
        self.self_member.write().unwrap().id = Some(id);
    }

    /// Peer URLs of all known members, in stable (name-sorted) order.
    pub fn known_peer_urls(&self) -> Vec<String> {
        self.merged()
            .into_values()
            .filter(|m| !m.peer_url.is_empty())
            .map(|m| m.peer_url)
            .collect()
    }

    /// Number of distinct known members, self included.
    pub fn known_members_len(&self) -> usize {
        self.merged().len()
    }

    /// Replace the cluster-known set with a fresh member list.
    ///
    /// Also adopts the consensus-assigned id for self when present.
    pub fn update_cluster_members(&self, members: Vec<Member>) {
        let self_name = self.self_member.read().unwrap().name.clone();
        if let Some(me) = members.iter().find(|m| m.name == self_name)
            && let Some(id) = me.id
        {
            self.set_self_id(id);
        }
        *self.cluster_known.write().unwrap() = members;
    }

    /// Merge self, configured, and cluster-known members, keyed by name.
    ///
    /// Cluster-known entries win over configured ones (they carry ids);
    /// self always wins over both.
    fn merged(&self) -> BTreeMap<String, Member> {
        let mut merged = BTreeMap::new();
        for member in &self.configured {
            merged.insert(member.name.clone(), member.clone());
        }
        for member in self.cluster_known.read().unwrap().iter() {
            merged.insert(member.name.clone(), member.clone());
        }
        let me = self.self_member.read().unwrap().clone();
        merged.insert(me.name.clone(), me);
        merged
    }
}
