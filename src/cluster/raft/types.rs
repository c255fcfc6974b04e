//! Type definitions for the consensus layer.

use openraft::BasicNode;
use std::io::Cursor;

use super::commands::{StoreCommand, StoreResponse};

/// Node ID type for consensus replicas.
pub type NodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = StoreCommand,
        R = StoreResponse,
        NodeId = NodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);
