//! In-memory cluster for tests and single-process development.
//!
//! `MockCluster` drives the same replicated state machine as a real quorum,
//! minus the networking: commands apply directly. It holds a lease for
//! itself at construction so `put_under_lease` behaves like the real thing,
//! and peers can be simulated by granting additional leases.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::error::{ClusterError, ClusterResult};
use super::layout::Layout;
use super::lease::{format_lease, parse_lease};
use super::raft::{QueryResponse, StoreCommand, StoreQuery, StoreResponse, StoreStateMachine};
use super::traits::ClusterApi;
use crate::constants::MAX_LEASE_TTL_SECS;

/// An in-memory, single-member cluster.
pub struct MockCluster {
    layout: Layout,
    sm: StoreStateMachine,
    lease: u64,
}

impl MockCluster {
    /// Build a mock for `member_name`, granting and publishing its lease.
    pub async fn new(member_name: &str) -> Self {
        let layout = Layout::new(member_name);
        let sm = StoreStateMachine::new();

        let response = sm
            .apply_command(StoreCommand::LeaseGrant {
                ttl_secs: MAX_LEASE_TTL_SECS,
                now_ms: 0,
            })
            .await;
        let StoreResponse::LeaseId(lease) = response else {
            unreachable!("grant on empty state machine");
        };
        sm.apply_command(StoreCommand::Put {
            key: layout.lease(),
            value: format_lease(lease),
            lease: Some(lease),
        })
        .await;

        Self { layout, sm, lease }
    }

    /// Simulate another member: grant a lease and publish it under the
    /// member's lease key. Returns the lease id.
    pub async fn add_peer(&self, member_name: &str) -> u64 {
        let response = self
            .sm
            .apply_command(StoreCommand::LeaseGrant {
                ttl_secs: MAX_LEASE_TTL_SECS,
                now_ms: 0,
            })
            .await;
        let StoreResponse::LeaseId(lease) = response else {
            unreachable!("grant cannot fail");
        };
        self.sm
            .apply_command(StoreCommand::Put {
                key: self.layout.other_lease(member_name),
                value: format_lease(lease),
                lease: Some(lease),
            })
            .await;
        lease
    }

    /// Write a key under an arbitrary lease, for simulating peer status rows.
    pub async fn put_under_peer_lease(
        &self,
        key: &str,
        value: &str,
        lease: u64,
    ) -> ClusterResult<()> {
        let response = self
            .sm
            .apply_command(StoreCommand::Put {
                key: key.to_string(),
                value: value.to_string(),
                lease: Some(lease),
            })
            .await;
        if response == StoreResponse::NotFound {
            return Err(ClusterError::KeyNotFound(format!("lease {:x}", lease)));
        }
        Ok(())
    }

    /// This member's lease id.
    pub fn lease(&self) -> u64 {
        self.lease
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<String>> {
        match self
            .sm
            .query(StoreQuery::Get {
                key: key.to_string(),
            })
            .await
        {
            QueryResponse::Value(value) => Ok(value),
            _ => unreachable!("get returns Value"),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> ClusterResult<BTreeMap<String, String>> {
        match self
            .sm
            .query(StoreQuery::GetPrefix {
                prefix: prefix.to_string(),
            })
            .await
        {
            QueryResponse::Values(values) => Ok(values),
            _ => unreachable!("get_prefix returns Values"),
        }
    }

    async fn put(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.sm
            .apply_command(StoreCommand::Put {
                key: key.to_string(),
                value: value.to_string(),
                lease: None,
            })
            .await;
        Ok(())
    }

    async fn put_under_lease(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.put_under_peer_lease(key, value, self.lease).await
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        self.sm
            .apply_command(StoreCommand::Delete {
                key: key.to_string(),
            })
            .await;
        Ok(())
    }

    async fn purge_member(&self, member_name: &str) -> ClusterResult<()> {
        let lease_key = self.layout.other_lease(member_name);
        let lease_str = self
            .get(&lease_key)
            .await?
            .ok_or(ClusterError::KeyNotFound(lease_key))?;
        let lease = parse_lease(&lease_str)?;

        let response = self.sm.apply_command(StoreCommand::LeaseRevoke { id: lease }).await;
        if response == StoreResponse::NotFound {
            return Err(ClusterError::KeyNotFound(format!("lease {:x}", lease)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_put_get_delete() {
        let cluster = MockCluster::new("member-001").await;

        cluster.put("/config/objects/a", "spec-a").await.unwrap();
        assert_eq!(
            cluster.get("/config/objects/a").await.unwrap(),
            Some("spec-a".to_string())
        );

        cluster.delete("/config/objects/a").await.unwrap();
        assert_eq!(cluster.get("/config/objects/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mock_publishes_own_lease() {
        let cluster = MockCluster::new("member-001").await;
        let lease_str = cluster
            .get(&cluster.layout().lease())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parse_lease(&lease_str).unwrap(), cluster.lease());
    }

    #[tokio::test]
    async fn test_mock_purge_unknown_member_errors_with_key() {
        let cluster = MockCluster::new("member-001").await;
        let err = cluster.purge_member("member-404").await.unwrap_err();
        assert!(err.to_string().contains("/leases/member-404"));
    }

    #[tokio::test]
    async fn test_mock_purge_removes_peer_status_rows() {
        let cluster = MockCluster::new("member-001").await;
        let peer_lease = cluster.add_peer("member-002").await;
        cluster
            .put_under_peer_lease("/status/objects/cluster/member-002", "alive", peer_lease)
            .await
            .unwrap();

        cluster.purge_member("member-002").await.unwrap();

        let rows = cluster
            .get_prefix(&cluster.layout().status_objects_prefix())
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(
            cluster
                .get(&cluster.layout().other_lease("member-002"))
                .await
                .unwrap(),
            None
        );
    }
}
