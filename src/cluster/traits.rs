//! The cluster surface consumed by higher layers.
//!
//! The admin surface and the MQTT session store talk to the cluster through
//! this trait, so tests can swap in [`crate::cluster::mock::MockCluster`]
//! without a quorum.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::error::ClusterResult;
use super::layout::Layout;

/// Namespaced key/value operations with leases, backed by the quorum.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// The key naming convention of this member.
    fn layout(&self) -> &Layout;

    /// Fetch a single key.
    async fn get(&self, key: &str) -> ClusterResult<Option<String>>;

    /// Fetch all keys under a prefix.
    async fn get_prefix(&self, prefix: &str) -> ClusterResult<BTreeMap<String, String>>;

    /// Set a key.
    async fn put(&self, key: &str, value: &str) -> ClusterResult<()>;

    /// Set a key under this member's liveness lease.
    async fn put_under_lease(&self, key: &str, value: &str) -> ClusterResult<()>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> ClusterResult<()>;

    /// Evict a dead member: drop it from the quorum and revoke its lease,
    /// expiring all of its status rows.
    async fn purge_member(&self, member_name: &str) -> ClusterResult<()>;
}
