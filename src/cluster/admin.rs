//! Admin operations over the cluster store.
//!
//! These are the primitives the REST admin surface builds on: configuration
//! objects, the configuration version counter, and aggregated status rows.
//! Store failures and impossible key shapes on this path surface as the
//! panic-class error kind ([`ClusterError::Panic`]); the caller translates
//! that into a structured 500 response.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::{ClusterError, ClusterResult};
use super::traits::ClusterApi;

/// A named configuration object.
///
/// The cluster layer treats the spec body as opaque; it only keys objects
/// by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectSpec {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Admin facade over a cluster handle.
pub struct AdminApi<C: ClusterApi> {
    cluster: C,
}

impl<C: ClusterApi> AdminApi<C> {
    pub fn new(cluster: C) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Current configuration version; zero when never bumped.
    pub async fn get_version(&self) -> ClusterResult<i64> {
        let key = self.cluster.layout().config_version();
        let value = self.cluster.get(&key).await.map_err(panic_class)?;

        let Some(value) = value else {
            return Ok(0);
        };
        value.parse::<i64>().map_err(|e| {
            ClusterError::Panic(format!("parse version {} to int failed: {}", value, e))
        })
    }

    /// Bump the configuration version and return the new value.
    ///
    /// Single-writer by contract: concurrent bumps from multiple members
    /// are serialized by the admin mutex one layer up.
    pub async fn plus_one_version(&self) -> ClusterResult<i64> {
        let version = self.get_version().await? + 1;
        let key = self.cluster.layout().config_version();
        self.cluster
            .put(&key, &version.to_string())
            .await
            .map_err(panic_class)?;
        Ok(version)
    }

    /// Fetch one configuration object; `None` when absent.
    pub async fn get_object(&self, name: &str) -> ClusterResult<Option<ObjectSpec>> {
        let key = self.cluster.layout().config_object_key(name);
        let value = self.cluster.get(&key).await.map_err(panic_class)?;

        let Some(value) = value else {
            return Ok(None);
        };
        let spec: ObjectSpec = serde_json::from_str(&value)
            .map_err(|e| ClusterError::Panic(format!("bad spec (err: {}) from: {}", e, value)))?;
        Ok(Some(spec))
    }

    /// Fetch every configuration object.
    pub async fn list_objects(&self) -> ClusterResult<Vec<ObjectSpec>> {
        let prefix = self.cluster.layout().config_object_prefix();
        let kvs = self.cluster.get_prefix(&prefix).await.map_err(panic_class)?;

        let mut specs = Vec::with_capacity(kvs.len());
        for (_, value) in kvs {
            let spec: ObjectSpec = serde_json::from_str(&value).map_err(|e| {
                ClusterError::Panic(format!("bad spec (err: {}) from: {}", e, value))
            })?;
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Store a configuration object under its name.
    pub async fn put_object(&self, spec: &ObjectSpec) -> ClusterResult<()> {
        let key = self.cluster.layout().config_object_key(&spec.name);
        let value = serde_json::to_string_pretty(spec)?;
        self.cluster.put(&key, &value).await.map_err(panic_class)
    }

    /// Delete a configuration object.
    pub async fn delete_object(&self, name: &str) -> ClusterResult<()> {
        let key = self.cluster.layout().config_object_key(name);
        self.cluster.delete(&key).await.map_err(panic_class)
    }

    /// Status rows of one kind, keyed by member name.
    pub async fn get_status_object(
        &self,
        kind: &str,
    ) -> ClusterResult<BTreeMap<String, String>> {
        let prefix = self.cluster.layout().status_object_prefix(kind);
        let kvs = self.cluster.get_prefix(&prefix).await.map_err(panic_class)?;

        let mut status = BTreeMap::new();
        for (key, value) in kvs {
            let member = key.trim_start_matches(&prefix).to_string();
            status.insert(member, value);
        }
        Ok(status)
    }

    /// All status rows, grouped kind -> member -> document.
    ///
    /// A status key that does not split into exactly `<kind>/<member>` is a
    /// store inconsistency.
    pub async fn list_status_objects(
        &self,
    ) -> ClusterResult<BTreeMap<String, BTreeMap<String, serde_json::Value>>> {
        let prefix = self.cluster.layout().status_objects_prefix();
        let kvs = self.cluster.get_prefix(&prefix).await.map_err(panic_class)?;

        let mut status: BTreeMap<String, BTreeMap<String, serde_json::Value>> = BTreeMap::new();
        for (key, value) in kvs {
            let suffix = key.trim_start_matches(&prefix);
            let parts: Vec<&str> = suffix.split('/').collect();
            if parts.len() != 2 {
                return Err(ClusterError::Panic(format!(
                    "the key {} can't be split into two fields by /",
                    suffix
                )));
            }
            let (kind, member) = (parts[0], parts[1]);

            let document: serde_json::Value = serde_json::from_str(&value).map_err(|e| {
                ClusterError::Panic(format!("unmarshal {} failed: {}", value, e))
            })?;
            status
                .entry(kind.to_string())
                .or_default()
                .insert(member.to_string(), document);
        }
        Ok(status)
    }

    /// Evict a dead member.
    pub async fn purge_member(&self, member_name: &str) -> ClusterResult<()> {
        self.cluster.purge_member(member_name).await.map_err(|e| {
            ClusterError::Panic(format!("purge member {} failed: {}", member_name, e))
        })
    }
}

/// Wrap an admin-path store failure into the panic-class kind, preserving
/// kinds that already are panics.
fn panic_class(e: ClusterError) -> ClusterError {
    if e.is_panic() {
        e
    } else {
        ClusterError::Panic(e.to_string())
    }
}
