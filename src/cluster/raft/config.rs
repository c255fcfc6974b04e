//! Configuration for one consensus replica.

use std::time::Duration;

use super::types::NodeId;

/// Configuration for the embedded consensus replica of a writer.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// This node's consensus-assigned id.
    pub node_id: NodeId,

    /// This member's name.
    pub member_name: String,

    /// Address for consensus RPC (listen and advertise).
    pub raft_addr: String,

    /// Directory for snapshot persistence.
    pub data_dir: String,

    /// Heartbeat interval for the Raft leader.
    pub heartbeat_interval: Duration,

    /// Election timeout range (min).
    pub election_timeout_min: Duration,

    /// Election timeout range (max).
    pub election_timeout_max: Duration,

    /// Maximum entries per AppendEntries RPC.
    pub max_payload_entries: u64,

    /// Create a snapshot after this many log entries.
    pub snapshot_threshold: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            member_name: "member-001".to_string(),
            raft_addr: "127.0.0.1:2380".to_string(),
            data_dir: String::new(),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(400),
            max_payload_entries: 100,
            snapshot_threshold: 1_000,
        }
    }
}

impl ReplicaConfig {
    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.raft_addr.is_empty() {
            errors.push("raft_addr must not be empty".to_string());
        }
        if self.data_dir.is_empty() {
            errors.push("data_dir must not be empty".to_string());
        }
        if self.election_timeout_min >= self.election_timeout_max {
            errors.push(format!(
                "election_timeout_min ({:?}) must be less than election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            errors.push(format!(
                "heartbeat_interval ({:?}) must be less than election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }
        if self.max_payload_entries == 0 {
            errors.push("max_payload_entries must be at least 1".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "meshgate-cluster".to_string(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            max_payload_entries: self.max_payload_entries,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid_with_data_dir() {
        let config = ReplicaConfig {
            data_dir: "/tmp/meshgate-test".to_string(),
            ..ReplicaConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_data_dir_fails() {
        let errors = ReplicaConfig::default().validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("data_dir")));
    }

    #[test]
    fn test_inverted_election_timeouts_fail() {
        let config = ReplicaConfig {
            data_dir: "/tmp/meshgate-test".to_string(),
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(400),
            ..ReplicaConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_openraft_config() {
        let config = ReplicaConfig::default();
        let openraft_config = config.to_openraft_config();

        assert_eq!(openraft_config.cluster_name, "meshgate-cluster");
        assert_eq!(openraft_config.heartbeat_interval, 100);
        assert_eq!(openraft_config.election_timeout_min, 200);
        assert_eq!(openraft_config.election_timeout_max, 400);
        assert_eq!(openraft_config.max_payload_entries, 100);
    }
}
