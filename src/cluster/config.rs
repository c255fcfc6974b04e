//! Configuration for a cluster member.
//!
//! Options are immutable for the lifetime of the process. Timing constants
//! (heartbeat interval, server wait timeout, session TTL, dial behavior) are
//! deliberately not configurable; see [`crate::constants`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Role a member assumes in the cluster.
///
/// Writers run an embedded consensus replica and may mutate the store.
/// Readers connect as pure clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    Writer,
    Reader,
}

impl std::fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterRole::Writer => write!(f, "writer"),
            ClusterRole::Reader => write!(f, "reader"),
        }
    }
}

impl std::str::FromStr for ClusterRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "writer" => Ok(ClusterRole::Writer),
            "reader" => Ok(ClusterRole::Reader),
            _ => Err(format!("Unknown role '{}'. Valid roles: writer, reader", s)),
        }
    }
}

/// Configuration for one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterOptions {
    /// This member's name (must be unique across the cluster).
    ///
    /// The name keys the member's lease and status rows, so it must be
    /// stable across restarts of the same logical member.
    pub name: String,

    /// Role of this member.
    pub role: ClusterRole,

    /// Directory for the embedded server's durable state (writers only).
    pub data_dir: String,

    /// Address this member's consensus replica listens on and advertises
    /// to peers (writers only), `host:port`.
    pub peer_url: String,

    /// Client endpoint this member advertises, `host:port`.
    pub client_url: String,

    /// Peers known at startup, `name=host:port` entries.
    ///
    /// Writers list the peer URLs of the members forming the quorum;
    /// readers list the endpoints they dial.
    pub initial_peers: Vec<String>,

    /// Hard deadline for every outward consensus call.
    pub request_timeout: Duration,

    /// Instruct the embedded server to ignore prior state and form a
    /// singleton quorum. Used for disaster recovery.
    pub force_new_cluster: bool,

    /// Whether a reader publishes its status document under its lease.
    ///
    /// Readers always hold a lease; publication is opt-in.
    pub publish_reader_status: bool,

    /// Capacity of the broker's topic level cache.
    pub topic_cache_size: u64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            name: "member-001".to_string(),
            role: ClusterRole::Writer,
            data_dir: String::new(),
            peer_url: String::new(),
            client_url: String::new(),
            initial_peers: Vec::new(),
            request_timeout: Duration::from_secs(10),
            force_new_cluster: false,
            publish_reader_status: false,
            topic_cache_size: crate::constants::DEFAULT_TOPIC_CACHE_SIZE,
        }
    }
}

impl ClusterOptions {
    /// Validate the options and return all errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.name.contains('/') {
            errors.push(format!("name ({}) must not contain '/'", self.name));
        }

        if self.request_timeout.is_zero() {
            errors.push("request_timeout must be greater than 0".to_string());
        }

        if self.topic_cache_size == 0 {
            errors.push("topic_cache_size must be greater than 0".to_string());
        }

        if self.role == ClusterRole::Writer {
            if self.data_dir.is_empty() {
                errors.push("data_dir must be set for writers".to_string());
            }
            if self.peer_url.is_empty() {
                errors.push("peer_url must be set for writers".to_string());
            }
        } else {
            if self.force_new_cluster {
                errors.push("force_new_cluster is only meaningful for writers".to_string());
            }
            if self.initial_peers.is_empty() {
                errors.push("readers must list at least one initial peer".to_string());
            }
        }

        for entry in &self.initial_peers {
            if parse_peer_entry(entry).is_none() {
                errors.push(format!(
                    "invalid initial peer '{}', expected name=host:port",
                    entry
                ));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Create options from environment variables.
    ///
    /// - `CLUSTER_NAME`: member name
    /// - `CLUSTER_ROLE`: `writer` or `reader` (default: writer)
    /// - `CLUSTER_DATA_DIR`: embedded server state directory
    /// - `CLUSTER_PEER_URL`: consensus replica listen/advertise address
    /// - `CLUSTER_CLIENT_URL`: advertised client endpoint
    /// - `CLUSTER_INITIAL_PEERS`: comma-separated `name=host:port` entries
    /// - `CLUSTER_REQUEST_TIMEOUT_SECS`: per-call deadline (default: 10)
    /// - `CLUSTER_FORCE_NEW`: `true` to form a singleton quorum
    /// - `CLUSTER_TOPIC_CACHE_SIZE`: topic level cache capacity
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let name = std::env::var("CLUSTER_NAME").unwrap_or(defaults.name);

        let role = match std::env::var("CLUSTER_ROLE") {
            Ok(s) => s.parse::<ClusterRole>()?,
            Err(_) => ClusterRole::Writer,
        };

        let request_timeout = match std::env::var("CLUSTER_REQUEST_TIMEOUT_SECS") {
            Ok(s) => {
                let secs: u64 = s
                    .parse()
                    .map_err(|e| format!("Invalid CLUSTER_REQUEST_TIMEOUT_SECS: {}", e))?;
                Duration::from_secs(secs)
            }
            Err(_) => defaults.request_timeout,
        };

        let initial_peers = std::env::var("CLUSTER_INITIAL_PEERS")
            .map(|s| {
                s.split(',')
                    .filter(|p| !p.is_empty())
                    .map(|p| p.trim().to_string())
                    .collect()
            })
            .unwrap_or_default();

        let force_new_cluster = std::env::var("CLUSTER_FORCE_NEW")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        let topic_cache_size: u64 = match std::env::var("CLUSTER_TOPIC_CACHE_SIZE") {
            Ok(s) => s
                .parse()
                .map_err(|e| format!("Invalid CLUSTER_TOPIC_CACHE_SIZE: {}", e))?,
            Err(_) => defaults.topic_cache_size,
        };

        let options = Self {
            name,
            role,
            data_dir: std::env::var("CLUSTER_DATA_DIR").unwrap_or_default(),
            peer_url: std::env::var("CLUSTER_PEER_URL").unwrap_or_default(),
            client_url: std::env::var("CLUSTER_CLIENT_URL").unwrap_or_default(),
            initial_peers,
            request_timeout,
            force_new_cluster,
            publish_reader_status: false,
            topic_cache_size,
        };

        options
            .validate()
            .map_err(|errors| format!("Invalid cluster options: {}", errors.join("; ")))?;

        Ok(options)
    }
}

/// Parse one `name=host:port` initial-peer entry.
pub fn parse_peer_entry(entry: &str) -> Option<(&str, &str)> {
    let (name, url) = entry.split_once('=')?;
    if name.is_empty() || url.is_empty() {
        return None;
    }
    Some((name, url))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_options() -> ClusterOptions {
        ClusterOptions {
            name: "member-001".to_string(),
            role: ClusterRole::Writer,
            data_dir: "/tmp/meshgate-test".to_string(),
            peer_url: "127.0.0.1:2380".to_string(),
            client_url: "127.0.0.1:2379".to_string(),
            ..ClusterOptions::default()
        }
    }

    #[test]
    fn test_validate_writer_defaults() {
        assert!(writer_options().validate().is_ok());
    }

    #[test]
    fn test_validate_empty_name_fails() {
        let options = ClusterOptions {
            name: String::new(),
            ..writer_options()
        };
        let errors = options.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("name")));
    }

    #[test]
    fn test_validate_name_with_slash_fails() {
        let options = ClusterOptions {
            name: "bad/name".to_string(),
            ..writer_options()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_writer_requires_data_dir_and_peer_url() {
        let options = ClusterOptions {
            data_dir: String::new(),
            peer_url: String::new(),
            ..writer_options()
        };
        let errors = options.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("data_dir")));
        assert!(errors.iter().any(|e| e.contains("peer_url")));
    }

    #[test]
    fn test_validate_reader_requires_peers() {
        let options = ClusterOptions {
            role: ClusterRole::Reader,
            initial_peers: Vec::new(),
            ..ClusterOptions::default()
        };
        let errors = options.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("initial peer")));
    }

    #[test]
    fn test_validate_reader_rejects_force_new() {
        let options = ClusterOptions {
            role: ClusterRole::Reader,
            force_new_cluster: true,
            initial_peers: vec!["member-001=127.0.0.1:2380".to_string()],
            ..ClusterOptions::default()
        };
        let errors = options.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("force_new_cluster")));
    }

    #[test]
    fn test_validate_zero_timeout_fails() {
        let options = ClusterOptions {
            request_timeout: Duration::ZERO,
            ..writer_options()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_zero_topic_cache_size_fails() {
        let options = ClusterOptions {
            topic_cache_size: 0,
            ..writer_options()
        };
        let errors = options.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("topic_cache_size")));
    }

    #[test]
    fn test_default_topic_cache_size() {
        assert_eq!(
            ClusterOptions::default().topic_cache_size,
            crate::constants::DEFAULT_TOPIC_CACHE_SIZE
        );
    }

    #[test]
    fn test_validate_bad_peer_entry_fails() {
        let options = ClusterOptions {
            initial_peers: vec!["member-002".to_string()],
            ..writer_options()
        };
        let errors = options.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("initial peer")));
    }

    #[test]
    fn test_parse_peer_entry() {
        assert_eq!(
            parse_peer_entry("member-002=10.0.0.2:2380"),
            Some(("member-002", "10.0.0.2:2380"))
        );
        assert_eq!(parse_peer_entry("member-002"), None);
        assert_eq!(parse_peer_entry("=10.0.0.2:2380"), None);
        assert_eq!(parse_peer_entry("member-002="), None);
    }

    #[test]
    fn test_role_parse_and_display() {
        assert_eq!("writer".parse::<ClusterRole>().unwrap(), ClusterRole::Writer);
        assert_eq!("Reader".parse::<ClusterRole>().unwrap(), ClusterRole::Reader);
        assert!("observer".parse::<ClusterRole>().is_err());
        assert_eq!(ClusterRole::Writer.to_string(), "writer");
        assert_eq!(ClusterRole::Reader.to_string(), "reader");
    }
}
