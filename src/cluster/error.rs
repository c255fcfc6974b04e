//! Error types for the cluster coordination layer.
//!
//! # Error Handling Patterns
//!
//! The cluster layer uses two patterns based on where an error surfaces:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used where failure must abort the current operation:
//! - Options validation at construction
//! - Lease grant/revoke on the admin path
//! - Member add/remove during self-rejoin
//!
//! ## Best-Effort (Log and Continue)
//!
//! Used where the next heartbeat tick will retry:
//! - Per-tick status publication
//! - Per-tick member list refresh
//! - Readiness attempts (retried with a fixed backoff)
//!
//! # The Panic Kind
//!
//! [`ClusterError::Panic`] marks a should-not-happen store inconsistency
//! observed by the admin surface (corrupted values, impossible key shapes).
//! It is a distinct error kind for the operator to translate into a
//! structured 500 response — never a process abort.

use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur in the cluster coordination layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Configuration error, fatal at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A lazily-built resource has not been constructed yet.
    #[error("{0} is not ready")]
    NotReady(&'static str),

    /// The quorum cannot be reached or refused the operation.
    #[error("Consensus unavailable: {0}")]
    Unavailable(String),

    /// A key required by the protocol is absent from the store.
    #[error("{0} not found")]
    KeyNotFound(String),

    /// Store inconsistency observed by the admin surface.
    ///
    /// Unrecoverable for the calling operation; the consumer is expected to
    /// surface it as a structured error response, not terminate the process.
    #[error("Cluster panic: {0}")]
    Panic(String),

    /// Error from the embedded consensus engine.
    #[error("Raft error: {0}")]
    Raft(String),

    /// An operation exceeded the per-call request timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Check if this error is transient and worth retrying at the next
    /// readiness attempt or heartbeat tick.
    #[inline]
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::NotReady(_) => true,
            ClusterError::Unavailable(_) => true,
            ClusterError::Timeout(_) => true,
            ClusterError::Raft(_) => true,
            ClusterError::Io(e) => Self::is_io_error_transient(e),

            ClusterError::Config(_) => false,
            ClusterError::KeyNotFound(_) => false,
            ClusterError::Panic(_) => false,
            ClusterError::Serde(_) => false,
        }
    }

    /// Check if this is the panic-class store inconsistency kind.
    #[inline]
    pub fn is_panic(&self) -> bool {
        matches!(self, ClusterError::Panic(_))
    }

    fn is_io_error_transient(e: &std::io::Error) -> bool {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::ConnectionRefused => true,
            ErrorKind::ConnectionReset => true,
            ErrorKind::ConnectionAborted => true,
            ErrorKind::NotConnected => true,
            ErrorKind::BrokenPipe => true,
            ErrorKind::TimedOut => true,
            ErrorKind::Interrupted => true,
            ErrorKind::WouldBlock => true,
            ErrorKind::UnexpectedEof => true,

            ErrorKind::NotFound => false,
            ErrorKind::PermissionDenied => false,
            ErrorKind::AlreadyExists => false,
            ErrorKind::InvalidInput => false,
            ErrorKind::InvalidData => false,
            ErrorKind::AddrInUse => false,

            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_display() {
        let err = ClusterError::Config("invalid request timeout".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Configuration error"));
        assert!(display.contains("invalid request timeout"));
    }

    #[test]
    fn test_not_ready_display() {
        let err = ClusterError::NotReady("lease");
        assert_eq!(format!("{}", err), "lease is not ready");
    }

    #[test]
    fn test_key_not_found_display() {
        let err = ClusterError::KeyNotFound("/leases/member-003".to_string());
        assert_eq!(format!("{}", err), "/leases/member-003 not found");
    }

    #[test]
    fn test_panic_display_and_kind() {
        let err = ClusterError::Panic("status key has 3 fields".to_string());
        assert!(format!("{}", err).contains("Cluster panic"));
        assert!(err.is_panic());
        assert!(!ClusterError::NotReady("client").is_panic());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ClusterError::NotReady("client").is_transient());
        assert!(ClusterError::Unavailable("no leader".to_string()).is_transient());
        assert!(ClusterError::Timeout("member list").is_transient());
        assert!(ClusterError::Raft("replication lag".to_string()).is_transient());

        assert!(!ClusterError::Config("bad dir".to_string()).is_transient());
        assert!(!ClusterError::Panic("bad shape".to_string()).is_transient());
        assert!(!ClusterError::KeyNotFound("/leases/x".to_string()).is_transient());
    }

    #[test]
    fn test_io_error_transient_by_kind() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(ClusterError::Io(refused).is_transient());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!ClusterError::Io(denied).is_transient());
    }

    #[test]
    fn test_error_source() {
        assert!(ClusterError::NotReady("server").source().is_none());

        let io_err = std::io::Error::other("inner");
        assert!(ClusterError::Io(io_err).source().is_some());

        let json_err = serde_json::from_str::<String>("bad").unwrap_err();
        assert!(ClusterError::Serde(json_err).source().is_some());
    }
}
