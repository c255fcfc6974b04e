//! Centralized timing and capacity constants.
//!
//! This module consolidates the fixed operational constants used by the
//! cluster layer and the topic engine. These values are intentionally not
//! user-tunable; they encode the coordination contract between members.
//!
//! # Categories
//!
//! - **Coordinator Constants**: heartbeat and readiness timing
//! - **Client Constants**: dial and keepalive behavior
//! - **Lease Constants**: lease and session TTLs
//! - **Topic Constants**: level cache sizing

use std::time::Duration;

// =============================================================================
// Coordinator Constants
// =============================================================================

/// Interval between heartbeat ticks.
///
/// Each tick publishes the member status document under the member lease and
/// refreshes the registry from the consensus member list. Also used as the
/// fixed backoff when the readiness protocol fails transiently.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long to wait for the embedded consensus server to become ready
/// before hard-closing it and reporting startup failure.
pub const WAIT_SERVER_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Client Constants
// =============================================================================

/// Timeout for establishing a connection to a quorum endpoint.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive probe interval for quorum connections.
pub const DIAL_KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// How long a keepalive probe may go unanswered before the connection
/// is considered dead.
pub const DIAL_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which the client re-syncs its endpoint list from the
/// consensus member list.
pub const AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Lease Constants
// =============================================================================

/// TTL for the session used by election/mutex primitives, in seconds.
pub const SESSION_TTL_SECS: u64 = 10;

/// TTL granted to member liveness leases, in seconds.
///
/// Effectively "forever" (~285 years); the client keepalive is what keeps
/// the lease alive in practice, so the operational liveness window is
/// bounded by the keepalive cadence, not this value.
pub const MAX_LEASE_TTL_SECS: u64 = 9_000_000_000;

// =============================================================================
// Topic Constants
// =============================================================================

/// Default capacity of the topic level cache.
pub const DEFAULT_TOPIC_CACHE_SIZE: u64 = 100_000;
