//! Lease and session lifecycle for one member.
//!
//! Each member owns exactly one liveness lease; every status row it writes
//! lives under that lease, so losing the member expires its rows. A
//! concurrent session (short TTL) is created lazily when election or mutex
//! primitives are needed.

use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use tokio::sync::RwLock;
use tracing::info;

use super::client::ConsensusClient;
use super::error::{ClusterError, ClusterResult};
use super::layout::Layout;
use crate::constants::{MAX_LEASE_TTL_SECS, SESSION_TTL_SECS};

/// Parse a lease id from its lowercase-hex wire form.
pub fn parse_lease(s: &str) -> ClusterResult<u64> {
    u64::from_str_radix(s.trim(), 16)
        .map_err(|e| ClusterError::Panic(format!("parse lease {} failed: {}", s, e)))
}

/// Format a lease id into its lowercase-hex wire form.
pub fn format_lease(id: u64) -> String {
    format!("{:x}", id)
}

/// A session over a short-TTL lease, backing election/mutex primitives.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    lease: u64,
}

impl Session {
    pub fn lease(&self) -> u64 {
        self.lease
    }
}

/// Owns the member's liveness lease and the lazily-created session.
#[derive(Debug)]
pub struct LeaseManager {
    layout: Layout,
    lease: StdRwLock<Option<u64>>,
    session: RwLock<Option<Session>>,
}

impl LeaseManager {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            lease: StdRwLock::new(None),
            session: RwLock::new(None),
        }
    }

    /// The member's lease id.
    pub fn lease(&self) -> ClusterResult<u64> {
        self.lease
            .read()
            .unwrap()
            .ok_or(ClusterError::NotReady("lease"))
    }

    /// Adopt a persisted lease or grant a fresh one.
    ///
    /// Idempotent: returns immediately when the lease is already in place.
    pub async fn init_lease(&self, client: &Arc<ConsensusClient>) -> ClusterResult<()> {
        if self.lease().is_ok() {
            return Ok(());
        }

        if let Some(lease_str) = client.get(&self.layout.lease()).await? {
            let lease = parse_lease(&lease_str)?;
            *self.lease.write().unwrap() = Some(lease);
            client.spawn_keepalive(lease, MAX_LEASE_TTL_SECS).await;
            info!(lease = %format_lease(lease), "Lease is ready (adopted)");
            return Ok(());
        }

        let lease = client.lease_grant(MAX_LEASE_TTL_SECS).await?;

        // NOTE: install before publishing. The publish below takes the
        // under-lease path, which reads this slot.
        *self.lease.write().unwrap() = Some(lease);
        info!(lease = %format_lease(lease), "Lease is ready");

        client
            .put_under_lease(&self.layout.lease(), &format_lease(lease), lease)
            .await
            .map_err(|e| {
                ClusterError::Unavailable(format!(
                    "put lease to {} failed: {}",
                    self.layout.lease(),
                    e
                ))
            })?;

        client.spawn_keepalive(lease, MAX_LEASE_TTL_SECS).await;

        Ok(())
    }

    /// The session, created on first use (double-checked).
    pub async fn get_session(&self, client: &Arc<ConsensusClient>) -> ClusterResult<Session> {
        if let Some(session) = *self.session.read().await {
            return Ok(session);
        }

        let mut guard = self.session.write().await;
        if let Some(session) = *guard {
            return Ok(session);
        }

        let lease = client.lease_grant(SESSION_TTL_SECS).await?;
        client.spawn_keepalive(lease, SESSION_TTL_SECS).await;
        let session = Session { lease };
        *guard = Some(session);

        info!(lease = %format_lease(lease), "Session is ready");
        Ok(session)
    }

    /// Revoke the session lease, if any. Idempotent.
    pub async fn close_session(&self, client: &Arc<ConsensusClient>) {
        let mut guard = self.session.write().await;
        if let Some(session) = guard.take()
            && let Err(e) = client.lease_revoke(session.lease).await
        {
            tracing::error!(error = %e, "Close session failed");
        }
    }
}
