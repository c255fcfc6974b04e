//! Combined log and state machine storage for the consensus replica.
//!
//! Log entries are kept in memory; snapshots are persisted through an
//! object store rooted at the member's data directory so a replica can
//! recover its state across restarts.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftStorage, Snapshot, SnapshotMeta,
    StorageError, StoredMembership, Vote,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::commands::StoreResponse;
use super::state_machine::StoreStateMachine;
use super::types::{NodeId, TypeConfig};

/// Snapshot metadata stored alongside the snapshot data.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct SnapshotMetadata {
    last_log_id: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot_id: String,
}

/// Persisted snapshot data, cached in memory.
#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

/// Log and state machine storage for one replica.
pub struct ReplicaStore {
    vote: Arc<RwLock<Option<Vote<NodeId>>>>,
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    last_purged_log_id: Arc<RwLock<Option<LogId<NodeId>>>>,
    sm: StoreStateMachine,
    last_applied_log: Arc<RwLock<Option<LogId<NodeId>>>>,
    last_membership: Arc<RwLock<StoredMembership<NodeId, BasicNode>>>,
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
    object_store: Arc<dyn ObjectStore>,
    snapshot_path: ObjectPath,
}

impl ReplicaStore {
    /// Create a new store with object store backing for snapshots.
    pub fn new(object_store: Arc<dyn ObjectStore>, snapshot_prefix: &str) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            last_purged_log_id: Arc::new(RwLock::new(None)),
            sm: StoreStateMachine::new(),
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_snapshot: Arc::new(RwLock::new(None)),
            object_store,
            snapshot_path: ObjectPath::from(snapshot_prefix),
        }
    }

    /// Get the state machine for local reads.
    pub fn state_machine(&self) -> StoreStateMachine {
        self.sm.clone()
    }

    /// Drop restored membership so the node can re-form a singleton quorum
    /// over its existing data (force-new-cluster recovery).
    pub async fn reset_membership(&self) {
        *self.last_membership.write().await = StoredMembership::default();
    }

    /// Load the latest snapshot from the object store on startup.
    ///
    /// Returns `Ok(true)` if a snapshot was loaded, `Ok(false)` on a clean
    /// start, and an error when a snapshot exists but is unreadable (starting
    /// from corrupted state could diverge the replica).
    pub async fn load_snapshot_from_store(&self) -> Result<bool, StorageError<NodeId>> {
        self.cleanup_temp_files().await;

        let data_path = ObjectPath::from(format!("{}/current.snapshot", self.snapshot_path));
        let meta_path = ObjectPath::from(format!("{}/current.meta", self.snapshot_path));

        let meta_bytes = match self.object_store.get(&meta_path).await {
            Ok(result) => result.bytes().await.map_err(|e| {
                error!(error = %e, path = %meta_path, "Snapshot metadata exists but failed to read");
                read_error(e)
            })?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!("No existing snapshot found (clean start)");
                return Ok(false);
            }
            Err(e) => {
                error!(error = %e, "Failed to access snapshot metadata");
                return Err(read_error(e));
            }
        };

        let metadata: SnapshotMetadata = bincode::deserialize(&meta_bytes).map_err(|e| {
            error!(error = %e, path = %meta_path, "Snapshot metadata is corrupted");
            read_error(e)
        })?;

        let data_bytes = match self.object_store.get(&data_path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| {
                    error!(error = %e, path = %data_path, "Snapshot data exists but failed to read");
                    read_error(e)
                })?
                .to_vec(),
            Err(object_store::Error::NotFound { .. }) => {
                error!(
                    snapshot_id = %metadata.snapshot_id,
                    "Snapshot metadata exists but data file is missing"
                );
                return Err(read_error(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "snapshot data file missing",
                )));
            }
            Err(e) => return Err(read_error(e)),
        };

        self.sm.restore(&data_bytes).await.map_err(|e| {
            error!(
                error = %e,
                snapshot_id = %metadata.snapshot_id,
                "Snapshot data is corrupted (deserialization failed)"
            );
            read_error(e)
        })?;
        *self.last_applied_log.write().await = metadata.last_log_id;
        *self.last_membership.write().await = metadata.last_membership.clone();

        let meta = SnapshotMeta {
            last_log_id: metadata.last_log_id,
            last_membership: metadata.last_membership,
            snapshot_id: metadata.snapshot_id,
        };
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data_bytes,
        });

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Restored snapshot"
        );

        Ok(true)
    }

    /// Delete orphaned temp files from crashed snapshot writes. Best effort;
    /// temp files are never referenced by a valid snapshot.
    async fn cleanup_temp_files(&self) {
        use futures::StreamExt;

        let mut stream = self.object_store.list(Some(&self.snapshot_path));
        let mut temp_files: Vec<ObjectPath> = Vec::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(meta) => {
                    let path_str = meta.location.to_string();
                    if path_str.contains("/temp-")
                        && (path_str.ends_with(".snapshot") || path_str.ends_with(".meta"))
                    {
                        temp_files.push(meta.location);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Error listing files during temp cleanup");
                }
            }
        }

        for path in temp_files {
            if let Err(e) = self.object_store.delete(&path).await {
                debug!(error = %e, path = %path, "Failed to delete temp file");
            } else {
                info!(path = %path, "Cleaned up orphaned temp snapshot file");
            }
        }
    }

    /// Persist a snapshot: write data and metadata to temp paths, then move
    /// both into place. The metadata file is the commit marker — a snapshot
    /// is valid only if its metadata exists and points at readable data.
    async fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        data: &[u8],
    ) -> Result<(), StorageError<NodeId>> {
        let temp_data = ObjectPath::from(format!(
            "{}/temp-{}.snapshot",
            self.snapshot_path, meta.snapshot_id
        ));
        let temp_meta = ObjectPath::from(format!(
            "{}/temp-{}.meta",
            self.snapshot_path, meta.snapshot_id
        ));
        let final_data = ObjectPath::from(format!("{}/current.snapshot", self.snapshot_path));
        let final_meta = ObjectPath::from(format!("{}/current.meta", self.snapshot_path));

        let metadata = SnapshotMetadata {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };
        let meta_bytes = bincode::serialize(&metadata).map_err(write_error)?;

        self.object_store
            .put(&temp_data, Bytes::copy_from_slice(data).into())
            .await
            .map_err(write_error)?;

        if let Err(e) = self
            .object_store
            .put(&temp_meta, Bytes::copy_from_slice(&meta_bytes).into())
            .await
        {
            let _ = self.object_store.delete(&temp_data).await;
            return Err(write_error(e));
        }

        self.promote(&temp_data, &final_data, &[&temp_meta]).await?;
        self.promote(&temp_meta, &final_meta, &[]).await?;

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            size_bytes = data.len(),
            "Persisted snapshot"
        );

        Ok(())
    }

    /// Move `from` to `to`, falling back to copy+delete on backends without
    /// rename. `cleanup` paths are removed if the promotion fails.
    async fn promote(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
        cleanup: &[&ObjectPath],
    ) -> Result<(), StorageError<NodeId>> {
        if self.object_store.rename(from, to).await.is_ok() {
            return Ok(());
        }
        if let Err(e) = self.object_store.copy(from, to).await {
            error!(error = %e, from = %from, to = %to, "Failed to promote snapshot file");
            let _ = self.object_store.delete(from).await;
            for path in cleanup {
                let _ = self.object_store.delete(path).await;
            }
            return Err(write_error(e));
        }
        let _ = self.object_store.delete(from).await;
        Ok(())
    }
}

fn read_error<E>(e: E) -> StorageError<NodeId>
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::from_io_error(
        openraft::ErrorSubject::Snapshot(None),
        openraft::ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn write_error<E>(e: E) -> StorageError<NodeId>
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::from_io_error(
        openraft::ErrorSubject::Snapshot(None),
        openraft::ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

impl RaftStorage<TypeConfig> for ReplicaStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Self {
            vote: self.vote.clone(),
            log: self.log.clone(),
            last_purged_log_id: self.last_purged_log_id.clone(),
            sm: self.sm.clone(),
            last_applied_log: self.last_applied_log.clone(),
            last_membership: self.last_membership.clone(),
            cached_snapshot: self.cached_snapshot.clone(),
            object_store: self.object_store.clone(),
            snapshot_path: self.snapshot_path.clone(),
        }
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> Result<openraft::storage::LogState<TypeConfig>, StorageError<NodeId>> {
        let log = self.log.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = log.values().last().map(|e| e.log_id);

        Ok(openraft::storage::LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        *self.last_purged_log_id.write().await = Some(log_id);

        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<StoreResponse>, StorageError<NodeId>> {
        let mut responses = Vec::new();

        for entry in entries {
            *self.last_applied_log.write().await = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => {
                    responses.push(StoreResponse::Ok);
                }
                EntryPayload::Normal(command) => {
                    responses.push(self.sm.apply_command(command.clone()).await);
                }
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    responses.push(StoreResponse::Ok);
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Self {
            vote: self.vote.clone(),
            log: self.log.clone(),
            last_purged_log_id: self.last_purged_log_id.clone(),
            sm: self.sm.clone(),
            last_applied_log: self.last_applied_log.clone(),
            last_membership: self.last_membership.clone(),
            cached_snapshot: self.cached_snapshot.clone(),
            object_store: self.object_store.clone(),
            snapshot_path: self.snapshot_path.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();

        self.sm.restore(&data).await.map_err(|e| {
            error!(
                error = %e,
                snapshot_id = %meta.snapshot_id,
                "Rejecting received snapshot (deserialization failed)"
            );
            read_error(e)
        })?;
        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await =
            StoredMembership::new(meta.last_log_id, meta.last_membership.membership().clone());

        self.persist_snapshot(meta, &data).await?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let snapshot_guard = self.cached_snapshot.read().await;
        match &*snapshot_guard {
            Some(cached) => Ok(Some(Snapshot {
                meta: cached.meta.clone(),
                snapshot: Box::new(Cursor::new(cached.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for ReplicaStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let data = self.sm.snapshot().await;

        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();

        let snapshot_id = format!("snapshot-{}", last_applied.map(|l| l.index).unwrap_or(0));

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        self.persist_snapshot(&meta, &data).await?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for ReplicaStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let log = self.log.read().await;
        let entries: Vec<_> = log.range(range).map(|(_, e)| e.clone()).collect();
        Ok(entries)
    }
}
