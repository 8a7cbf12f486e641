use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use snafu::ResultExt;

use super::error::{
    CapacityExceededSnafu, DecodeRecordSnafu, EncodeRecordSnafu, LockPoisonedSnafu, StorageResult,
};
use super::ids::RecordId;
use super::tier::{CapacityClass, Durability, TierCapability};
use super::types::{ConversationRecord, SyncQueueEntry, SyncState};
use super::{ArtifactCollection, BoxFuture, StorageTier, SyncLedger};

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<RecordId, Vec<u8>>,
    queue: BTreeMap<RecordId, SyncQueueEntry>,
    sync_states: BTreeMap<RecordId, SyncState>,
    artifacts: BTreeMap<String, Vec<u8>>,
}

impl MemoryState {
    fn used_bytes_excluding(&self, record_id: RecordId) -> u64 {
        self.records
            .iter()
            .filter(|(id, _)| **id != record_id)
            .map(|(_, body)| body.len() as u64)
            .sum()
    }
}

/// Session-scoped store; contents vanish with the process.
///
/// An optional byte quota over serialized records lets it stand in for a
/// bounded browser-style store.
pub struct MemoryStorage {
    name: String,
    quota_bytes: Option<u64>,
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quota_bytes: None,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_quota(name: impl Into<String>, quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new(name)
        }
    }

    pub fn record_count(&self) -> usize {
        self.lock("memory-record-count")
            .map(|state| state.records.len())
            .unwrap_or(0)
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| LockPoisonedSnafu { stage }.build())
    }

    fn put_record(&self, record: &ConversationRecord) -> StorageResult<()> {
        let body = serde_json::to_vec(record).context(EncodeRecordSnafu {
            stage: "memory-put-encode",
            record_id: record.id.to_string(),
        })?;
        let mut state = self.lock("memory-put")?;

        if let Some(quota_bytes) = self.quota_bytes {
            let projected = state.used_bytes_excluding(record.id) + body.len() as u64;
            if projected > quota_bytes {
                return CapacityExceededSnafu {
                    stage: "memory-put-quota",
                    tier: self.name.clone(),
                    details: format!("{projected} bytes would exceed quota of {quota_bytes}"),
                }
                .fail();
            }
        }

        state.records.insert(record.id, body);
        Ok(())
    }

    fn get_record(&self, record_id: RecordId) -> StorageResult<Option<ConversationRecord>> {
        let state = self.lock("memory-get")?;
        state
            .records
            .get(&record_id)
            .map(|body| {
                serde_json::from_slice(body).context(DecodeRecordSnafu {
                    stage: "memory-get-decode",
                })
            })
            .transpose()
    }

    fn list_records(&self) -> StorageResult<Vec<ConversationRecord>> {
        let state = self.lock("memory-list")?;
        state
            .records
            .values()
            .map(|body| {
                serde_json::from_slice(body).context(DecodeRecordSnafu {
                    stage: "memory-list-decode",
                })
            })
            .collect()
    }
}

impl StorageTier for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> TierCapability {
        TierCapability {
            capacity: self.quota_bytes.map_or(CapacityClass::Unbounded, |quota_bytes| {
                CapacityClass::Bounded { quota_bytes }
            }),
            durability: Durability::Session,
        }
    }

    fn put<'a>(&'a self, record: &'a ConversationRecord) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move { self.put_record(record) })
    }

    fn get<'a>(
        &'a self,
        record_id: RecordId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move { self.get_record(record_id) })
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move { self.list_records() })
    }

    fn delete<'a>(&'a self, record_id: RecordId) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let mut state = self.lock("memory-delete")?;
            Ok(state.records.remove(&record_id).is_some())
        })
    }
}

impl SyncLedger for MemoryStorage {
    fn load_queue<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SyncQueueEntry>>> {
        Box::pin(async move {
            let state = self.lock("memory-load-queue")?;
            Ok(state.queue.values().cloned().collect())
        })
    }

    fn save_queue_entry<'a>(
        &'a self,
        entry: &'a SyncQueueEntry,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.lock("memory-save-queue-entry")?;
            state.queue.insert(entry.record_id, entry.clone());
            Ok(())
        })
    }

    fn remove_queue_entry<'a>(&'a self, record_id: RecordId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.lock("memory-remove-queue-entry")?;
            state.queue.remove(&record_id);
            Ok(())
        })
    }

    fn load_sync_state<'a>(
        &'a self,
        record_id: RecordId,
    ) -> BoxFuture<'a, StorageResult<Option<SyncState>>> {
        Box::pin(async move {
            let state = self.lock("memory-load-sync-state")?;
            Ok(state.sync_states.get(&record_id).cloned())
        })
    }

    fn save_sync_state<'a>(
        &'a self,
        record_id: RecordId,
        sync_state: &'a SyncState,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.lock("memory-save-sync-state")?;
            state.sync_states.insert(record_id, sync_state.clone());
            Ok(())
        })
    }

    fn remove_sync_state<'a>(&'a self, record_id: RecordId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.lock("memory-remove-sync-state")?;
            state.sync_states.remove(&record_id);
            Ok(())
        })
    }
}

impl ArtifactCollection for MemoryStorage {
    fn put_artifact<'a>(
        &'a self,
        artifact_id: &'a str,
        _content_type: &'a str,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.lock("memory-put-artifact")?;
            state.artifacts.insert(artifact_id.to_string(), bytes.to_vec());
            Ok(())
        })
    }

    fn get_artifact<'a>(
        &'a self,
        artifact_id: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Vec<u8>>>> {
        Box::pin(async move {
            let state = self.lock("memory-get-artifact")?;
            Ok(state.artifacts.get(artifact_id).cloned())
        })
    }

    fn delete_artifact<'a>(&'a self, artifact_id: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let mut state = self.lock("memory-delete-artifact")?;
            Ok(state.artifacts.remove(artifact_id).is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[tokio::test]
    async fn quota_counts_replacement_not_both_copies() {
        let record = ConversationRecord::new(RecordId::new_v7(), "quota", 1);
        let size = serde_json::to_vec(&record).map(|body| body.len()).unwrap_or(0) as u64;
        let storage = MemoryStorage::with_quota("bounded", size + 8);

        assert!(storage.put(&record).await.is_ok());
        // Rewriting the same record replaces its bytes instead of stacking them.
        assert!(storage.put(&record).await.is_ok());

        let other = ConversationRecord::new(RecordId::new_v7(), "quota", 2);
        let refused = storage.put(&other).await;
        assert!(matches!(
            refused,
            Err(StorageError::CapacityExceeded { .. })
        ));
        assert_eq!(storage.record_count(), 1);
    }
}
