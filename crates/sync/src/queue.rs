use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use strata_storage::{RecordId, SyncLedger, SyncOperation, SyncQueueEntry};
use tokio::sync::Mutex;

use crate::backoff::BackoffPolicy;
use crate::error::{StorageSnafu, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which an entry is parked and reported.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry { attempts: u32, next_attempt_at: u64 },
    /// Attempt ceiling reached; the entry stays queued without automatic retries.
    Parked { attempts: u32 },
    /// A newer local write replaced the entry while it was in flight.
    Superseded,
}

/// Durable, coalescing queue of local mutations awaiting the remote.
///
/// One entry per record. The in-memory map mirrors the ledger and is written
/// through on every change so a restart resumes with the same backlog.
pub struct SyncQueue {
    ledger: Arc<dyn SyncLedger>,
    policy: RetryPolicy,
    entries: Mutex<BTreeMap<RecordId, SyncQueueEntry>>,
}

impl SyncQueue {
    pub async fn open(ledger: Arc<dyn SyncLedger>, policy: RetryPolicy) -> SyncResult<Self> {
        let loaded = ledger.load_queue().await.context(StorageSnafu {
            stage: "queue-open-load",
        })?;
        let entries = loaded
            .into_iter()
            .map(|entry| (entry.record_id, entry))
            .collect::<BTreeMap<_, _>>();
        if !entries.is_empty() {
            tracing::info!(pending = entries.len(), "restored sync queue");
        }

        Ok(Self {
            ledger,
            policy,
            entries: Mutex::new(entries),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Adds or replaces the entry for `record_id`; a rewrite resets attempts.
    pub async fn enqueue(
        &self,
        record_id: RecordId,
        operation: SyncOperation,
        now: u64,
    ) -> SyncResult<SyncQueueEntry> {
        let mut entries = self.entries.lock().await;
        // Strictly increasing per record so an in-flight ack can tell the
        // entry it uploaded apart from a rewrite.
        let enqueued_at = entries
            .get(&record_id)
            .map_or(now, |previous| now.max(previous.enqueued_at + 1));
        let entry = SyncQueueEntry::new(record_id, operation, enqueued_at);

        self.ledger
            .save_queue_entry(&entry)
            .await
            .context(StorageSnafu {
                stage: "queue-enqueue-persist",
            })?;
        let coalesced = entries.insert(record_id, entry.clone()).is_some();
        tracing::debug!(record_id = %record_id, operation = operation.as_str(), coalesced, "enqueued sync entry");
        Ok(entry)
    }

    /// Entries whose backoff has elapsed, oldest first. Parked entries are skipped.
    pub async fn due(&self, now: u64) -> Vec<SyncQueueEntry> {
        let entries = self.entries.lock().await;
        let mut due = entries
            .values()
            .filter(|entry| entry.attempts < self.policy.max_attempts)
            .filter(|entry| entry.next_attempt_at <= now)
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by_key(|entry| (entry.enqueued_at, entry.record_id));
        due
    }

    /// Removes the entry after remote acknowledgment, unless it was rewritten
    /// since `flushed` was taken.
    pub async fn ack(&self, flushed: &SyncQueueEntry) -> SyncResult<bool> {
        let mut entries = self.entries.lock().await;
        let matches = entries
            .get(&flushed.record_id)
            .is_some_and(|current| current.enqueued_at == flushed.enqueued_at);
        if !matches {
            return Ok(false);
        }

        self.ledger
            .remove_queue_entry(flushed.record_id)
            .await
            .context(StorageSnafu {
                stage: "queue-ack-persist",
            })?;
        entries.remove(&flushed.record_id);
        Ok(true)
    }

    /// Drops `superseded` because the remote copy won, unless the record was
    /// rewritten since the entry was read. Returns whether it was removed.
    pub async fn discard(&self, superseded: &SyncQueueEntry) -> SyncResult<bool> {
        let mut entries = self.entries.lock().await;
        let matches = entries
            .get(&superseded.record_id)
            .is_some_and(|current| current.enqueued_at == superseded.enqueued_at);
        if !matches {
            return Ok(false);
        }

        self.ledger
            .remove_queue_entry(superseded.record_id)
            .await
            .context(StorageSnafu {
                stage: "queue-discard-persist",
            })?;
        entries.remove(&superseded.record_id);
        Ok(true)
    }

    pub async fn record_failure(
        &self,
        flushed: &SyncQueueEntry,
        error: &str,
        now: u64,
    ) -> SyncResult<FailureDisposition> {
        let mut entries = self.entries.lock().await;
        let Some(current) = entries.get_mut(&flushed.record_id) else {
            return Ok(FailureDisposition::Superseded);
        };
        if current.enqueued_at != flushed.enqueued_at {
            return Ok(FailureDisposition::Superseded);
        }

        current.attempts += 1;
        current.last_error = Some(error.to_string());
        let attempts = current.attempts;
        let disposition = if attempts >= self.policy.max_attempts {
            FailureDisposition::Parked { attempts }
        } else {
            current.next_attempt_at = now + self.policy.backoff.delay_ms(attempts);
            FailureDisposition::Retry {
                attempts,
                next_attempt_at: current.next_attempt_at,
            }
        };

        self.ledger
            .save_queue_entry(current)
            .await
            .context(StorageSnafu {
                stage: "queue-record-failure-persist",
            })?;
        Ok(disposition)
    }

    /// Parks an entry immediately, regardless of its attempt count.
    pub async fn park(&self, flushed: &SyncQueueEntry, reason: &str) -> SyncResult<Option<u32>> {
        let mut entries = self.entries.lock().await;
        let Some(current) = entries.get_mut(&flushed.record_id) else {
            return Ok(None);
        };
        if current.enqueued_at != flushed.enqueued_at {
            return Ok(None);
        }

        current.attempts = current.attempts.max(self.policy.max_attempts);
        current.last_error = Some(reason.to_string());
        self.ledger
            .save_queue_entry(current)
            .await
            .context(StorageSnafu {
                stage: "queue-park-persist",
            })?;
        Ok(Some(current.attempts))
    }

    /// Makes every parked entry due again. Returns how many were reset.
    pub async fn retry_parked(&self, now: u64) -> SyncResult<usize> {
        let mut entries = self.entries.lock().await;
        let mut reset = 0;
        for entry in entries.values_mut() {
            if entry.attempts < self.policy.max_attempts {
                continue;
            }
            entry.attempts = 0;
            entry.next_attempt_at = now;
            self.ledger
                .save_queue_entry(entry)
                .await
                .context(StorageSnafu {
                    stage: "queue-retry-parked-persist",
                })?;
            reset += 1;
        }
        if reset > 0 {
            tracing::info!(reset, "re-armed parked sync entries");
        }
        Ok(reset)
    }

    pub async fn get(&self, record_id: RecordId) -> Option<SyncQueueEntry> {
        self.entries.lock().await.get(&record_id).cloned()
    }

    pub async fn parked(&self) -> Vec<SyncQueueEntry> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.attempts >= self.policy.max_attempts)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_storage::MemoryStorage;

    async fn queue_with(policy: RetryPolicy) -> (Arc<MemoryStorage>, SyncQueue) {
        let ledger = Arc::new(MemoryStorage::new("ledger"));
        let queue = SyncQueue::open(ledger.clone(), policy)
            .await
            .expect("open queue");
        (ledger, queue)
    }

    #[tokio::test]
    async fn second_write_replaces_pending_entry() {
        let (ledger, queue) = queue_with(RetryPolicy::default()).await;
        let record_id = RecordId::new_v7();

        let first = queue
            .enqueue(record_id, SyncOperation::Upsert, 100)
            .await
            .expect("first");
        let second = queue
            .enqueue(record_id, SyncOperation::Upsert, 100)
            .await
            .expect("second");

        assert_eq!(queue.len().await, 1);
        assert!(second.enqueued_at > first.enqueued_at);
        assert!(!queue.ack(&first).await.expect("stale ack"));
        assert!(queue.ack(&second).await.expect("ack"));
        assert!(ledger.load_queue().await.expect("ledger").is_empty());
    }

    #[tokio::test]
    async fn discard_keeps_an_entry_rewritten_after_it_was_read() {
        let (ledger, queue) = queue_with(RetryPolicy::default()).await;
        let record_id = RecordId::new_v7();
        let stale = queue
            .enqueue(record_id, SyncOperation::Upsert, 150)
            .await
            .expect("stale edit");
        let rewritten = queue
            .enqueue(record_id, SyncOperation::Upsert, 201)
            .await
            .expect("newer edit");

        assert!(!queue.discard(&stale).await.expect("stale discard"));
        assert_eq!(queue.get(record_id).await, Some(rewritten.clone()));
        assert_eq!(ledger.load_queue().await.expect("ledger"), vec![rewritten.clone()]);

        assert!(queue.discard(&rewritten).await.expect("discard"));
        assert!(queue.is_empty().await);
        assert!(ledger.load_queue().await.expect("ledger").is_empty());
    }

    #[tokio::test]
    async fn failures_back_off_then_park_without_dropping() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy {
                base_ms: 10,
                factor: 2,
                cap_ms: 1_000,
            },
        };
        let (ledger, queue) = queue_with(policy).await;
        let record_id = RecordId::new_v7();
        let entry = queue
            .enqueue(record_id, SyncOperation::Upsert, 0)
            .await
            .expect("enqueue");

        let first = queue
            .record_failure(&entry, "offline", 0)
            .await
            .expect("first failure");
        assert_eq!(
            first,
            FailureDisposition::Retry {
                attempts: 1,
                next_attempt_at: 10
            }
        );
        assert!(queue.due(9).await.is_empty());
        assert_eq!(queue.due(10).await.len(), 1);

        queue
            .record_failure(&entry, "offline", 10)
            .await
            .expect("second failure");
        let third = queue
            .record_failure(&entry, "offline", 30)
            .await
            .expect("third failure");

        assert_eq!(third, FailureDisposition::Parked { attempts: 3 });
        assert!(queue.due(u64::MAX).await.is_empty());
        assert_eq!(queue.parked().await.len(), 1);
        assert_eq!(ledger.load_queue().await.expect("ledger").len(), 1);

        assert_eq!(queue.retry_parked(40).await.expect("retry"), 1);
        assert_eq!(queue.due(40).await.len(), 1);
    }

    #[tokio::test]
    async fn reopened_queue_restores_backlog() {
        let ledger = Arc::new(MemoryStorage::new("ledger"));
        let record_id = RecordId::new_v7();
        {
            let queue = SyncQueue::open(ledger.clone(), RetryPolicy::default())
                .await
                .expect("open");
            queue
                .enqueue(record_id, SyncOperation::Delete, 5)
                .await
                .expect("enqueue");
        }

        let reopened = SyncQueue::open(ledger, RetryPolicy::default())
            .await
            .expect("reopen");
        let restored = reopened.get(record_id).await;

        assert_eq!(
            restored.map(|entry| entry.operation),
            Some(SyncOperation::Delete)
        );
    }
}
