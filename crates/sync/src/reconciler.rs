use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use strata_storage::{
    Clock, ConflictWinner, ConversationRecord, EventSink, PutOutcome, RecordId, StorageEvent,
    SyncLedger, SyncOperation, SyncQueueEntry, SyncState, TieredCache,
};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{EncodeUploadSnafu, RemoteError, StorageSnafu, SyncResult};
use crate::queue::{FailureDisposition, SyncQueue};
use crate::remote::{RemoteEntry, RemoteStore, UploadMetadata};

pub const RECORD_CONTENT_TYPE: &str = "application/json";
const RECORD_FILE_SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    pub conversations_folder: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            conversations_folder: "conversations".to_string(),
        }
    }
}

/// Outcome counters of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pulled: usize,
    pub pushed: usize,
    pub deleted_remote: usize,
    pub remote_wins: usize,
    pub local_wins: usize,
    pub in_sync: usize,
    pub retried: usize,
    pub parked: usize,
    pub paused: bool,
}

pub fn record_file_name(record_id: RecordId) -> String {
    format!("{record_id}{RECORD_FILE_SUFFIX}")
}

fn record_id_from_file_name(name: &str) -> Option<RecordId> {
    let stem = name.strip_suffix(RECORD_FILE_SUFFIX)?;
    RecordId::parse(stem).ok()
}

/// Bidirectional merge between the local cache and the remote folder.
///
/// A pass pulls first, then flushes due queue entries. Conflicts resolve by
/// last-modified-wins; equal timestamps are treated as already in sync. An
/// `AuthExpired` response pauses the reconciler until [`Reconciler::resume`].
pub struct Reconciler {
    cache: Arc<TieredCache>,
    queue: Arc<SyncQueue>,
    ledger: Arc<dyn SyncLedger>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    config: ReconcilerConfig,
    paused: AtomicBool,
    pause_reason: StdMutex<Option<String>>,
    pass_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        cache: Arc<TieredCache>,
        queue: Arc<SyncQueue>,
        ledger: Arc<dyn SyncLedger>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        events: EventSink,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            cache,
            queue,
            ledger,
            remote,
            clock,
            events,
            config,
            paused: AtomicBool::new(false),
            pause_reason: StdMutex::new(None),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause_reason(&self) -> Option<String> {
        self.pause_reason.lock().ok().and_then(|reason| reason.clone())
    }

    pub fn pause(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(%reason, "sync paused");
        if let Ok(mut slot) = self.pause_reason.lock() {
            *slot = Some(reason.clone());
        }
        self.events.emit(StorageEvent::SyncPaused { reason });
    }

    pub fn resume(&self) {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.pause_reason.lock() {
            *slot = None;
        }
        tracing::info!("sync resumed");
        self.events.emit(StorageEvent::SyncResumed);
    }

    /// Runs one pull-then-flush pass. A paused reconciler performs no network calls.
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        let _pass = self.pass_lock.lock().await;
        let mut report = SyncReport::default();
        if self.is_paused() {
            report.paused = true;
            return Ok(report);
        }

        self.pull(&mut report).await?;
        if !self.is_paused() {
            self.flush(&mut report).await?;
        }

        report.paused = self.is_paused();
        tracing::debug!(?report, "sync pass finished");
        Ok(report)
    }

    async fn pull(&self, report: &mut SyncReport) -> SyncResult<()> {
        let listing = match self.remote.list(&self.config.conversations_folder).await {
            Ok(listing) => listing,
            Err(error) => {
                self.note_remote_failure("pull-list", &error);
                return Ok(());
            }
        };

        // Duplicates of one record keep only the newest remote copy.
        let mut newest: BTreeMap<RecordId, RemoteEntry> = BTreeMap::new();
        for entry in listing {
            let Some(record_id) = record_id_from_file_name(&entry.name) else {
                tracing::debug!(name = %entry.name, "ignoring foreign remote file");
                continue;
            };
            let replace = newest
                .get(&record_id)
                .is_none_or(|held| entry.modified_at > held.modified_at);
            if replace {
                newest.insert(record_id, entry);
            }
        }

        for (record_id, entry) in newest {
            if self.is_paused() {
                break;
            }
            self.pull_one(record_id, entry, report).await?;
        }
        Ok(())
    }

    async fn pull_one(
        &self,
        record_id: RecordId,
        entry: RemoteEntry,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let queued = self.queue.get(record_id).await;
        if queued
            .as_ref()
            .is_some_and(|queued| queued.operation == SyncOperation::Delete)
        {
            // The local delete is pushed by flush.
            return Ok(());
        }

        let local = self.cache.get(record_id).await.context(StorageSnafu {
            stage: "reconcile-pull-local",
        })?;
        let mut state = self
            .ledger
            .load_sync_state(record_id)
            .await
            .context(StorageSnafu {
                stage: "reconcile-pull-state",
            })?
            .unwrap_or_default();
        let local_modified = local.as_ref().map(|record| record.last_modified);

        match local_modified {
            Some(local_modified) if local_modified == entry.modified_at => {
                state.remote_id = Some(entry.id);
                state.last_known_remote_modified = Some(entry.modified_at);
                state.last_synced_version = Some(local_modified);
                self.save_state(record_id, &state, "reconcile-pull-in-sync")
                    .await?;
                report.in_sync += 1;
            }
            Some(local_modified) if local_modified > entry.modified_at => {
                let remote_changed = state
                    .last_known_remote_modified
                    .is_some_and(|known| known != entry.modified_at);
                if remote_changed && queued.is_some() {
                    tracing::info!(record_id = %record_id, local_modified, remote_modified = entry.modified_at, "local copy wins conflict");
                    self.events.emit(StorageEvent::ConflictResolved {
                        record_id,
                        winner: ConflictWinner::Local,
                        local_modified: Some(local_modified),
                        remote_modified: entry.modified_at,
                    });
                    report.local_wins += 1;
                }
                state.remote_id.get_or_insert(entry.id);
                state.last_known_remote_modified = Some(entry.modified_at);
                self.save_state(record_id, &state, "reconcile-pull-local-newer")
                    .await?;
            }
            _ => {
                self.apply_remote(record_id, entry, local_modified, queued, report)
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_remote(
        &self,
        record_id: RecordId,
        entry: RemoteEntry,
        local_modified: Option<u64>,
        queued: Option<SyncQueueEntry>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let bytes = match self.remote.download(&entry.id).await {
            Ok(bytes) => bytes,
            Err(error) => {
                self.note_remote_failure("pull-download", &error);
                return Ok(());
            }
        };
        let mut record = match serde_json::from_slice::<ConversationRecord>(&bytes) {
            Ok(record) if record.id == record_id => record,
            Ok(record) => {
                tracing::warn!(expected = %record_id, found = %record.id, remote_id = %entry.id, "remote file holds a different record");
                return Ok(());
            }
            Err(error) => {
                tracing::warn!(record_id = %record_id, remote_id = %entry.id, %error, "skipping undecodable remote record");
                return Ok(());
            }
        };
        record.last_modified = record.last_modified.max(entry.modified_at);

        let outcome = self.cache.put(&record).await.context(StorageSnafu {
            stage: "reconcile-pull-apply",
        })?;
        if let PutOutcome::Stale { held_last_modified } = outcome {
            tracing::debug!(record_id = %record_id, held_last_modified, "local write raced ahead of pull");
            return Ok(());
        }

        let state = SyncState {
            remote_id: Some(entry.id),
            last_synced_version: Some(record.last_modified),
            last_known_remote_modified: Some(entry.modified_at),
        };
        self.save_state(record_id, &state, "reconcile-pull-remote-newer")
            .await?;
        report.pulled += 1;

        let Some(queued) = queued else {
            return Ok(());
        };
        if !self.queue.discard(&queued).await? {
            // A local write landed after the remote copy; flush pushes it.
            tracing::debug!(record_id = %record_id, "queued edit was rewritten during pull; keeping it");
            return Ok(());
        }
        tracing::info!(record_id = %record_id, ?local_modified, remote_modified = entry.modified_at, "remote copy wins conflict; dropping queued local edit");
        self.events.emit(StorageEvent::ConflictResolved {
            record_id,
            winner: ConflictWinner::Remote,
            local_modified,
            remote_modified: entry.modified_at,
        });
        report.remote_wins += 1;
        Ok(())
    }

    async fn flush(&self, report: &mut SyncReport) -> SyncResult<()> {
        let now = self.clock.now_millis();
        for entry in self.queue.due(now).await {
            if self.is_paused() {
                break;
            }
            match entry.operation {
                SyncOperation::Upsert => self.push_upsert(&entry, report).await?,
                SyncOperation::Delete => self.push_delete(&entry, report).await?,
            }
        }
        Ok(())
    }

    async fn push_upsert(&self, entry: &SyncQueueEntry, report: &mut SyncReport) -> SyncResult<()> {
        let record_id = entry.record_id;
        let Some(record) = self.cache.get(record_id).await.context(StorageSnafu {
            stage: "reconcile-flush-local",
        })?
        else {
            return self
                .handle_failure(entry, "record is missing from every local tier", report)
                .await;
        };
        let mut state = self.load_state(record_id, "reconcile-flush-state").await?;

        if record.reduced && state.remote_id.is_some() {
            let reason = "local copy is reduced; refusing to overwrite the full remote copy";
            if let Some(attempts) = self.queue.park(entry, reason).await? {
                self.report_parked(record_id, attempts, reason, report);
            }
            return Ok(());
        }

        let body = serde_json::to_vec(&record).context(EncodeUploadSnafu {
            stage: "reconcile-flush-encode",
            record_id: record_id.to_string(),
        })?;
        let metadata = UploadMetadata {
            folder: self.config.conversations_folder.clone(),
            file_name: record_file_name(record_id),
            content_type: RECORD_CONTENT_TYPE.to_string(),
            modified_at: record.last_modified,
            replace: state.remote_id.clone(),
        };

        let mut uploaded = self.remote.upload(body.clone(), metadata.clone()).await;
        if metadata.replace.is_some()
            && uploaded.as_ref().is_err_and(RemoteError::is_not_found)
        {
            // The remote object vanished; recreate it.
            uploaded = self
                .remote
                .upload(
                    body,
                    UploadMetadata {
                        replace: None,
                        ..metadata
                    },
                )
                .await;
        }

        match uploaded {
            Ok(receipt) => {
                state.remote_id = Some(receipt.id);
                state.last_synced_version = Some(record.last_modified);
                state.last_known_remote_modified = Some(receipt.modified_at);
                self.save_state(record_id, &state, "reconcile-flush-state-save")
                    .await?;
                self.queue.ack(entry).await?;
                report.pushed += 1;
                Ok(())
            }
            Err(error) => self.handle_remote_failure(entry, error, report).await,
        }
    }

    async fn push_delete(&self, entry: &SyncQueueEntry, report: &mut SyncReport) -> SyncResult<()> {
        let record_id = entry.record_id;
        let state = self.load_state(record_id, "reconcile-delete-state").await?;

        if let Some(remote_id) = state.remote_id.as_deref() {
            match self.remote.delete(remote_id).await {
                Ok(()) => report.deleted_remote += 1,
                Err(error) if error.is_not_found() => {}
                Err(error) => return self.handle_remote_failure(entry, error, report).await,
            }
        }

        self.ledger
            .remove_sync_state(record_id)
            .await
            .context(StorageSnafu {
                stage: "reconcile-delete-state-remove",
            })?;
        self.queue.ack(entry).await?;
        Ok(())
    }

    async fn handle_remote_failure(
        &self,
        entry: &SyncQueueEntry,
        error: RemoteError,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        if error.is_auth() {
            // Not an attempt against the entry: nothing was wrong with it.
            self.pause(error.to_string());
            return Ok(());
        }
        self.handle_failure(entry, &error.to_string(), report).await
    }

    async fn handle_failure(
        &self,
        entry: &SyncQueueEntry,
        error: &str,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let now = self.clock.now_millis();
        match self.queue.record_failure(entry, error, now).await? {
            FailureDisposition::Retry {
                attempts,
                next_attempt_at,
            } => {
                tracing::warn!(record_id = %entry.record_id, attempts, next_attempt_at, %error, "sync attempt failed; will retry");
                report.retried += 1;
            }
            FailureDisposition::Parked { attempts } => {
                self.report_parked(entry.record_id, attempts, error, report);
            }
            FailureDisposition::Superseded => {}
        }
        Ok(())
    }

    fn report_parked(&self, record_id: RecordId, attempts: u32, error: &str, report: &mut SyncReport) {
        tracing::error!(record_id = %record_id, attempts, %error, "sync entry parked after persistent failure");
        self.events.emit(StorageEvent::PersistentSyncFailure {
            record_id,
            attempts,
            last_error: error.to_string(),
        });
        report.parked += 1;
    }

    fn note_remote_failure(&self, stage: &'static str, error: &RemoteError) {
        if error.is_auth() {
            self.pause(error.to_string());
        } else {
            tracing::warn!(stage, %error, "remote call failed; will retry next pass");
        }
    }

    async fn load_state(&self, record_id: RecordId, stage: &'static str) -> SyncResult<SyncState> {
        Ok(self
            .ledger
            .load_sync_state(record_id)
            .await
            .context(StorageSnafu { stage })?
            .unwrap_or_default())
    }

    async fn save_state(
        &self,
        record_id: RecordId,
        state: &SyncState,
        stage: &'static str,
    ) -> SyncResult<()> {
        self.ledger
            .save_sync_state(record_id, state)
            .await
            .context(StorageSnafu { stage })
    }

    /// Starts the fixed-interval loop. The first pass runs one interval from now.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> PeriodicSync {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(error) = self.sync_now().await {
                            tracing::warn!(%error, "periodic sync pass failed");
                        }
                    }
                }
            }
            tracing::debug!("periodic sync stopped");
        });

        PeriodicSync {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }
}

/// Handle to the background sync loop; stopping waits for an in-flight pass.
pub struct PeriodicSync {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicSync {
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take()
            && let Err(error) = handle.await
        {
            tracing::warn!(%error, "periodic sync task ended abnormally");
        }
    }
}

impl Drop for PeriodicSync {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
