use std::path::PathBuf;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt};
use strata_storage::{
    ArtifactCollection, Clock, ConversationRecord, DEFAULT_RECORD_TITLE, EventSink,
    JsonFileExporter, MemoryStorage, Message, MessageContent, MessageId, Payload, PutOutcome,
    RecordId, SqliteStorage, StorageTier, SyncLedger, SyncOperation, SyncQueueEntry, SystemClock,
    TierKind, TieredCache,
};
use strata_sync::{
    ArtifactManager, HttpRemoteStore, PeriodicSync, Reconciler, RemoteStore, SyncQueue,
    SyncReport,
};
use strata_worker::{ExportFormat, ExportRequest, RenderedExport, StorageStats, WorkerPool};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::{
    ArtifactSnafu, EngineResult, MessageNotFoundSnafu, RecordNotFoundSnafu,
    RemoteNotConfiguredSnafu, RemoteSnafu, StaleWriteSnafu, StorageSnafu, SyncSnafu,
    WorkerSnafu, WriteExportSnafu,
};

/// Collaborators the orchestrator is assembled from.
pub struct OrchestratorParts {
    pub config: EngineConfig,
    pub cache: Arc<TieredCache>,
    pub ledger: Arc<dyn SyncLedger>,
    pub artifacts: Arc<dyn ArtifactCollection>,
    pub remote: Option<Arc<dyn RemoteStore>>,
    pub workers: Arc<WorkerPool>,
    pub clock: Arc<dyn Clock>,
    pub events: EventSink,
}

impl OrchestratorParts {
    /// SQLite primary and secondary tiers under `config.data_dir`, plus the
    /// HTTP remote when `remote.base_url` is set.
    pub async fn sqlite(config: EngineConfig, events: EventSink) -> EngineResult<Self> {
        let primary_path = config.primary_database_path();
        let secondary_path = config.secondary_database_path();
        let primary = Arc::new(
            SqliteStorage::open(
                "primary",
                &primary_path.to_string_lossy(),
                config.primary_quota_bytes,
            )
            .await
            .context(StorageSnafu {
                stage: "orchestrator-open-primary",
            })?,
        );
        let secondary = Arc::new(
            SqliteStorage::open("secondary", &secondary_path.to_string_lossy(), None)
                .await
                .context(StorageSnafu {
                    stage: "orchestrator-open-secondary",
                })?,
        );

        let remote = match config.http_remote_config() {
            Some(remote_config) => {
                let store = HttpRemoteStore::new(remote_config).context(RemoteSnafu {
                    stage: "orchestrator-open-remote",
                })?;
                Some(Arc::new(store) as Arc<dyn RemoteStore>)
            }
            None => None,
        };

        Self::assemble(
            config,
            primary,
            secondary,
            remote,
            Arc::new(SystemClock),
            events,
        )
    }

    /// Memory-backed tiers; the primary honors `primary_quota_bytes`.
    pub fn in_memory(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> EngineResult<Self> {
        let primary = Arc::new(match config.primary_quota_bytes {
            Some(quota) => MemoryStorage::with_quota("primary", quota),
            None => MemoryStorage::new("primary"),
        });
        let secondary = Arc::new(MemoryStorage::new("secondary"));
        Self::assemble(config, primary, secondary, None, clock, events)
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    fn assemble<P>(
        config: EngineConfig,
        primary: Arc<P>,
        secondary: Arc<dyn StorageTier>,
        remote: Option<Arc<dyn RemoteStore>>,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> EngineResult<Self>
    where
        P: StorageTier + SyncLedger + ArtifactCollection + 'static,
    {
        let exporter = JsonFileExporter::new(config.export_dir.clone(), clock.clone());
        let cache = TieredCache::standard(
            primary.clone(),
            secondary,
            Arc::new(MemoryStorage::new("volatile")),
            config.reduction,
            Some(Arc::new(exporter)),
            events.clone(),
        );
        let workers = WorkerPool::with_transforms(config.worker_pool_config(), events.clone())
            .context(WorkerSnafu {
                stage: "orchestrator-start-workers",
            })?;

        Ok(Self {
            config,
            cache: Arc::new(cache),
            ledger: primary.clone(),
            artifacts: primary,
            remote,
            workers: Arc::new(workers),
            clock,
            events,
        })
    }
}

/// Single entry point for record mutations, sync and background transforms.
///
/// Every local write is stamped, offloaded, stored in the tier chain and
/// enqueued for the remote, in that order. Writes are serialized so the
/// strictly increasing `last_modified` per record holds.
pub struct Orchestrator {
    config: EngineConfig,
    cache: Arc<TieredCache>,
    queue: Arc<SyncQueue>,
    remote: Option<Arc<dyn RemoteStore>>,
    reconciler: Option<Arc<Reconciler>>,
    artifacts: ArtifactManager,
    workers: Arc<WorkerPool>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
    periodic: Mutex<Option<PeriodicSync>>,
}

impl Orchestrator {
    pub async fn open(config: EngineConfig, events: EventSink) -> EngineResult<Self> {
        Self::from_parts(OrchestratorParts::sqlite(config, events).await?).await
    }

    pub async fn from_parts(parts: OrchestratorParts) -> EngineResult<Self> {
        let OrchestratorParts {
            config,
            cache,
            ledger,
            artifacts,
            remote,
            workers,
            clock,
            events,
        } = parts;

        let tracked = cache.rebuild_index().await.context(StorageSnafu {
            stage: "orchestrator-rebuild-index",
        })?;
        let queue = Arc::new(
            SyncQueue::open(ledger.clone(), config.retry_policy())
                .await
                .context(SyncSnafu {
                    stage: "orchestrator-open-queue",
                })?,
        );

        let reconciler = remote.as_ref().map(|remote| {
            Arc::new(Reconciler::new(
                cache.clone(),
                queue.clone(),
                ledger.clone(),
                remote.clone(),
                clock.clone(),
                events.clone(),
                config.reconciler_config(),
            ))
        });
        let artifact_remote = remote
            .as_ref()
            .map(|remote| (remote.clone(), config.sync.artifacts_folder.clone()));
        let artifacts =
            ArtifactManager::new(config.offload, artifact_remote, artifacts, clock.clone());

        tracing::info!(
            tracked,
            remote = remote.is_some(),
            tiers = ?cache.tier_kinds(),
            "storage orchestrator ready"
        );
        Ok(Self {
            config,
            cache,
            queue,
            remote,
            reconciler,
            artifacts,
            workers,
            clock,
            write_lock: Mutex::new(()),
            periodic: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn create_record(&self, title: &str) -> EngineResult<ConversationRecord> {
        let record = ConversationRecord::new(RecordId::new_v7(), title, self.clock.now_millis());
        self.save_record(record).await
    }

    /// Stores a full record and queues it for upload. Returns the stamped copy.
    pub async fn save_record(
        &self,
        mut record: ConversationRecord,
    ) -> EngineResult<ConversationRecord> {
        let _guard = self.write_lock.lock().await;
        self.persist(&mut record).await?;
        Ok(record)
    }

    pub async fn append_message(
        &self,
        record_id: RecordId,
        message: Message,
    ) -> EngineResult<ConversationRecord> {
        self.update_record(record_id, "orchestrator-append-message", |record| {
            record.messages.push(message);
            Ok(())
        })
        .await
    }

    pub async fn edit_message(
        &self,
        record_id: RecordId,
        message_id: MessageId,
        content: MessageContent,
    ) -> EngineResult<ConversationRecord> {
        self.update_record(record_id, "orchestrator-edit-message", |record| {
            let message = record
                .messages
                .iter_mut()
                .find(|message| message.id == message_id)
                .context(MessageNotFoundSnafu {
                    stage: "orchestrator-edit-message-find",
                    record_id,
                    message_id,
                })?;
            message.content = content;
            message.truncated = false;
            Ok(())
        })
        .await
    }

    pub async fn rename_record(
        &self,
        record_id: RecordId,
        title: &str,
    ) -> EngineResult<ConversationRecord> {
        let title = match title.trim() {
            "" => DEFAULT_RECORD_TITLE.to_string(),
            trimmed => trimmed.to_string(),
        };
        self.update_record(record_id, "orchestrator-rename", |record| {
            record.title = title;
            Ok(())
        })
        .await
    }

    pub async fn set_pinned(
        &self,
        record_id: RecordId,
        pinned: bool,
    ) -> EngineResult<ConversationRecord> {
        self.update_record(record_id, "orchestrator-set-pinned", |record| {
            record.pinned = pinned;
            Ok(())
        })
        .await
    }

    pub async fn set_system_prompt(
        &self,
        record_id: RecordId,
        system_prompt: &str,
    ) -> EngineResult<ConversationRecord> {
        self.update_record(record_id, "orchestrator-set-system-prompt", |record| {
            record.system_prompt = system_prompt.to_string();
            Ok(())
        })
        .await
    }

    pub async fn get_record(
        &self,
        record_id: RecordId,
    ) -> EngineResult<Option<ConversationRecord>> {
        self.cache.get(record_id).await.context(StorageSnafu {
            stage: "orchestrator-get",
        })
    }

    /// Pinned records first, then most recently modified.
    pub async fn list_records(&self) -> EngineResult<Vec<ConversationRecord>> {
        let mut records = self.cache.list().await.context(StorageSnafu {
            stage: "orchestrator-list",
        })?;
        records.sort_by(|left, right| {
            right
                .pinned
                .cmp(&left.pinned)
                .then(right.last_modified.cmp(&left.last_modified))
        });
        Ok(records)
    }

    pub async fn delete_record(&self, record_id: RecordId) -> EngineResult<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.cache.delete(record_id).await.context(StorageSnafu {
            stage: "orchestrator-delete",
        })?;
        if removed {
            self.queue
                .enqueue(record_id, SyncOperation::Delete, self.clock.now_millis())
                .await
                .context(SyncSnafu {
                    stage: "orchestrator-delete-enqueue",
                })?;
        }
        Ok(removed)
    }

    pub async fn tracked_tier(&self, record_id: RecordId) -> Option<TierKind> {
        self.cache.tracked_tier(record_id).await
    }

    pub async fn resolve_artifact(&self, payload: &Payload) -> EngineResult<Arc<Vec<u8>>> {
        self.artifacts
            .resolve_payload(payload)
            .await
            .context(ArtifactSnafu {
                stage: "orchestrator-resolve-artifact",
            })
    }

    pub async fn sync_now(&self) -> EngineResult<SyncReport> {
        let reconciler = self.reconciler()?;
        reconciler.sync_now().await.context(SyncSnafu {
            stage: "orchestrator-sync-now",
        })
    }

    /// Starts the periodic sync loop if it is not running yet.
    pub async fn start_periodic_sync(&self) -> EngineResult<()> {
        let reconciler = self.reconciler()?.clone();
        let mut periodic = self.periodic.lock().await;
        if periodic.is_none() {
            *periodic = Some(reconciler.spawn_periodic(self.config.sync_interval()));
            tracing::info!(
                interval_secs = self.config.sync.interval_secs,
                "periodic sync started"
            );
        }
        Ok(())
    }

    pub async fn stop_periodic_sync(&self) {
        let running = self.periodic.lock().await.take();
        if let Some(running) = running {
            running.stop().await;
            tracing::info!("periodic sync stopped");
        }
    }

    /// Hands a fresh bearer credential to the remote and resumes a paused sync.
    pub fn set_credential(&self, credential: Option<String>) -> EngineResult<()> {
        let remote = self.remote.as_ref().context(RemoteNotConfiguredSnafu {
            stage: "orchestrator-set-credential",
        })?;
        let has_credential = credential.is_some();
        remote.set_credential(credential);
        if has_credential && let Some(reconciler) = self.reconciler.as_ref() {
            reconciler.resume();
        }
        Ok(())
    }

    pub fn is_sync_paused(&self) -> bool {
        self.reconciler
            .as_ref()
            .is_some_and(|reconciler| reconciler.is_paused())
    }

    pub async fn retry_parked(&self) -> EngineResult<usize> {
        self.queue
            .retry_parked(self.clock.now_millis())
            .await
            .context(SyncSnafu {
                stage: "orchestrator-retry-parked",
            })
    }

    pub async fn pending_sync_count(&self) -> usize {
        self.queue.len().await
    }

    pub async fn parked_entries(&self) -> Vec<SyncQueueEntry> {
        self.queue.parked().await
    }

    pub async fn storage_stats(&self) -> EngineResult<StorageStats> {
        let records = self.list_records().await?;
        self.workers
            .storage_stats(&records)
            .await
            .context(WorkerSnafu {
                stage: "orchestrator-storage-stats",
            })
    }

    pub async fn export_document(&self, format: ExportFormat) -> EngineResult<RenderedExport> {
        let records = self.list_records().await?;
        self.workers
            .render_export(ExportRequest {
                format,
                exported_at: self.clock.now_millis(),
                records,
            })
            .await
            .context(WorkerSnafu {
                stage: "orchestrator-export-document",
            })
    }

    /// Renders an export and writes it into `export_dir`.
    pub async fn export_to_file(&self, format: ExportFormat) -> EngineResult<PathBuf> {
        let rendered = self.export_document(format).await?;
        let directory = self.config.export_dir.clone();
        tokio::fs::create_dir_all(&directory)
            .await
            .context(WriteExportSnafu {
                stage: "orchestrator-export-create-directory",
                path: directory.clone(),
            })?;
        let path = directory.join(&rendered.file_name);
        tokio::fs::write(&path, rendered.body)
            .await
            .context(WriteExportSnafu {
                stage: "orchestrator-export-write",
                path: path.clone(),
            })?;
        tracing::info!(?path, "wrote export document");
        Ok(path)
    }

    /// Reduced copies of every record, as the fallback tiers would store them.
    pub async fn reduced_snapshot(&self) -> EngineResult<Vec<ConversationRecord>> {
        let records = self.list_records().await?;
        self.workers
            .reduce_records(records, self.config.reduction)
            .await
            .context(WorkerSnafu {
                stage: "orchestrator-reduced-snapshot",
            })
    }

    pub fn is_worker_pool_degraded(&self) -> bool {
        self.workers.is_degraded()
    }

    pub async fn shutdown(&self) {
        self.stop_periodic_sync().await;
    }

    fn reconciler(&self) -> EngineResult<&Arc<Reconciler>> {
        self.reconciler.as_ref().context(RemoteNotConfiguredSnafu {
            stage: "orchestrator-reconciler",
        })
    }

    async fn update_record<F>(
        &self,
        record_id: RecordId,
        stage: &'static str,
        apply: F,
    ) -> EngineResult<ConversationRecord>
    where
        F: FnOnce(&mut ConversationRecord) -> EngineResult<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .cache
            .get(record_id)
            .await
            .context(StorageSnafu { stage })?
            .context(RecordNotFoundSnafu { stage, record_id })?;
        apply(&mut record)?;
        self.persist(&mut record).await?;
        Ok(record)
    }

    // Callers hold `write_lock`.
    async fn persist(&self, record: &mut ConversationRecord) -> EngineResult<()> {
        let previous = self.cache.get(record.id).await.context(StorageSnafu {
            stage: "orchestrator-persist-previous",
        })?;
        let now = self.clock.now_millis();
        record.last_modified =
            previous.map_or(now, |previous| now.max(previous.last_modified + 1));
        // The flag describes the stored copy; the reducing tier sets it again
        // if this write does not fit whole.
        record.reduced = false;

        let offload = self.artifacts.offload_record(record).await;
        if offload.failed > 0 {
            tracing::warn!(
                record_id = %record.id,
                failed = offload.failed,
                "some payloads stayed inline"
            );
        }

        let stored = match self.cache.put(record).await {
            Ok(PutOutcome::Stored { tier, reduced }) => {
                tracing::debug!(record_id = %record.id, tier = %tier, reduced, "stored record");
                Ok(())
            }
            Ok(PutOutcome::Stale { held_last_modified }) => StaleWriteSnafu {
                stage: "orchestrator-persist-put",
                record_id: record.id,
                held_last_modified,
            }
            .fail(),
            Err(source) => Err(source).context(StorageSnafu {
                stage: "orchestrator-persist-put",
            }),
        };
        if let Err(error) = stored {
            // Nothing stored points at this write's uploads.
            if !offload.created.is_empty() {
                let released = self.artifacts.release(&offload.created).await;
                tracing::debug!(record_id = %record.id, released, "released artifacts of refused write");
            }
            return Err(error);
        }

        self.queue
            .enqueue(record.id, SyncOperation::Upsert, now)
            .await
            .context(SyncSnafu {
                stage: "orchestrator-persist-enqueue",
            })?;
        Ok(())
    }
}
