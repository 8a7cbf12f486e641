use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CapacityExceededSnafu, CreateSqliteDirectorySnafu, DecodeRecordSnafu, EncodeRecordSnafu,
    InvariantViolationSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::RecordId;
use super::tier::{CapacityClass, Durability, TierCapability};
use super::types::{ConversationRecord, SyncOperation, SyncQueueEntry, SyncState};
use super::{ArtifactCollection, BoxFuture, StorageTier, SyncLedger};

// SQLITE_FULL: the database or disk is full.
const SQLITE_FULL_CODE: &str = "13";

/// SQLite-backed key/value tier.
///
/// Opened with a quota it plays the bounded primary store; opened without one it
/// is the large secondary store. The same database also hosts the sync queue,
/// sync state and local artifact collections.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    name: String,
    quota_bytes: Option<u64>,
}

impl SqliteStorage {
    pub async fn open(
        name: impl Into<String>,
        database_location: &str,
        quota_bytes: Option<u64>,
    ) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps `:memory:` databases alive and
        // serializes writes per database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        let name = name.into();
        tracing::debug!(tier = %name, %database_url, ?quota_bytes, "opened sqlite tier");
        Ok(Self {
            pool,
            name,
            quota_bytes,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn used_bytes(&self) -> StorageResult<u64> {
        let used = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM conversations",
        )
        .fetch_one(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-used-bytes",
        })?;
        i64_to_u64(used, "sqlite-used-bytes-value")
    }

    async fn put_record(&self, record: &ConversationRecord) -> StorageResult<()> {
        let body = serde_json::to_string(record).context(EncodeRecordSnafu {
            stage: "sqlite-put-encode",
            record_id: record.id.to_string(),
        })?;
        let size_bytes = body.len() as u64;

        if let Some(quota_bytes) = self.quota_bytes {
            let used_by_others = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM conversations WHERE id != ?",
            )
            .bind(record.id.to_string())
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-put-quota-usage",
            })?;
            let projected = i64_to_u64(used_by_others, "sqlite-put-quota-value")? + size_bytes;
            if projected > quota_bytes {
                return CapacityExceededSnafu {
                    stage: "sqlite-put-quota",
                    tier: self.name.clone(),
                    details: format!("{projected} bytes would exceed quota of {quota_bytes}"),
                }
                .fail();
            }
        }

        sqlx::query(
            "INSERT INTO conversations (id, body, last_modified, reduced, size_bytes) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET body = excluded.body, last_modified = excluded.last_modified, \
             reduced = excluded.reduced, size_bytes = excluded.size_bytes",
        )
        .bind(record.id.to_string())
        .bind(body)
        .bind(u64_to_i64(record.last_modified, "sqlite-put-last-modified")?)
        .bind(record.reduced)
        .bind(u64_to_i64(size_bytes, "sqlite-put-size")?)
        .execute(&self.pool)
        .await
        .map_err(|source| self.classify_write_error("sqlite-put-upsert", source))?;

        Ok(())
    }

    fn classify_write_error(&self, stage: &'static str, source: sqlx::Error) -> StorageError {
        let disk_full = source
            .as_database_error()
            .and_then(|error| error.code())
            .is_some_and(|code| code == SQLITE_FULL_CODE);
        if disk_full {
            return StorageError::CapacityExceeded {
                stage,
                tier: self.name.clone(),
                details: source.to_string(),
            };
        }
        StorageError::SqliteQuery { stage, source }
    }
}

impl StorageTier for SqliteStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> TierCapability {
        TierCapability {
            capacity: self.quota_bytes.map_or(CapacityClass::Unbounded, |quota_bytes| {
                CapacityClass::Bounded { quota_bytes }
            }),
            durability: Durability::Durable,
        }
    }

    fn put<'a>(&'a self, record: &'a ConversationRecord) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.put_record(record))
    }

    fn get<'a>(
        &'a self,
        record_id: RecordId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let body = sqlx::query_scalar::<_, String>("SELECT body FROM conversations WHERE id = ?")
                .bind(record_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-get-query",
                })?;

            body.map(|body| decode_record(&body, "sqlite-get-decode"))
                .transpose()
        })
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let bodies = sqlx::query_scalar::<_, String>(
                "SELECT body FROM conversations ORDER BY last_modified DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-list-query",
            })?;

            bodies
                .iter()
                .map(|body| decode_record(body, "sqlite-list-decode"))
                .collect()
        })
    }

    fn delete<'a>(&'a self, record_id: RecordId) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(record_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-delete-apply",
                })?;
            Ok(result.rows_affected() > 0)
        })
    }
}

impl SyncLedger for SqliteStorage {
    fn load_queue<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SyncQueueEntry>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, QueueRow>(
                "SELECT record_id, operation, enqueued_at, attempts, next_attempt_at, last_error FROM sync_queue ORDER BY enqueued_at ASC, record_id ASC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "ledger-load-queue",
            })?;

            rows.into_iter().map(queue_row_to_entry).collect()
        })
    }

    fn save_queue_entry<'a>(
        &'a self,
        entry: &'a SyncQueueEntry,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO sync_queue (record_id, operation, enqueued_at, attempts, next_attempt_at, last_error) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(record_id) DO UPDATE SET operation = excluded.operation, enqueued_at = excluded.enqueued_at, \
                 attempts = excluded.attempts, next_attempt_at = excluded.next_attempt_at, last_error = excluded.last_error",
            )
            .bind(entry.record_id.to_string())
            .bind(entry.operation.as_str())
            .bind(u64_to_i64(entry.enqueued_at, "ledger-save-queue-enqueued-at")?)
            .bind(i64::from(entry.attempts))
            .bind(u64_to_i64(entry.next_attempt_at, "ledger-save-queue-next-attempt")?)
            .bind(entry.last_error.clone())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "ledger-save-queue-entry",
            })?;
            Ok(())
        })
    }

    fn remove_queue_entry<'a>(&'a self, record_id: RecordId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM sync_queue WHERE record_id = ?")
                .bind(record_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "ledger-remove-queue-entry",
                })?;
            Ok(())
        })
    }

    fn load_sync_state<'a>(
        &'a self,
        record_id: RecordId,
    ) -> BoxFuture<'a, StorageResult<Option<SyncState>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, SyncStateRow>(
                "SELECT remote_id, last_synced_version, last_known_remote_modified FROM sync_state WHERE record_id = ?",
            )
            .bind(record_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "ledger-load-sync-state",
            })?;

            row.map(sync_state_row_to_state).transpose()
        })
    }

    fn save_sync_state<'a>(
        &'a self,
        record_id: RecordId,
        state: &'a SyncState,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO sync_state (record_id, remote_id, last_synced_version, last_known_remote_modified) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(record_id) DO UPDATE SET remote_id = excluded.remote_id, \
                 last_synced_version = excluded.last_synced_version, last_known_remote_modified = excluded.last_known_remote_modified",
            )
            .bind(record_id.to_string())
            .bind(state.remote_id.clone())
            .bind(
                state
                    .last_synced_version
                    .map(|value| u64_to_i64(value, "ledger-save-synced-version"))
                    .transpose()?,
            )
            .bind(
                state
                    .last_known_remote_modified
                    .map(|value| u64_to_i64(value, "ledger-save-remote-modified"))
                    .transpose()?,
            )
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "ledger-save-sync-state",
            })?;
            Ok(())
        })
    }

    fn remove_sync_state<'a>(&'a self, record_id: RecordId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM sync_state WHERE record_id = ?")
                .bind(record_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "ledger-remove-sync-state",
                })?;
            Ok(())
        })
    }
}

impl ArtifactCollection for SqliteStorage {
    fn put_artifact<'a>(
        &'a self,
        artifact_id: &'a str,
        content_type: &'a str,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO artifacts (id, content_type, bytes, created_at) VALUES (?, ?, ?, strftime('%s', 'now')) \
                 ON CONFLICT(id) DO UPDATE SET content_type = excluded.content_type, bytes = excluded.bytes",
            )
            .bind(artifact_id)
            .bind(content_type)
            .bind(bytes)
            .execute(&self.pool)
            .await
            .map_err(|source| self.classify_write_error("artifact-put", source))?;
            Ok(())
        })
    }

    fn get_artifact<'a>(
        &'a self,
        artifact_id: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Vec<u8>>>> {
        Box::pin(async move {
            sqlx::query_scalar::<_, Vec<u8>>("SELECT bytes FROM artifacts WHERE id = ?")
                .bind(artifact_id)
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "artifact-get",
                })
        })
    }

    fn delete_artifact<'a>(&'a self, artifact_id: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM artifacts WHERE id = ?")
                .bind(artifact_id)
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "artifact-delete",
                })?;
            Ok(result.rows_affected() > 0)
        })
    }
}

#[derive(Debug, FromRow)]
struct QueueRow {
    record_id: String,
    operation: String,
    enqueued_at: i64,
    attempts: i64,
    next_attempt_at: i64,
    last_error: Option<String>,
}

#[derive(Debug, FromRow)]
struct SyncStateRow {
    remote_id: Option<String>,
    last_synced_version: Option<i64>,
    last_known_remote_modified: Option<i64>,
}

fn decode_record(body: &str, stage: &'static str) -> StorageResult<ConversationRecord> {
    serde_json::from_str(body).context(DecodeRecordSnafu { stage })
}

fn queue_row_to_entry(row: QueueRow) -> StorageResult<SyncQueueEntry> {
    Ok(SyncQueueEntry {
        record_id: RecordId::parse(&row.record_id)?,
        operation: operation_from_sql(&row.operation)?,
        enqueued_at: i64_to_u64(row.enqueued_at, "queue-row-enqueued-at")?,
        attempts: row
            .attempts
            .try_into()
            .map_err(|_| StorageError::InvariantViolation {
                stage: "queue-row-attempts",
                details: format!("attempt counter '{}' is out of range", row.attempts),
            })?,
        next_attempt_at: i64_to_u64(row.next_attempt_at, "queue-row-next-attempt")?,
        last_error: row.last_error,
    })
}

fn sync_state_row_to_state(row: SyncStateRow) -> StorageResult<SyncState> {
    Ok(SyncState {
        remote_id: row.remote_id,
        last_synced_version: row
            .last_synced_version
            .map(|value| i64_to_u64(value, "sync-state-row-synced-version"))
            .transpose()?,
        last_known_remote_modified: row
            .last_known_remote_modified
            .map(|value| i64_to_u64(value, "sync-state-row-remote-modified"))
            .transpose()?,
    })
}

fn operation_from_sql(raw: &str) -> StorageResult<SyncOperation> {
    match raw {
        "upsert" => Ok(SyncOperation::Upsert),
        "delete" => Ok(SyncOperation::Delete),
        _ => InvariantViolationSnafu {
            stage: "queue-operation-from-sql",
            details: format!("unknown sync operation '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, MessageRole};

    async fn open_temp(quota_bytes: Option<u64>) -> (tempfile::TempDir, SqliteStorage) {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("tier.db");
        let storage = SqliteStorage::open("primary", &path.display().to_string(), quota_bytes)
            .await
            .expect("open sqlite tier");
        (directory, storage)
    }

    #[tokio::test]
    async fn put_then_get_returns_identical_record() {
        let (_directory, storage) = open_temp(None).await;
        let mut record = ConversationRecord::new(RecordId::new_v7(), "roundtrip", 100);
        record
            .messages
            .push(Message::text(MessageRole::User, "persist me"));

        storage.put(&record).await.expect("put");
        let loaded = storage.get(record.id).await.expect("get");

        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn quota_refuses_growth_with_capacity_error() {
        let (_directory, storage) = open_temp(Some(600)).await;
        let mut record = ConversationRecord::new(RecordId::new_v7(), "bounded", 1);
        storage.put(&record).await.expect("small record fits");

        record
            .messages
            .push(Message::text(MessageRole::Assistant, "x".repeat(1_000)));
        let refused = storage.put(&record).await;

        assert!(matches!(refused, Err(StorageError::CapacityExceeded { .. })));
        let kept = storage.get(record.id).await.expect("get");
        assert_eq!(kept.map(|record| record.messages.len()), Some(0));
    }

    #[tokio::test]
    async fn ledger_round_trips_queue_and_state() {
        let (_directory, storage) = open_temp(None).await;
        let record_id = RecordId::new_v7();
        let mut entry = SyncQueueEntry::new(record_id, SyncOperation::Delete, 42);
        entry.attempts = 3;
        entry.last_error = Some("timeout".to_string());
        let state = SyncState {
            remote_id: Some("file-1".to_string()),
            last_synced_version: Some(40),
            last_known_remote_modified: Some(41),
        };

        storage.save_queue_entry(&entry).await.expect("save entry");
        storage
            .save_sync_state(record_id, &state)
            .await
            .expect("save state");

        assert_eq!(storage.load_queue().await.expect("load queue"), vec![entry]);
        assert_eq!(
            storage.load_sync_state(record_id).await.expect("load state"),
            Some(state)
        );

        storage
            .remove_queue_entry(record_id)
            .await
            .expect("remove entry");
        assert!(storage.load_queue().await.expect("reload queue").is_empty());
    }
}
