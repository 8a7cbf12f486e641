use std::path::Path;
use std::sync::Arc;

use strata::{
    ContentKind, ConversationRecord, EngineConfig, EngineError, ErrorClass, EventSink,
    ExportFormat, MediaPart, Message, MessageContent, MessageRole, Orchestrator,
    OrchestratorParts, Payload, StorageEvent,
};
use strata_storage::{
    ConflictWinner, JsonFileExporter, ManualClock, MemoryStorage, MessageId, ReductionPolicy,
    TierKind, TieredCache,
};
use strata_sync::{InMemoryRemoteStore, RemoteStore, record_file_name};
use strata_worker::{TransformHandler, WorkerPool};

fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig {
        data_dir: dir.join("data"),
        export_dir: dir.join("exports"),
        primary_quota_bytes: None,
        ..EngineConfig::default()
    };
    config.workers.startup_window_ms = 5_000;
    config
}

async fn in_memory(
    config: EngineConfig,
    clock: Arc<ManualClock>,
    remote: Option<Arc<InMemoryRemoteStore>>,
    events: EventSink,
) -> Orchestrator {
    let mut parts = OrchestratorParts::in_memory(config, clock, events).expect("parts");
    if let Some(remote) = remote {
        parts = parts.with_remote(remote);
    }
    Orchestrator::from_parts(parts).await.expect("orchestrator")
}

#[tokio::test]
async fn offline_edit_loses_to_newer_remote_copy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(100));
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (sink, mut events) = EventSink::channel();
    let orchestrator = in_memory(test_config(dir.path()), clock.clone(), Some(remote.clone()), sink).await;

    let record = orchestrator.create_record("trip").await.expect("create");
    assert_eq!(record.last_modified, 100);
    let first = orchestrator.sync_now().await.expect("first sync");
    assert_eq!(first.pushed, 1);
    let listing = remote.list("conversations").await.expect("listing");
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].modified_at, 100);

    clock.set(150);
    let offline = orchestrator
        .append_message(record.id, Message::text(MessageRole::User, "offline edit"))
        .await
        .expect("offline edit");
    assert_eq!(offline.last_modified, 150);
    assert_eq!(orchestrator.pending_sync_count().await, 1);

    let mut theirs = record.clone();
    theirs.last_modified = 200;
    theirs
        .messages
        .push(Message::text(MessageRole::Assistant, "written elsewhere"));
    remote.seed(
        "conversations",
        &record_file_name(record.id),
        200,
        serde_json::to_vec(&theirs).expect("encode"),
    );

    clock.set(210);
    let second = orchestrator.sync_now().await.expect("second sync");

    assert_eq!(second.remote_wins, 1);
    assert_eq!(second.pushed, 0);
    assert_eq!(orchestrator.pending_sync_count().await, 0);
    assert_eq!(
        orchestrator.get_record(record.id).await.expect("get"),
        Some(theirs)
    );
    assert!(events.drain().contains(&StorageEvent::ConflictResolved {
        record_id: record.id,
        winner: ConflictWinner::Remote,
        local_modified: Some(150),
        remote_modified: 200,
    }));
}

#[tokio::test]
async fn writes_are_stamped_strictly_increasing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(500));
    let orchestrator = in_memory(test_config(dir.path()), clock, None, EventSink::disabled()).await;

    let record = orchestrator.create_record("  ").await.expect("create");
    let renamed = orchestrator
        .rename_record(record.id, "groceries")
        .await
        .expect("rename");
    let pinned = orchestrator
        .set_pinned(record.id, true)
        .await
        .expect("pin");

    assert_eq!(record.title, "New Conversation");
    assert_eq!(record.last_modified, 500);
    assert_eq!(renamed.last_modified, 501);
    assert_eq!(pinned.last_modified, 502);
    assert_eq!(pinned.title, "groceries");
}

#[tokio::test]
async fn oversized_record_falls_back_to_reduced_primary_copy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.primary_quota_bytes = Some(12_000);
    let orchestrator = in_memory(
        config,
        Arc::new(ManualClock::new(10)),
        None,
        EventSink::disabled(),
    )
    .await;

    let record = orchestrator.create_record("long").await.expect("create");
    let updated = orchestrator
        .append_message(record.id, Message::text(MessageRole::User, "y".repeat(20_000)))
        .await
        .expect("append");

    assert_eq!(
        orchestrator.tracked_tier(record.id).await,
        Some(TierKind::PrimaryReduced)
    );
    let stored = orchestrator
        .get_record(record.id)
        .await
        .expect("get")
        .expect("stored");
    assert!(stored.reduced);
    assert!(stored.messages[0].truncated);
    assert_eq!(stored.last_modified, updated.last_modified);
}

#[tokio::test]
async fn edit_after_reduced_readback_syncs_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(InMemoryRemoteStore::new());
    let mut config = test_config(dir.path());
    config.primary_quota_bytes = Some(12_000);
    let orchestrator = in_memory(
        config,
        Arc::new(ManualClock::new(10)),
        Some(remote.clone()),
        EventSink::disabled(),
    )
    .await;

    let record = orchestrator.create_record("long").await.expect("create");
    assert_eq!(orchestrator.sync_now().await.expect("first sync").pushed, 1);
    orchestrator
        .append_message(record.id, Message::text(MessageRole::User, "y".repeat(20_000)))
        .await
        .expect("append");
    let held_back = orchestrator.sync_now().await.expect("reduced sync");
    assert_eq!(held_back.parked, 1);

    let renamed = orchestrator
        .rename_record(record.id, "trimmed")
        .await
        .expect("rename");

    assert_eq!(
        orchestrator.tracked_tier(record.id).await,
        Some(TierKind::Primary)
    );
    let stored = orchestrator
        .get_record(record.id)
        .await
        .expect("get")
        .expect("stored");
    assert!(!stored.reduced);
    let resumed = orchestrator.sync_now().await.expect("resumed sync");
    assert_eq!(resumed.pushed, 1);
    assert_eq!(resumed.parked, 0);
    assert!(orchestrator.parked_entries().await.is_empty());
    assert_eq!(orchestrator.pending_sync_count().await, 0);
    let listing = remote.list("conversations").await.expect("listing");
    assert_eq!(listing[0].modified_at, renamed.last_modified);
}

#[tokio::test]
async fn repeated_exhaustion_exports_the_dataset_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1));
    let (sink, mut events) = EventSink::channel();
    let primary = Arc::new(MemoryStorage::with_quota("primary", 10));
    let cache = TieredCache::standard(
        primary.clone(),
        Arc::new(MemoryStorage::with_quota("secondary", 10)),
        Arc::new(MemoryStorage::with_quota("volatile", 10)),
        ReductionPolicy::default(),
        Some(Arc::new(JsonFileExporter::new(dir.path(), clock.clone()))),
        sink.clone(),
    );
    let orchestrator = Orchestrator::from_parts(OrchestratorParts {
        config: test_config(dir.path()),
        cache: Arc::new(cache),
        ledger: primary.clone(),
        artifacts: primary,
        remote: None,
        workers: Arc::new(WorkerPool::synchronous(Arc::new(TransformHandler))),
        clock,
        events: sink,
    })
    .await
    .expect("orchestrator");

    let mut export_paths = Vec::new();
    for _ in 0..5 {
        let error = orchestrator
            .create_record("does not fit")
            .await
            .expect_err("every tier is full");
        assert_eq!(error.class(), ErrorClass::CapacityExceeded);
        if let EngineError::Storage { source, .. } = &error
            && let Some(path) = source.export_path()
        {
            export_paths.push(path.to_path_buf());
        }
    }

    assert_eq!(export_paths.len(), 1);
    assert!(export_paths[0].exists());
    let exported = events
        .drain()
        .into_iter()
        .filter(|event| matches!(event, StorageEvent::DatasetExported { .. }))
        .count();
    assert_eq!(exported, 1);
}

#[tokio::test]
async fn large_image_is_offloaded_and_resolved_on_demand() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(InMemoryRemoteStore::new());
    let mut config = test_config(dir.path());
    config.offload.image_threshold_bytes = 1_024;
    let orchestrator = in_memory(
        config,
        Arc::new(ManualClock::new(10)),
        Some(remote.clone()),
        EventSink::disabled(),
    )
    .await;

    let record = orchestrator.create_record("photos").await.expect("create");
    let image = vec![42u8; 4_096];
    let saved = orchestrator
        .append_message(
            record.id,
            Message::new(
                MessageRole::User,
                MessageContent::Parts(vec![
                    MediaPart::inline(ContentKind::Image, "image/jpeg", image.clone()).into_part(),
                ]),
            ),
        )
        .await
        .expect("append");

    let payload = saved
        .media_parts()
        .next()
        .map(|part| part.payload.clone())
        .expect("media part");
    assert!(matches!(payload, Payload::Reference(_)));
    assert_eq!(remote.file_count("artifacts"), 1);

    let resolved = orchestrator
        .resolve_artifact(&payload)
        .await
        .expect("resolve");
    assert_eq!(resolved.as_slice(), image.as_slice());
    let stored = orchestrator
        .get_record(record.id)
        .await
        .expect("get")
        .expect("stored");
    assert_eq!(stored.media_parts().next().map(|part| &part.payload), Some(&payload));
}

#[tokio::test]
async fn refused_write_releases_its_uploaded_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1));
    let remote = Arc::new(InMemoryRemoteStore::new());
    let primary = Arc::new(MemoryStorage::with_quota("primary", 10));
    let cache = TieredCache::standard(
        primary.clone(),
        Arc::new(MemoryStorage::with_quota("secondary", 10)),
        Arc::new(MemoryStorage::with_quota("volatile", 10)),
        ReductionPolicy::default(),
        None,
        EventSink::disabled(),
    );
    let mut config = test_config(dir.path());
    config.offload.image_threshold_bytes = 1_024;
    let orchestrator = Orchestrator::from_parts(OrchestratorParts {
        config,
        cache: Arc::new(cache),
        ledger: primary.clone(),
        artifacts: primary,
        remote: Some(remote.clone()),
        workers: Arc::new(WorkerPool::synchronous(Arc::new(TransformHandler))),
        clock,
        events: EventSink::disabled(),
    })
    .await
    .expect("orchestrator");

    let mut record = ConversationRecord::new(strata::RecordId::new_v7(), "photos", 1);
    record.messages.push(Message::new(
        MessageRole::User,
        MessageContent::Parts(vec![
            MediaPart::inline(ContentKind::Image, "image/jpeg", vec![7u8; 4_096]).into_part(),
        ]),
    ));

    let error = orchestrator
        .save_record(record)
        .await
        .expect_err("every tier is full");

    assert_eq!(error.class(), ErrorClass::CapacityExceeded);
    assert_eq!(remote.upload_count(), 1);
    assert_eq!(remote.file_count("artifacts"), 0);
    assert_eq!(orchestrator.pending_sync_count().await, 0);
}

#[tokio::test]
async fn missing_message_is_a_not_found_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = in_memory(
        test_config(dir.path()),
        Arc::new(ManualClock::new(1)),
        None,
        EventSink::disabled(),
    )
    .await;
    let record = orchestrator.create_record("edits").await.expect("create");

    let error = orchestrator
        .edit_message(
            record.id,
            MessageId::new_v7(),
            MessageContent::Text("changed".to_string()),
        )
        .await
        .expect_err("unknown message");

    assert_eq!(error.class(), ErrorClass::NotFound);
    let no_remote = orchestrator.sync_now().await.expect_err("no remote");
    assert_eq!(no_remote.class(), ErrorClass::Configuration);
}

#[tokio::test]
async fn credential_rotation_resumes_paused_sync() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(InMemoryRemoteStore::new());
    let orchestrator = in_memory(
        test_config(dir.path()),
        Arc::new(ManualClock::new(1)),
        Some(remote.clone()),
        EventSink::disabled(),
    )
    .await;
    orchestrator.create_record("auth").await.expect("create");
    remote.expire_credential();

    let paused = orchestrator.sync_now().await.expect("paused pass");
    assert!(paused.paused);
    assert!(orchestrator.is_sync_paused());

    orchestrator
        .set_credential(Some("rotated".to_string()))
        .expect("set credential");
    assert!(!orchestrator.is_sync_paused());
    let resumed = orchestrator.sync_now().await.expect("resumed pass");
    assert_eq!(resumed.pushed, 1);
}

#[tokio::test]
async fn worker_backed_views_cover_every_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = in_memory(
        test_config(dir.path()),
        Arc::new(ManualClock::new(1)),
        None,
        EventSink::disabled(),
    )
    .await;
    for title in ["alpha", "beta"] {
        let record = orchestrator.create_record(title).await.expect("create");
        orchestrator
            .append_message(record.id, Message::text(MessageRole::User, format!("hello {title}")))
            .await
            .expect("append");
    }

    let stats = orchestrator.storage_stats().await.expect("stats");
    assert_eq!(stats.record_count, 2);
    assert_eq!(stats.message_count, 2);

    let markdown = orchestrator
        .export_document(ExportFormat::Markdown)
        .await
        .expect("export");
    assert!(markdown.body.contains("# alpha"));
    assert!(markdown.body.contains("**User**: hello beta"));

    let path = orchestrator
        .export_to_file(ExportFormat::Json)
        .await
        .expect("export file");
    assert!(path.starts_with(dir.path().join("exports")));
    let written: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).expect("read export")).expect("json");
    assert_eq!(written["record_count"], 2);

    // Nothing in these records exceeds the reduction limits.
    let reduced = orchestrator.reduced_snapshot().await.expect("reduced");
    assert_eq!(reduced, orchestrator.list_records().await.expect("list"));
    assert!(reduced.iter().all(|record| !record.reduced));
    assert!(!orchestrator.is_worker_pool_degraded());
}

#[tokio::test]
async fn sqlite_orchestrator_restores_records_and_queue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());

    let created: ConversationRecord = {
        let orchestrator = Orchestrator::open(config.clone(), EventSink::disabled())
            .await
            .expect("open");
        let record = orchestrator.create_record("durable").await.expect("create");
        orchestrator.shutdown().await;
        record
    };

    let reopened = Orchestrator::open(config, EventSink::disabled())
        .await
        .expect("reopen");
    let records = reopened.list_records().await.expect("list");

    assert_eq!(records, vec![created.clone()]);
    assert_eq!(reopened.pending_sync_count().await, 1);
    assert_eq!(
        reopened.tracked_tier(created.id).await,
        Some(TierKind::Primary)
    );
}
