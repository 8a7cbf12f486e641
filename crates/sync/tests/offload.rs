use std::sync::Arc;

use strata_storage::{
    ArtifactReference, ContentKind, ConversationRecord, ManualClock, MediaPart, MemoryStorage,
    Message, MessageContent, MessageRole, Payload, RecordId,
};
use strata_sync::{
    ArtifactError, ArtifactManager, InMemoryRemoteStore, OffloadPolicy, RemoteStore,
    UnresolvedReason,
};

const THRESHOLD: u64 = 1_024;

fn manager(remote: Arc<InMemoryRemoteStore>) -> ArtifactManager {
    ArtifactManager::new(
        OffloadPolicy {
            image_threshold_bytes: THRESHOLD,
            ..OffloadPolicy::default()
        },
        Some((remote, "artifacts".to_string())),
        Arc::new(MemoryStorage::new("artifacts")),
        Arc::new(ManualClock::new(10)),
    )
}

fn record_with_image(size: u64) -> ConversationRecord {
    let mut record = ConversationRecord::new(RecordId::new_v7(), "images", 1);
    record.messages.push(Message::new(
        MessageRole::User,
        MessageContent::Parts(vec![
            MediaPart::inline(ContentKind::Image, "image/png", vec![9; size as usize]).into_part(),
        ]),
    ));
    record
}

fn first_payload(record: &ConversationRecord) -> Payload {
    record
        .media_parts()
        .next()
        .map(|part| part.payload.clone())
        .expect("media part")
}

#[tokio::test]
async fn byte_threshold_boundary_keeps_exact_size_inline() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let manager = manager(remote.clone());

    for (size, offloaded) in [(THRESHOLD - 1, false), (THRESHOLD, false), (THRESHOLD + 1, true)] {
        let mut record = record_with_image(size);
        let report = manager.offload_record(&mut record).await;

        assert_eq!(report.offloaded == 1, offloaded, "size {size}");
        let payload = first_payload(&record);
        assert_eq!(payload.reference().is_some(), offloaded, "size {size}");
        assert_eq!(
            record.media_parts().next().map(|part| part.size_bytes),
            Some(size)
        );
    }
    assert_eq!(remote.file_count("artifacts"), 1);
}

#[tokio::test]
async fn resolution_is_cached_for_the_session() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let remote_id = remote.seed("artifacts", "photo.png", 1, vec![1, 2, 3]);
    let manager = manager(remote.clone());
    let reference = ArtifactReference::remote(remote_id);

    let first = manager.resolve(&reference).await.expect("first");
    let second = manager.resolve(&reference).await.expect("second");

    assert_eq!(first.as_slice(), &[1, 2, 3]);
    assert_eq!(first, second);
    assert_eq!(remote.download_count(), 1);
}

#[tokio::test]
async fn failed_resolution_reports_reason_and_keeps_reference() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let manager = manager(remote.clone());
    let missing = ArtifactReference::remote("gone");
    let payload = Payload::Reference(missing.clone());

    let error = manager
        .resolve_payload(&payload)
        .await
        .expect_err("missing artifact");
    assert!(matches!(
        error,
        ArtifactError::Unresolved {
            reason: UnresolvedReason::Missing,
            ..
        }
    ));
    assert_eq!(payload, Payload::Reference(missing));

    remote.expire_credential();
    let expired = manager
        .resolve(&ArtifactReference::remote("other"))
        .await
        .expect_err("expired");
    assert!(matches!(
        expired,
        ArtifactError::Unresolved {
            reason: UnresolvedReason::AuthExpired,
            ..
        }
    ));
}

#[tokio::test]
async fn upload_failure_keeps_payload_inline() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.expire_credential();
    let manager = manager(remote.clone());
    let mut record = record_with_image(THRESHOLD * 2);

    let report = manager.offload_record(&mut record).await;

    assert_eq!(report.failed, 1);
    assert!(matches!(first_payload(&record), Payload::Inline(_)));
    remote.set_credential(Some("fresh".to_string()));
    assert_eq!(remote.file_count("artifacts"), 0);
}
