use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use strata_storage::{
    ArtifactCollection, ArtifactId, ArtifactReference, ArtifactStoreKind, Clock, ContentKind,
    ConversationRecord, MediaPart, Payload,
};
use tokio::sync::RwLock;

use crate::error::{
    ArtifactResult, OffloadLocalSnafu, OffloadUploadSnafu, PayloadStrippedSnafu, UnresolvedReason,
    UnresolvedSnafu,
};
use crate::remote::{RemoteStore, UploadMetadata};

pub const DEFAULT_IMAGE_THRESHOLD_BYTES: u64 = 500 * 1024;
pub const DEFAULT_AUDIO_THRESHOLD_BYTES: u64 = 25 * 1024;
pub const DEFAULT_FILE_THRESHOLD_BYTES: u64 = 100 * 1024;
pub const DEFAULT_AUDIO_DURATION_THRESHOLD_MS: u64 = 30_000;

/// Inline-versus-reference thresholds. A value exactly at a threshold stays
/// inline; only strictly larger payloads are offloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadPolicy {
    pub image_threshold_bytes: u64,
    pub audio_threshold_bytes: u64,
    pub file_threshold_bytes: u64,
    pub audio_duration_threshold_ms: u64,
}

impl Default for OffloadPolicy {
    fn default() -> Self {
        Self {
            image_threshold_bytes: DEFAULT_IMAGE_THRESHOLD_BYTES,
            audio_threshold_bytes: DEFAULT_AUDIO_THRESHOLD_BYTES,
            file_threshold_bytes: DEFAULT_FILE_THRESHOLD_BYTES,
            audio_duration_threshold_ms: DEFAULT_AUDIO_DURATION_THRESHOLD_MS,
        }
    }
}

impl OffloadPolicy {
    pub fn byte_threshold(&self, kind: ContentKind) -> u64 {
        match kind {
            ContentKind::Image => self.image_threshold_bytes,
            ContentKind::Audio => self.audio_threshold_bytes,
            ContentKind::File => self.file_threshold_bytes,
        }
    }

    pub fn should_offload(&self, kind: ContentKind, size_bytes: u64, duration_ms: Option<u64>) -> bool {
        if size_bytes > self.byte_threshold(kind) {
            return true;
        }
        kind == ContentKind::Audio
            && duration_ms.is_some_and(|duration| duration > self.audio_duration_threshold_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffloadReport {
    pub offloaded: usize,
    pub kept_inline: usize,
    /// Uploads that failed; those payloads stay inline.
    pub failed: usize,
    /// References written by this pass, in record order.
    pub created: Vec<ArtifactReference>,
}

/// Offloads large payloads out of records and resolves references on demand.
///
/// Offloaded payloads go to the remote artifact folder when a remote store is
/// configured, otherwise to the local artifact collection. Resolved bytes are
/// cached for the session; persisted records only ever hold the reference.
pub struct ArtifactManager {
    policy: OffloadPolicy,
    remote: Option<(Arc<dyn RemoteStore>, String)>,
    local: Arc<dyn ArtifactCollection>,
    clock: Arc<dyn Clock>,
    resolved: RwLock<HashMap<ArtifactReference, Arc<Vec<u8>>>>,
}

impl ArtifactManager {
    pub fn new(
        policy: OffloadPolicy,
        remote: Option<(Arc<dyn RemoteStore>, String)>,
        local: Arc<dyn ArtifactCollection>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            remote,
            local,
            clock,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &OffloadPolicy {
        &self.policy
    }

    /// Replaces every inline payload over its threshold with a reference.
    pub async fn offload_record(&self, record: &mut ConversationRecord) -> OffloadReport {
        let mut report = OffloadReport::default();
        let record_id = record.id;

        for part in record.media_parts_mut() {
            let Payload::Inline(bytes) = &part.payload else {
                continue;
            };
            let size_bytes = bytes.len() as u64;
            if !self
                .policy
                .should_offload(part.kind, size_bytes, part.duration_ms)
            {
                report.kept_inline += 1;
                continue;
            }

            let bytes = bytes.clone();
            match self.store_payload(part, &bytes).await {
                Ok(reference) => {
                    tracing::debug!(record_id = %record_id, %reference, size_bytes, "offloaded payload");
                    part.size_bytes = size_bytes;
                    part.payload = Payload::Reference(reference.clone());
                    self.resolved
                        .write()
                        .await
                        .insert(reference.clone(), Arc::new(bytes));
                    report.offloaded += 1;
                    report.created.push(reference);
                }
                Err(error) => {
                    tracing::warn!(record_id = %record_id, size_bytes, %error, "offload failed; keeping payload inline");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn store_payload(
        &self,
        part: &MediaPart,
        bytes: &[u8],
    ) -> ArtifactResult<ArtifactReference> {
        let artifact_id = ArtifactId::new_v7().to_string();
        match &self.remote {
            Some((store, folder)) => {
                let file_name = part
                    .file_name
                    .clone()
                    .map_or_else(|| artifact_id.clone(), |name| format!("{artifact_id}-{name}"));
                let receipt = store
                    .upload(
                        bytes.to_vec(),
                        UploadMetadata {
                            folder: folder.clone(),
                            file_name,
                            content_type: part.content_type.clone(),
                            modified_at: self.clock.now_millis(),
                            replace: None,
                        },
                    )
                    .await
                    .context(OffloadUploadSnafu {
                        stage: "artifact-offload-upload",
                    })?;
                Ok(ArtifactReference::remote(receipt.id))
            }
            None => {
                self.local
                    .put_artifact(&artifact_id, &part.content_type, bytes)
                    .await
                    .context(OffloadLocalSnafu {
                        stage: "artifact-offload-local",
                    })?;
                Ok(ArtifactReference::local(artifact_id))
            }
        }
    }

    /// Deletes artifacts that no stored record points at, such as the uploads
    /// of a write the tiers then refused. Failures are logged and skipped.
    pub async fn release(&self, references: &[ArtifactReference]) -> usize {
        let mut released = 0;
        for reference in references {
            self.resolved.write().await.remove(reference);
            let outcome = match reference.store {
                ArtifactStoreKind::Remote => match self.remote.as_ref() {
                    Some((store, _)) => store
                        .delete(&reference.id)
                        .await
                        .map(|()| true)
                        .map_err(|error| error.to_string()),
                    None => Ok(false),
                },
                ArtifactStoreKind::Local => self
                    .local
                    .delete_artifact(&reference.id)
                    .await
                    .map_err(|error| error.to_string()),
            };
            match outcome {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(%reference, %error, "failed to release orphaned artifact");
                }
            }
        }
        released
    }

    /// Fetches the bytes behind a reference, at most once per session.
    pub async fn resolve(&self, reference: &ArtifactReference) -> ArtifactResult<Arc<Vec<u8>>> {
        if let Some(bytes) = self.resolved.read().await.get(reference) {
            return Ok(bytes.clone());
        }

        let bytes = match reference.store {
            ArtifactStoreKind::Remote => self.fetch_remote(reference).await?,
            ArtifactStoreKind::Local => self.fetch_local(reference).await?,
        };
        let bytes = Arc::new(bytes);
        self.resolved
            .write()
            .await
            .insert(reference.clone(), bytes.clone());
        Ok(bytes)
    }

    pub async fn resolve_payload(&self, payload: &Payload) -> ArtifactResult<Arc<Vec<u8>>> {
        match payload {
            Payload::Inline(bytes) => Ok(Arc::new(bytes.clone())),
            Payload::Reference(reference) => self.resolve(reference).await,
            Payload::Stripped { original_bytes } => PayloadStrippedSnafu {
                stage: "artifact-resolve-stripped",
                original_bytes: *original_bytes,
            }
            .fail(),
        }
    }

    pub async fn cached_count(&self) -> usize {
        self.resolved.read().await.len()
    }

    async fn fetch_remote(&self, reference: &ArtifactReference) -> ArtifactResult<Vec<u8>> {
        let Some((store, _)) = self.remote.as_ref() else {
            return UnresolvedSnafu {
                stage: "artifact-resolve-remote",
                reference: reference.clone(),
                reason: UnresolvedReason::NoRemoteConfigured,
            }
            .fail();
        };

        store.download(&reference.id).await.map_err(|error| {
            let reason = if error.is_not_found() {
                UnresolvedReason::Missing
            } else if error.is_auth() {
                UnresolvedReason::AuthExpired
            } else {
                UnresolvedReason::Network(error.to_string())
            };
            tracing::warn!(%reference, %reason, "artifact resolution failed");
            UnresolvedSnafu {
                stage: "artifact-resolve-remote-download",
                reference: reference.clone(),
                reason,
            }
            .build()
        })
    }

    async fn fetch_local(&self, reference: &ArtifactReference) -> ArtifactResult<Vec<u8>> {
        let reason = match self.local.get_artifact(&reference.id).await {
            Ok(Some(bytes)) => return Ok(bytes),
            Ok(None) => UnresolvedReason::Missing,
            Err(error) => UnresolvedReason::LocalStore(error.to_string()),
        };
        UnresolvedSnafu {
            stage: "artifact-resolve-local",
            reference: reference.clone(),
            reason,
        }
        .fail()
    }
}
