use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use strata_storage::{
    ContentPart, ConversationRecord, ExportDocument, MediaPart, MessageContent, MessageRole,
    Payload, ReductionPolicy, reduce_record,
};

use crate::error::{DecodeTaskSnafu, EncodeTaskSnafu, WorkerResult};
use crate::protocol::TaskOperation;

/// Computation run by worker threads and, unchanged, by the synchronous path.
pub trait TaskHandler: Send + Sync + 'static {
    /// Runs on the worker thread before it reports ready.
    fn warm_up(&self) -> WorkerResult<()> {
        Ok(())
    }

    fn handle(&self, operation: TaskOperation, data: Value) -> WorkerResult<Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransformHandler;

impl TaskHandler for TransformHandler {
    fn handle(&self, operation: TaskOperation, data: Value) -> WorkerResult<Value> {
        execute(operation, data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceRequest {
    pub policy: ReductionPolicy,
    pub records: Vec<ConversationRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub record_count: usize,
    pub message_count: usize,
    pub serialized_bytes: u64,
    pub inline_artifact_bytes: u64,
    pub referenced_artifacts: usize,
    pub stripped_payloads: usize,
    pub reduced_records: usize,
    pub pinned_records: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub exported_at: u64,
    pub records: Vec<ConversationRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedExport {
    pub format: ExportFormat,
    pub file_name: String,
    pub body: String,
}

pub fn execute(operation: TaskOperation, data: Value) -> WorkerResult<Value> {
    match operation {
        TaskOperation::ReduceRecords => {
            let request: ReduceRequest = decode(operation, data)?;
            encode(operation, &reduce_records(&request.records, &request.policy))
        }
        TaskOperation::StorageStats => {
            let records: Vec<ConversationRecord> = decode(operation, data)?;
            encode(operation, &storage_stats(&records)?)
        }
        TaskOperation::ExportDocument => {
            let request: ExportRequest = decode(operation, data)?;
            encode(operation, &render_export(request)?)
        }
    }
}

pub fn reduce_records(
    records: &[ConversationRecord],
    policy: &ReductionPolicy,
) -> Vec<ConversationRecord> {
    records
        .iter()
        .map(|record| reduce_record(record, policy))
        .collect()
}

pub fn storage_stats(records: &[ConversationRecord]) -> WorkerResult<StorageStats> {
    let mut stats = StorageStats {
        record_count: records.len(),
        ..StorageStats::default()
    };

    for record in records {
        let encoded = serde_json::to_vec(record).context(EncodeTaskSnafu {
            stage: "storage-stats-measure",
            operation: TaskOperation::StorageStats,
        })?;
        stats.serialized_bytes += encoded.len() as u64;
        stats.message_count += record.messages.len();
        stats.reduced_records += usize::from(record.reduced);
        stats.pinned_records += usize::from(record.pinned);

        for part in record.media_parts() {
            match &part.payload {
                Payload::Inline(bytes) => stats.inline_artifact_bytes += bytes.len() as u64,
                Payload::Reference(_) => stats.referenced_artifacts += 1,
                Payload::Stripped { .. } => stats.stripped_payloads += 1,
            }
        }
    }
    Ok(stats)
}

pub fn render_export(request: ExportRequest) -> WorkerResult<RenderedExport> {
    let file_name = format!(
        "strata-export-{}.{}",
        request.exported_at,
        request.format.extension()
    );
    let body = match request.format {
        ExportFormat::Json => {
            let document = ExportDocument::new(request.exported_at, request.records);
            serde_json::to_string_pretty(&document).context(EncodeTaskSnafu {
                stage: "export-render-json",
                operation: TaskOperation::ExportDocument,
            })?
        }
        ExportFormat::Markdown => render_markdown(&request.records),
    };

    Ok(RenderedExport {
        format: request.format,
        file_name,
        body,
    })
}

fn render_markdown(records: &[ConversationRecord]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&format!("# {}\n\n", record.title));
        if !record.system_prompt.is_empty() {
            out.push_str(&format!("> {}\n\n", record.system_prompt));
        }
        for message in &record.messages {
            let role = match message.role {
                MessageRole::System => "System",
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
            };
            out.push_str(&format!("**{role}**: "));
            match &message.content {
                MessageContent::Text(text) => out.push_str(text),
                MessageContent::Parts(parts) => {
                    let rendered: Vec<String> = parts.iter().map(render_part).collect();
                    out.push_str(&rendered.join(" "));
                }
            }
            if message.truncated {
                out.push_str(" _(truncated)_");
            }
            out.push_str("\n\n");
        }
    }
    out
}

fn render_part(part: &ContentPart) -> String {
    match part {
        ContentPart::Text { text } => text.clone(),
        ContentPart::Image(media) => render_media("image", media),
        ContentPart::Audio(media) => render_media("audio", media),
        ContentPart::File(media) => render_media("file", media),
    }
}

fn render_media(label: &str, media: &MediaPart) -> String {
    let name = media.file_name.as_deref().unwrap_or(&media.content_type);
    match &media.payload {
        Payload::Inline(_) => format!("[{label}: {name}, {} bytes]", media.size_bytes),
        Payload::Reference(reference) => format!("[{label}: {name}, {reference}]"),
        Payload::Stripped { original_bytes } => {
            format!("[{label}: {name}, {original_bytes} bytes removed]")
        }
    }
}

fn decode<T: DeserializeOwned>(operation: TaskOperation, data: Value) -> WorkerResult<T> {
    serde_json::from_value(data).context(DecodeTaskSnafu {
        stage: "task-decode-input",
        operation,
    })
}

fn encode<T: Serialize>(operation: TaskOperation, value: &T) -> WorkerResult<Value> {
    serde_json::to_value(value).context(EncodeTaskSnafu {
        stage: "task-encode-output",
        operation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_storage::{ArtifactReference, ContentKind, Message, RecordId};

    fn sample() -> ConversationRecord {
        let mut record = ConversationRecord::new(RecordId::new_v7(), "holiday", 5);
        record.pinned = true;
        record
            .messages
            .push(Message::text(MessageRole::User, "plan the trip"));
        let mut remote = MediaPart::inline(ContentKind::Image, "image/png", vec![0; 8]);
        remote.payload = Payload::Reference(ArtifactReference::remote("r-1"));
        record.messages.push(Message::new(
            MessageRole::Assistant,
            MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "here".to_string(),
                },
                MediaPart::inline(ContentKind::File, "text/plain", vec![1; 32])
                    .with_file_name("notes.txt")
                    .into_part(),
                remote.into_part(),
            ]),
        ));
        record
    }

    #[test]
    fn stats_count_payload_shapes() {
        let stats = storage_stats(&[sample()]).expect("stats");

        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.inline_artifact_bytes, 32);
        assert_eq!(stats.referenced_artifacts, 1);
        assert_eq!(stats.stripped_payloads, 0);
        assert_eq!(stats.pinned_records, 1);
        assert!(stats.serialized_bytes > 0);
    }

    #[test]
    fn markdown_export_describes_attachments() {
        let rendered = render_export(ExportRequest {
            format: ExportFormat::Markdown,
            exported_at: 9,
            records: vec![sample()],
        })
        .expect("render");

        assert_eq!(rendered.file_name, "strata-export-9.md");
        assert!(rendered.body.starts_with("# holiday\n"));
        assert!(rendered.body.contains("**User**: plan the trip"));
        assert!(rendered.body.contains("[file: notes.txt, 32 bytes]"));
        assert!(rendered.body.contains("[image: image/png, remote:r-1]"));
    }

    #[test]
    fn json_export_matches_dataset_layout() {
        let record = sample();
        let rendered = render_export(ExportRequest {
            format: ExportFormat::Json,
            exported_at: 9,
            records: vec![record.clone()],
        })
        .expect("render");

        let document: ExportDocument = serde_json::from_str(&rendered.body).expect("decode");
        assert_eq!(document, ExportDocument::new(9, vec![record]));
    }

    #[test]
    fn malformed_input_is_a_decode_error() {
        let error = execute(TaskOperation::StorageStats, Value::String("nope".into()))
            .expect_err("bad input");
        assert!(matches!(error, crate::WorkerError::DecodeTask { .. }));
    }
}
