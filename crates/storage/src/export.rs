use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{EncodeExportSnafu, StorageResult, WriteExportSnafu};
use super::clock::Clock;
use super::types::ConversationRecord;
use super::BoxFuture;

/// Layout of a full-dataset JSON export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub exported_at: u64,
    pub record_count: usize,
    pub records: Vec<ConversationRecord>,
}

impl ExportDocument {
    pub fn new(exported_at: u64, records: Vec<ConversationRecord>) -> Self {
        Self {
            exported_at,
            record_count: records.len(),
            records,
        }
    }
}

/// Hands the whole dataset to the user when local storage is exhausted.
pub trait DatasetExporter: Send + Sync {
    fn export<'a>(
        &'a self,
        records: &'a [ConversationRecord],
    ) -> BoxFuture<'a, StorageResult<PathBuf>>;
}

pub struct JsonFileExporter {
    directory: PathBuf,
    clock: Arc<dyn Clock>,
}

impl JsonFileExporter {
    pub fn new(directory: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            directory: directory.into(),
            clock,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl DatasetExporter for JsonFileExporter {
    fn export<'a>(
        &'a self,
        records: &'a [ConversationRecord],
    ) -> BoxFuture<'a, StorageResult<PathBuf>> {
        Box::pin(async move {
            let exported_at = self.clock.now_millis();
            let document = ExportDocument::new(exported_at, records.to_vec());
            let body = serde_json::to_vec_pretty(&document).context(EncodeExportSnafu {
                stage: "export-encode",
            })?;

            tokio::fs::create_dir_all(&self.directory)
                .await
                .context(WriteExportSnafu {
                    stage: "export-create-directory",
                    path: self.directory.clone(),
                })?;

            let path = self
                .directory
                .join(format!("strata-export-{exported_at}.json"));
            tokio::fs::write(&path, body)
                .await
                .context(WriteExportSnafu {
                    stage: "export-write-file",
                    path: path.clone(),
                })?;

            Ok(path)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ids::RecordId;

    #[tokio::test]
    async fn export_writes_every_record_to_a_timestamped_file() {
        let directory = tempfile::tempdir().expect("tempdir");
        let exporter = JsonFileExporter::new(directory.path(), Arc::new(ManualClock::new(4_242)));
        let records = vec![
            ConversationRecord::new(RecordId::new_v7(), "first", 1),
            ConversationRecord::new(RecordId::new_v7(), "second", 2),
        ];

        let path = exporter.export(&records).await.expect("export");
        let body = tokio::fs::read(&path).await.expect("read export");
        let document: ExportDocument = serde_json::from_slice(&body).expect("decode export");

        assert!(path.ends_with("strata-export-4242.json"));
        assert_eq!(document.record_count, 2);
        assert_eq!(document.records, records);
    }
}
