use std::path::PathBuf;

use snafu::Snafu;
use strata_storage::{MessageId, RecordId, StorageError};
use strata_sync::{ArtifactError, RemoteError, SyncError};
use strata_worker::WorkerError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("failed to load config from {path:?} on `{stage}`: {source}"))]
    ExtractConfig {
        stage: &'static str,
        path: PathBuf,
        source: Box<figment::Error>,
    },
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    ConfigDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteConfig {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace config file from {from:?} to {to:?} on `{stage}`: {source}"))]
    RenameConfig {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sync failed on `{stage}`: {source}"))]
    Sync {
        stage: &'static str,
        source: SyncError,
    },
    #[snafu(display("remote store failed on `{stage}`: {source}"))]
    Remote {
        stage: &'static str,
        source: RemoteError,
    },
    #[snafu(display("artifact failed on `{stage}`: {source}"))]
    Artifact {
        stage: &'static str,
        source: ArtifactError,
    },
    #[snafu(display("worker task failed on `{stage}`: {source}"))]
    Worker {
        stage: &'static str,
        source: WorkerError,
    },
    #[snafu(display("record '{record_id}' not found on `{stage}`"))]
    RecordNotFound {
        stage: &'static str,
        record_id: RecordId,
    },
    #[snafu(display("message '{message_id}' not found in record '{record_id}' on `{stage}`"))]
    MessageNotFound {
        stage: &'static str,
        record_id: RecordId,
        message_id: MessageId,
    },
    #[snafu(display(
        "record '{record_id}' already holds a newer copy ({held_last_modified}) on `{stage}`"
    ))]
    StaleWrite {
        stage: &'static str,
        record_id: RecordId,
        held_last_modified: u64,
    },
    #[snafu(display("failed to write export at {path:?} on `{stage}`: {source}"))]
    WriteExport {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("no remote store configured on `{stage}`"))]
    RemoteNotConfigured { stage: &'static str },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse failure bucket used to route user-facing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    CapacityExceeded,
    AuthExpired,
    NetworkError,
    ArtifactUnresolved,
    WorkerTimeout,
    NotFound,
    Configuration,
    Internal,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Storage { source, .. } => storage_class(source),
            Self::Sync { source, .. } => match source {
                SyncError::Storage { source, .. } => storage_class(source),
                SyncError::EncodeUpload { .. } => ErrorClass::Internal,
            },
            Self::Remote { source, .. } => remote_class(source),
            Self::Artifact { source, .. } => match source {
                ArtifactError::Unresolved { .. } | ArtifactError::PayloadStripped { .. } => {
                    ErrorClass::ArtifactUnresolved
                }
                ArtifactError::OffloadUpload { source, .. } => remote_class(source),
                ArtifactError::OffloadLocal { source, .. } => storage_class(source),
            },
            Self::Worker { source, .. } => match source {
                WorkerError::Timeout { .. } => ErrorClass::WorkerTimeout,
                _ => ErrorClass::Internal,
            },
            Self::RecordNotFound { .. } | Self::MessageNotFound { .. } => ErrorClass::NotFound,
            Self::ExtractConfig { .. }
            | Self::ConfigDirectory { .. }
            | Self::SerializeConfig { .. }
            | Self::WriteConfig { .. }
            | Self::RenameConfig { .. }
            | Self::RemoteNotConfigured { .. } => ErrorClass::Configuration,
            Self::StaleWrite { .. } | Self::WriteExport { .. } => ErrorClass::Internal,
        }
    }
}

fn storage_class(error: &StorageError) -> ErrorClass {
    if error.is_capacity() {
        ErrorClass::CapacityExceeded
    } else {
        ErrorClass::Internal
    }
}

fn remote_class(error: &RemoteError) -> ErrorClass {
    if error.is_auth() {
        ErrorClass::AuthExpired
    } else if error.is_transient() {
        ErrorClass::NetworkError
    } else if error.is_not_found() {
        ErrorClass::NotFound
    } else {
        ErrorClass::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_failures_map_to_their_bucket() {
        let exhausted = EngineError::Storage {
            stage: "test",
            source: StorageError::AllTiersExhausted {
                stage: "test",
                record_id: "r".to_string(),
                consecutive: 3,
                attempted: Vec::new(),
                export_path: None,
            },
        };
        let expired = EngineError::Remote {
            stage: "test",
            source: RemoteError::AuthExpired { stage: "test" },
        };
        let timeout = EngineError::Worker {
            stage: "test",
            source: WorkerError::Timeout {
                stage: "test",
                task_id: strata_worker::TaskId(1),
                timeout_ms: 10,
            },
        };

        assert_eq!(exhausted.class(), ErrorClass::CapacityExceeded);
        assert_eq!(expired.class(), ErrorClass::AuthExpired);
        assert_eq!(timeout.class(), ErrorClass::WorkerTimeout);
    }
}
