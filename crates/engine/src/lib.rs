pub mod config;
pub mod error;
pub mod orchestrator;

pub use config::{ConfigStore, EngineConfig, RemoteSettings, SyncSettings, WorkerSettings};
pub use error::{EngineError, EngineResult, ErrorClass};
pub use orchestrator::{Orchestrator, OrchestratorParts};

pub use strata_storage::{
    ArtifactReference, ContentKind, ContentPart, ConversationRecord, EventSink, EventStream,
    MediaPart, Message, MessageContent, MessageRole, Payload, RecordId, StorageEvent,
};
pub use strata_sync::{SyncReport, UnresolvedReason};
pub use strata_worker::{ExportFormat, RenderedExport, StorageStats};
