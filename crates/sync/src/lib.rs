pub mod artifacts;
pub mod backoff;
pub mod error;
pub mod http;
pub mod memory;
pub mod queue;
pub mod reconciler;
pub mod remote;

pub use artifacts::{ArtifactManager, OffloadPolicy, OffloadReport};
pub use backoff::BackoffPolicy;
pub use error::{
    ArtifactError, ArtifactResult, RemoteError, RemoteResult, SyncError, SyncResult,
    UnresolvedReason,
};
pub use http::{HttpRemoteConfig, HttpRemoteStore};
pub use memory::{InMemoryRemoteStore, ScriptedFailure};
pub use queue::{FailureDisposition, RetryPolicy, SyncQueue};
pub use reconciler::{
    PeriodicSync, RECORD_CONTENT_TYPE, Reconciler, ReconcilerConfig, SyncReport, record_file_name,
};
pub use remote::{RemoteEntry, RemoteStore, UploadMetadata, UploadReceipt};
