pub mod cache;
pub mod clock;
pub mod error;
pub mod events;
pub mod export;
pub mod ids;
pub mod memory;
pub mod reduce;
pub mod sqlite;
pub mod tier;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use cache::{PutOutcome, TierSlot, TieredCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StorageError, StorageResult};
pub use events::{ConflictWinner, EventSink, EventStream, StorageEvent};
pub use export::{DatasetExporter, ExportDocument, JsonFileExporter};
pub use ids::{ArtifactId, MessageId, RecordId};
pub use memory::MemoryStorage;
pub use reduce::{ReductionPolicy, reduce_record};
pub use sqlite::SqliteStorage;
pub use tier::{CapacityClass, Durability, TierCapability, TierKind};
pub use types::{
    ArtifactReference, ArtifactStoreKind, ContentKind, ContentPart, ConversationRecord,
    DEFAULT_RECORD_TITLE, MediaPart, Message, MessageContent, MessageRole, Payload,
    SyncOperation, SyncQueueEntry, SyncState,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One local backend in the tier chain.
///
/// `put` must either persist the whole record or fail with
/// [`StorageError::CapacityExceeded`] / [`StorageError::TierUnavailable`] so the
/// cache can move on to the next tier.
pub trait StorageTier: Send + Sync {
    fn name(&self) -> &str;
    fn capability(&self) -> TierCapability;
    fn put<'a>(&'a self, record: &'a ConversationRecord) -> BoxFuture<'a, StorageResult<()>>;
    fn get<'a>(
        &'a self,
        record_id: RecordId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>>;
    fn list<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>>;
    fn delete<'a>(&'a self, record_id: RecordId) -> BoxFuture<'a, StorageResult<bool>>;
}

/// Durable home of the sync queue and per-record sync state collections.
pub trait SyncLedger: Send + Sync {
    fn load_queue<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SyncQueueEntry>>>;
    fn save_queue_entry<'a>(&'a self, entry: &'a SyncQueueEntry)
    -> BoxFuture<'a, StorageResult<()>>;
    fn remove_queue_entry<'a>(&'a self, record_id: RecordId) -> BoxFuture<'a, StorageResult<()>>;
    fn load_sync_state<'a>(
        &'a self,
        record_id: RecordId,
    ) -> BoxFuture<'a, StorageResult<Option<SyncState>>>;
    fn save_sync_state<'a>(
        &'a self,
        record_id: RecordId,
        state: &'a SyncState,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn remove_sync_state<'a>(&'a self, record_id: RecordId) -> BoxFuture<'a, StorageResult<()>>;
}

/// Local blob collection backing `local:` artifact references.
pub trait ArtifactCollection: Send + Sync {
    fn put_artifact<'a>(
        &'a self,
        artifact_id: &'a str,
        content_type: &'a str,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn get_artifact<'a>(
        &'a self,
        artifact_id: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Vec<u8>>>>;
    fn delete_artifact<'a>(&'a self, artifact_id: &'a str) -> BoxFuture<'a, StorageResult<bool>>;
}
