pub mod error;
pub mod pool;
pub mod protocol;
pub mod transforms;

pub use error::{WorkerError, WorkerResult};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use protocol::{TaskId, TaskOperation, WorkerMessage, WorkerRequest, WorkerResponse};
pub use transforms::{
    ExportFormat, ExportRequest, ReduceRequest, RenderedExport, StorageStats, TaskHandler,
    TransformHandler,
};
