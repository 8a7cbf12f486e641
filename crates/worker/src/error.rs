use snafu::Snafu;

use crate::protocol::{TaskId, TaskOperation};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WorkerError {
    #[snafu(display("failed to decode {operation} input on `{stage}`: {source}"))]
    DecodeTask {
        stage: &'static str,
        operation: TaskOperation,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode {operation} output on `{stage}`: {source}"))]
    EncodeTask {
        stage: &'static str,
        operation: TaskOperation,
        source: serde_json::Error,
    },
    #[snafu(display("{operation} failed on `{stage}`: {message}"))]
    TaskFailed {
        stage: &'static str,
        operation: TaskOperation,
        message: String,
    },
    #[snafu(display("task {task_id} exceeded {timeout_ms}ms on `{stage}`"))]
    Timeout {
        stage: &'static str,
        task_id: TaskId,
        timeout_ms: u64,
    },
    #[snafu(display("worker channel closed on `{stage}`"))]
    Disconnected { stage: &'static str },
    #[snafu(display("failed to spawn worker thread {index} on `{stage}`: {source}"))]
    SpawnWorker {
        stage: &'static str,
        index: usize,
        source: std::io::Error,
    },
}

impl WorkerError {
    /// Failures of the worker path itself, where the synchronous path still applies.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Disconnected { .. })
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
