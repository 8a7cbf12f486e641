use std::path::PathBuf;

use tokio::sync::mpsc;

use super::ids::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    Local,
    Remote,
}

/// User-visible notifications raised by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    CapacityExhausted {
        record_id: RecordId,
        consecutive: u32,
    },
    DatasetExported {
        path: PathBuf,
        record_count: usize,
    },
    ExportFailed {
        reason: String,
    },
    ConflictResolved {
        record_id: RecordId,
        winner: ConflictWinner,
        local_modified: Option<u64>,
        remote_modified: u64,
    },
    PersistentSyncFailure {
        record_id: RecordId,
        attempts: u32,
        last_error: String,
    },
    SyncPaused {
        reason: String,
    },
    SyncResumed,
    WorkerPoolDegraded {
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<StorageEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, EventStream { rx })
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: StorageEvent) {
        let Some(tx) = self.tx.as_ref() else {
            tracing::debug!(?event, "storage event dropped: no subscriber configured");
            return;
        };

        if tx.send(event).is_err() {
            tracing::warn!("storage event stream receiver was dropped");
        }
    }
}

pub struct EventStream {
    rx: mpsc::UnboundedReceiver<StorageEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StorageEvent> {
        self.rx.try_recv().ok()
    }

    /// Returns every event already queued without waiting.
    pub fn drain(&mut self) -> Vec<StorageEvent> {
        let mut drained = Vec::new();
        while let Some(event) = self.try_recv() {
            drained.push(event);
        }
        drained
    }
}
