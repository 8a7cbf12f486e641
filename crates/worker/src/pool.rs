use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc as std_mpsc};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::ResultExt;
use strata_storage::{ConversationRecord, EventSink, ReductionPolicy, StorageEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::error::{
    DecodeTaskSnafu, DisconnectedSnafu, EncodeTaskSnafu, SpawnWorkerSnafu, TaskFailedSnafu,
    TimeoutSnafu, WorkerResult,
};
use crate::protocol::{TaskId, TaskOperation, WorkerMessage, WorkerRequest, WorkerResponse};
use crate::transforms::{
    ExportRequest, ReduceRequest, RenderedExport, StorageStats, TaskHandler, TransformHandler,
};

pub const DEFAULT_WORKER_COUNT: usize = 2;
pub const DEFAULT_STARTUP_WINDOW: Duration = Duration::from_secs(3);
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DEGRADE_AFTER_TIMEOUTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub startup_window: Duration,
    pub task_timeout: Duration,
    pub degrade_after_timeouts: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            startup_window: DEFAULT_STARTUP_WINDOW,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            degrade_after_timeouts: DEFAULT_DEGRADE_AFTER_TIMEOUTS,
        }
    }
}

type PendingTasks = Arc<Mutex<HashMap<TaskId, oneshot::Sender<WorkerResponse>>>>;

/// Fixed set of worker threads for CPU-bound transforms.
///
/// The pool is an optimization: any timeout or channel failure falls back to
/// running the same [`TaskHandler`] on the caller. Once degraded (a worker
/// missed the startup window, or too many consecutive timeouts) every later
/// task runs synchronously and the worker threads are released.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: WorkerPoolConfig,
    handler: Arc<dyn TaskHandler>,
    senders: Mutex<Vec<std_mpsc::Sender<WorkerRequest>>>,
    pending: PendingTasks,
    ready: watch::Receiver<usize>,
    started_at: Instant,
    degraded: AtomicBool,
    consecutive_timeouts: AtomicU32,
    next_task: AtomicU64,
    next_worker: AtomicUsize,
    events: EventSink,
}

impl WorkerPool {
    /// Spawns the worker threads. Must be called from within a tokio runtime.
    pub fn start(
        config: WorkerPoolConfig,
        handler: Arc<dyn TaskHandler>,
        events: EventSink,
    ) -> WorkerResult<Self> {
        let (message_tx, message_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let (ready_tx, ready_rx) = watch::channel(0usize);
        let pending: PendingTasks = Arc::new(Mutex::new(HashMap::new()));

        let mut senders = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let (request_tx, request_rx) = std_mpsc::channel::<WorkerRequest>();
            let handler = handler.clone();
            let message_tx = message_tx.clone();
            std::thread::Builder::new()
                .name(format!("strata-worker-{index}"))
                .spawn(move || run_worker(index, handler, request_rx, message_tx))
                .context(SpawnWorkerSnafu {
                    stage: "worker-pool-spawn",
                    index,
                })?;
            senders.push(request_tx);
        }
        drop(message_tx);

        tokio::spawn(route_messages(message_rx, ready_tx, pending.clone()));

        let inner = Arc::new(PoolInner {
            config,
            handler,
            senders: Mutex::new(senders),
            pending,
            ready: ready_rx,
            started_at: Instant::now(),
            degraded: AtomicBool::new(config.worker_count == 0),
            consecutive_timeouts: AtomicU32::new(0),
            next_task: AtomicU64::new(1),
            next_worker: AtomicUsize::new(0),
            events,
        });

        let watchdog = inner.clone();
        tokio::spawn(async move {
            watchdog.await_ready().await;
        });

        tracing::info!(workers = config.worker_count, "worker pool started");
        Ok(Self { inner })
    }

    pub fn with_transforms(config: WorkerPoolConfig, events: EventSink) -> WorkerResult<Self> {
        Self::start(config, Arc::new(TransformHandler), events)
    }

    /// Pool with no threads: every task runs on the caller.
    pub fn synchronous(handler: Arc<dyn TaskHandler>) -> Self {
        let (_, ready) = watch::channel(0usize);
        Self {
            inner: Arc::new(PoolInner {
                config: WorkerPoolConfig {
                    worker_count: 0,
                    ..WorkerPoolConfig::default()
                },
                handler,
                senders: Mutex::new(Vec::new()),
                pending: Arc::new(Mutex::new(HashMap::new())),
                ready,
                started_at: Instant::now(),
                degraded: AtomicBool::new(true),
                consecutive_timeouts: AtomicU32::new(0),
                next_task: AtomicU64::new(1),
                next_worker: AtomicUsize::new(0),
                events: EventSink::disabled(),
            }),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    pub fn ready_workers(&self) -> usize {
        *self.inner.ready.borrow()
    }

    /// Waits for every worker to report ready, degrading the pool if the
    /// startup window closes first.
    pub async fn wait_ready(&self) -> bool {
        self.inner.await_ready().await
    }

    /// Runs a task on a worker, or synchronously when the worker path is
    /// unavailable. Both paths produce the same result for the same input.
    pub async fn execute(&self, operation: TaskOperation, data: Value) -> WorkerResult<Value> {
        if self.inner.await_ready().await {
            match self.dispatch(operation, data.clone()).await {
                Err(error) if error.is_fallback() => {
                    tracing::warn!(%operation, %error, "worker path failed; running task synchronously");
                }
                result => return result,
            }
        }
        self.run_inline(operation, data)
    }

    pub fn run_inline(&self, operation: TaskOperation, data: Value) -> WorkerResult<Value> {
        tracing::debug!(%operation, "running task synchronously");
        self.inner.handler.handle(operation, data)
    }

    /// Sends one task to a worker and waits for its response or timeout.
    ///
    /// A response arriving after the timeout is dropped by the router.
    pub async fn dispatch(&self, operation: TaskOperation, data: Value) -> WorkerResult<Value> {
        let inner = &self.inner;
        let id = TaskId(inner.next_task.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        lock(&inner.pending).insert(id, tx);

        if !inner.send(WorkerRequest {
            id,
            operation,
            data,
        }) {
            lock(&inner.pending).remove(&id);
            return DisconnectedSnafu {
                stage: "worker-dispatch-send",
            }
            .fail();
        }

        let timeout = inner.config.task_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                inner.consecutive_timeouts.store(0, Ordering::SeqCst);
                response_into_result(operation, response)
            }
            Ok(Err(_)) => DisconnectedSnafu {
                stage: "worker-dispatch-response",
            }
            .fail(),
            Err(_) => {
                lock(&inner.pending).remove(&id);
                let timeouts = inner.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(task_id = %id, %operation, timeouts, "worker task timed out");
                if timeouts >= inner.config.degrade_after_timeouts {
                    inner.degrade(format!("{timeouts} consecutive worker task timeouts"));
                }
                TimeoutSnafu {
                    stage: "worker-dispatch-timeout",
                    task_id: id,
                    timeout_ms: timeout.as_millis() as u64,
                }
                .fail()
            }
        }
    }

    pub async fn reduce_records(
        &self,
        records: Vec<ConversationRecord>,
        policy: ReductionPolicy,
    ) -> WorkerResult<Vec<ConversationRecord>> {
        self.typed(
            TaskOperation::ReduceRecords,
            &ReduceRequest { policy, records },
        )
        .await
    }

    pub async fn storage_stats(&self, records: &[ConversationRecord]) -> WorkerResult<StorageStats> {
        self.typed(TaskOperation::StorageStats, records).await
    }

    pub async fn render_export(&self, request: ExportRequest) -> WorkerResult<RenderedExport> {
        self.typed(TaskOperation::ExportDocument, &request).await
    }

    async fn typed<I, O>(&self, operation: TaskOperation, input: &I) -> WorkerResult<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let data = serde_json::to_value(input).context(EncodeTaskSnafu {
            stage: "worker-typed-encode",
            operation,
        })?;
        let output = self.execute(operation, data).await?;
        serde_json::from_value(output).context(DecodeTaskSnafu {
            stage: "worker-typed-decode",
            operation,
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner.release_workers();
    }
}

impl PoolInner {
    async fn await_ready(&self) -> bool {
        if self.degraded.load(Ordering::SeqCst) {
            return false;
        }
        let expected = self.config.worker_count;
        let mut ready = self.ready.clone();
        let deadline = self.started_at + self.config.startup_window;
        let reached = tokio::time::timeout_at(deadline, ready.wait_for(|count| *count >= expected))
            .await
            .map(|waited| waited.is_ok())
            .unwrap_or(false);

        if !reached {
            let count = *self.ready.borrow();
            self.degrade(format!(
                "{count} of {expected} workers ready after {}ms",
                self.config.startup_window.as_millis()
            ));
        }
        reached && !self.degraded.load(Ordering::SeqCst)
    }

    fn send(&self, request: WorkerRequest) -> bool {
        let senders = lock(&self.senders);
        if senders.is_empty() {
            return false;
        }
        let index = self.next_worker.fetch_add(1, Ordering::SeqCst) % senders.len();
        let Some(sender) = senders.get(index) else {
            return false;
        };
        sender.send(request).is_ok()
    }

    fn degrade(&self, reason: String) {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(%reason, "worker pool degraded; tasks will run synchronously");
        self.release_workers();
        self.events.emit(StorageEvent::WorkerPoolDegraded { reason });
    }

    fn release_workers(&self) {
        lock(&self.senders).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn response_into_result(operation: TaskOperation, response: WorkerResponse) -> WorkerResult<Value> {
    if response.success {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let message = response
        .error
        .unwrap_or_else(|| "worker reported failure without details".to_string());
    TaskFailedSnafu {
        stage: "worker-response",
        operation,
        message,
    }
    .fail()
}

fn run_worker(
    index: usize,
    handler: Arc<dyn TaskHandler>,
    requests: std_mpsc::Receiver<WorkerRequest>,
    messages: mpsc::UnboundedSender<WorkerMessage>,
) {
    if let Err(error) = handler.warm_up() {
        tracing::warn!(worker = index, %error, "worker failed to warm up");
        return;
    }
    if messages.send(WorkerMessage::Ready { worker: index }).is_err() {
        return;
    }

    while let Ok(request) = requests.recv() {
        let response = match handler.handle(request.operation, request.data) {
            Ok(data) => WorkerResponse::ok(request.id, data),
            Err(error) => WorkerResponse::failed(request.id, error.to_string()),
        };
        if messages.send(WorkerMessage::Response(response)).is_err() {
            break;
        }
    }
    tracing::debug!(worker = index, "worker thread exiting");
}

async fn route_messages(
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    ready: watch::Sender<usize>,
    pending: PendingTasks,
) {
    while let Some(message) = messages.recv().await {
        match message {
            WorkerMessage::Ready { worker } => {
                tracing::debug!(worker, "worker ready");
                ready.send_modify(|count| *count += 1);
            }
            WorkerMessage::Response(response) => {
                let waiter = lock(&pending).remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => {
                        tracing::debug!(task_id = %response.id, "ignoring late worker response");
                    }
                }
            }
        }
    }
}
