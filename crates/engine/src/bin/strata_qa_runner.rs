use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};
use strata::{
    ConversationRecord, EngineConfig, EngineError, ErrorClass, EventSink, EventStream, Message,
    MessageRole, Orchestrator, OrchestratorParts, RecordId, StorageEvent,
};
use strata_storage::{JsonFileExporter, ManualClock, MemoryStorage, ReductionPolicy, TieredCache};
use strata_sync::{InMemoryRemoteStore, RemoteStore, record_file_name};
use strata_worker::{
    TaskHandler, TaskOperation, TransformHandler, WorkerPool, WorkerPoolConfig, WorkerResult,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    TierFallback,
    SyncRoundTrip,
    Conflict,
    WorkerFallback,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tier_fallback" => Some(Self::TierFallback),
            "sync_round_trip" => Some(Self::SyncRoundTrip),
            "conflict" => Some(Self::Conflict),
            "worker_fallback" => Some(Self::WorkerFallback),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::TierFallback => "tier_fallback",
            Self::SyncRoundTrip => "sync_round_trip",
            Self::Conflict => "conflict",
            Self::WorkerFallback => "worker_fallback",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("engine call failed on `{stage}`: {source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let work_dir = args
        .work_dir
        .clone()
        .unwrap_or_else(|| env::temp_dir().join(format!("strata-qa-{}", std::process::id())));
    println!("scenario={}", args.scenario.name());
    println!("work_dir={}", work_dir.display());

    match args.scenario {
        Scenario::TierFallback => run_tier_fallback(&work_dir).await?,
        Scenario::SyncRoundTrip => run_sync_round_trip(&work_dir).await?,
        Scenario::Conflict => run_conflict(&work_dir).await?,
        Scenario::WorkerFallback => run_worker_fallback(&work_dir).await?,
        Scenario::All => {
            run_tier_fallback(&work_dir).await?;
            run_sync_round_trip(&work_dir).await?;
            run_conflict(&work_dir).await?;
            run_worker_fallback(&work_dir).await?;
        }
    }

    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut work_dir = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;
                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--work-dir" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-work-dir-value",
                    arg: "--work-dir",
                })?;
                work_dir = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        work_dir,
    })
}

fn scenario_config(work_dir: &Path, scenario: Scenario) -> EngineConfig {
    let root = work_dir.join(scenario.name());
    EngineConfig {
        data_dir: root.join("data"),
        export_dir: root.join("exports"),
        primary_quota_bytes: None,
        ..EngineConfig::default()
    }
}

fn ensure(condition: bool, scenario: Scenario, reason: impl Into<String>) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario: scenario.name(),
        reason: reason.into(),
    }
    .fail()
}

async fn in_memory_orchestrator(
    config: EngineConfig,
    clock: Arc<ManualClock>,
    remote: Arc<InMemoryRemoteStore>,
    events: EventSink,
) -> RunnerResult<Orchestrator> {
    let parts = OrchestratorParts::in_memory(config, clock, events)
        .context(EngineSnafu {
            stage: "runner-assemble-parts",
        })?
        .with_remote(remote);
    Orchestrator::from_parts(parts).await.context(EngineSnafu {
        stage: "runner-open-orchestrator",
    })
}

async fn run_tier_fallback(work_dir: &Path) -> RunnerResult<()> {
    let scenario = Scenario::TierFallback;
    let config = scenario_config(work_dir, scenario);
    let clock = Arc::new(ManualClock::new(1));
    let (sink, mut events) = EventSink::channel();

    // Small quotas: the overflow records fit in no tier, even reduced.
    let primary = Arc::new(MemoryStorage::with_quota("primary", 4_096));
    let cache = TieredCache::standard(
        primary.clone(),
        Arc::new(MemoryStorage::with_quota("secondary", 2_048)),
        Arc::new(MemoryStorage::with_quota("volatile", 2_048)),
        ReductionPolicy::default(),
        Some(Arc::new(JsonFileExporter::new(
            config.export_dir.clone(),
            clock.clone(),
        ))),
        sink.clone(),
    );
    let orchestrator = Orchestrator::from_parts(OrchestratorParts {
        config,
        cache: Arc::new(cache),
        ledger: primary.clone(),
        artifacts: primary,
        remote: None,
        workers: Arc::new(WorkerPool::synchronous(Arc::new(TransformHandler))),
        clock,
        events: sink,
    })
    .await
    .context(EngineSnafu {
        stage: "tier-fallback-open",
    })?;

    let record = orchestrator
        .create_record("bulky")
        .await
        .context(EngineSnafu {
            stage: "tier-fallback-create",
        })?;
    orchestrator
        .append_message(record.id, Message::text(MessageRole::User, "x".repeat(1_500)))
        .await
        .context(EngineSnafu {
            stage: "tier-fallback-append",
        })?;
    let tier = orchestrator.tracked_tier(record.id).await;
    println!(
        "tier_after_first_write={}",
        tier.map_or_else(|| "none".to_string(), |tier| tier.to_string())
    );

    let mut exhausted = 0;
    let mut exported_paths = 0;
    for index in 0..4 {
        let mut bulky = ConversationRecord::new(
            RecordId::new_v7(),
            format!("overflow-{index}"),
            1,
        );
        bulky
            .messages
            .push(Message::text(MessageRole::User, "z".repeat(20_000)));
        match orchestrator.save_record(bulky).await {
            Ok(_) => {}
            Err(error) if error.class() == ErrorClass::CapacityExceeded => {
                exhausted += 1;
                if let EngineError::Storage { source, .. } = &error
                    && source.export_path().is_some()
                {
                    exported_paths += 1;
                }
            }
            Err(error) => {
                return Err(error).context(EngineSnafu {
                    stage: "tier-fallback-overflow",
                });
            }
        }
    }

    let exports = count_events(&mut events, |event| {
        matches!(event, StorageEvent::DatasetExported { .. })
    });
    println!("capacity_exhausted={exhausted}");
    println!("dataset_exports={exports}");
    ensure(exhausted >= 3, scenario, "expected repeated tier exhaustion")?;
    ensure(
        exports == 1 && exported_paths == 1,
        scenario,
        format!("expected exactly one export, saw {exports}"),
    )
}

async fn run_sync_round_trip(work_dir: &Path) -> RunnerResult<()> {
    let scenario = Scenario::SyncRoundTrip;
    let clock = Arc::new(ManualClock::new(100));
    let remote = Arc::new(InMemoryRemoteStore::new());
    let orchestrator = in_memory_orchestrator(
        scenario_config(work_dir, scenario),
        clock.clone(),
        remote.clone(),
        EventSink::disabled(),
    )
    .await?;

    let record = orchestrator
        .create_record("round trip")
        .await
        .context(EngineSnafu {
            stage: "round-trip-create",
        })?;
    let report = orchestrator.sync_now().await.context(EngineSnafu {
        stage: "round-trip-sync",
    })?;
    let listing = remote
        .list("conversations")
        .await
        .map_err(|error| scenario_failure(scenario, error.to_string()))?;

    println!("pushed={}", report.pushed);
    println!("remote_files={}", listing.len());
    ensure(report.pushed == 1, scenario, "expected one upload")?;
    ensure(
        listing
            .first()
            .is_some_and(|entry| entry.name == record_file_name(record.id) && entry.modified_at == 100),
        scenario,
        "remote listing does not show the record at modified_at=100",
    )?;

    let again = orchestrator.sync_now().await.context(EngineSnafu {
        stage: "round-trip-resync",
    })?;
    println!("second_pass_in_sync={}", again.in_sync);
    ensure(
        again.pushed == 0 && again.pulled == 0,
        scenario,
        "second pass should be a no-op",
    )
}

async fn run_conflict(work_dir: &Path) -> RunnerResult<()> {
    let scenario = Scenario::Conflict;
    let clock = Arc::new(ManualClock::new(100));
    let remote = Arc::new(InMemoryRemoteStore::new());
    let (sink, mut events) = EventSink::channel();
    let orchestrator = in_memory_orchestrator(
        scenario_config(work_dir, scenario),
        clock.clone(),
        remote.clone(),
        sink,
    )
    .await?;

    let record = orchestrator
        .create_record("contested")
        .await
        .context(EngineSnafu {
            stage: "conflict-create",
        })?;
    orchestrator.sync_now().await.context(EngineSnafu {
        stage: "conflict-first-sync",
    })?;

    clock.set(150);
    orchestrator
        .append_message(record.id, Message::text(MessageRole::User, "offline edit"))
        .await
        .context(EngineSnafu {
            stage: "conflict-offline-edit",
        })?;

    let mut theirs = record.clone();
    theirs.last_modified = 200;
    theirs
        .messages
        .push(Message::text(MessageRole::Assistant, "remote edit"));
    let body = serde_json::to_vec(&theirs)
        .map_err(|error| scenario_failure(scenario, error.to_string()))?;
    remote.seed("conversations", &record_file_name(record.id), 200, body);

    clock.set(210);
    let report = orchestrator.sync_now().await.context(EngineSnafu {
        stage: "conflict-second-sync",
    })?;
    let local = orchestrator
        .get_record(record.id)
        .await
        .context(EngineSnafu {
            stage: "conflict-read-back",
        })?;
    let pending = orchestrator.pending_sync_count().await;
    let conflicts = count_events(&mut events, |event| {
        matches!(event, StorageEvent::ConflictResolved { .. })
    });

    println!("remote_wins={}", report.remote_wins);
    println!("pending_after_pull={pending}");
    println!("conflict_events={conflicts}");
    ensure(report.remote_wins == 1, scenario, "remote copy should win")?;
    ensure(pending == 0, scenario, "stale queued edit should be discarded")?;
    ensure(
        local.as_ref() == Some(&theirs),
        scenario,
        "local copy was not replaced by the remote copy",
    )
}

/// Transforms whose worker threads never finish warming up.
struct StalledStart;

impl TaskHandler for StalledStart {
    fn warm_up(&self) -> WorkerResult<()> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(())
    }

    fn handle(
        &self,
        operation: TaskOperation,
        data: serde_json::Value,
    ) -> WorkerResult<serde_json::Value> {
        TransformHandler.handle(operation, data)
    }
}

async fn run_worker_fallback(work_dir: &Path) -> RunnerResult<()> {
    let scenario = Scenario::WorkerFallback;
    let config = scenario_config(work_dir, scenario);
    let clock = Arc::new(ManualClock::new(1));
    let (sink, mut events) = EventSink::channel();

    let healthy = in_memory_orchestrator(
        config.clone(),
        clock.clone(),
        Arc::new(InMemoryRemoteStore::new()),
        EventSink::disabled(),
    )
    .await?;
    let record = healthy
        .create_record("stats")
        .await
        .context(EngineSnafu {
            stage: "worker-fallback-create",
        })?;
    let record = healthy
        .append_message(record.id, Message::text(MessageRole::User, "count me"))
        .await
        .context(EngineSnafu {
            stage: "worker-fallback-append",
        })?;
    let expected = healthy.storage_stats().await.context(EngineSnafu {
        stage: "worker-fallback-healthy-stats",
    })?;

    let stalled = WorkerPool::start(
        WorkerPoolConfig {
            startup_window: Duration::from_millis(50),
            ..config.worker_pool_config()
        },
        Arc::new(StalledStart),
        sink,
    )
    .map_err(|error| scenario_failure(scenario, error.to_string()))?;
    let fallback = stalled
        .storage_stats(std::slice::from_ref(&record))
        .await
        .map_err(|error| scenario_failure(scenario, error.to_string()))?;
    let degraded_events = count_events(&mut events, |event| {
        matches!(event, StorageEvent::WorkerPoolDegraded { .. })
    });

    println!("pool_degraded={}", stalled.is_degraded());
    println!("degraded_events={degraded_events}");
    println!("results_identical={}", fallback == expected);
    ensure(stalled.is_degraded(), scenario, "pool should be degraded")?;
    ensure(degraded_events == 1, scenario, "expected one degraded event")?;
    ensure(
        fallback == expected,
        scenario,
        "synchronous result differs from worker result",
    )
}

fn count_events(events: &mut EventStream, predicate: impl Fn(&StorageEvent) -> bool) -> usize {
    events.drain().iter().filter(|event| predicate(event)).count()
}

fn scenario_failure(scenario: Scenario, reason: String) -> RunnerError {
    RunnerError::ScenarioFailed {
        stage: "scenario-step",
        scenario: scenario.name(),
        reason,
    }
}
