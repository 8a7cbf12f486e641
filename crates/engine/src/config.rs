use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use strata_storage::ReductionPolicy;
use strata_sync::{BackoffPolicy, HttpRemoteConfig, OffloadPolicy, ReconcilerConfig, RetryPolicy};
use strata_worker::WorkerPoolConfig;

use crate::error::{
    ConfigDirectorySnafu, EngineResult, ExtractConfigSnafu, RenameConfigSnafu,
    SerializeConfigSnafu, WriteConfigSnafu,
};

pub const CONFIG_DIRECTORY_NAME: &str = "strata";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const ENV_PREFIX: &str = "STRATA_";
pub const PRIMARY_DATABASE_FILE_NAME: &str = "primary.db";
pub const SECONDARY_DATABASE_FILE_NAME: &str = "secondary.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub conversations_folder: String,
    pub artifacts_folder: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_attempts: 8,
            retry_base_ms: 1_000,
            retry_cap_ms: 60_000,
            conversations_folder: "conversations".to_string(),
            artifacts_folder: "artifacts".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// No remote sync when unset.
    pub base_url: Option<String>,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub request_timeout_secs: Option<u64>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            request_timeout_secs: Some(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub worker_count: usize,
    pub startup_window_ms: u64,
    pub task_timeout_ms: u64,
    pub degrade_after_timeouts: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: 2,
            startup_window_ms: 3_000,
            task_timeout_ms: 30_000,
            degrade_after_timeouts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub export_dir: PathBuf,
    /// Byte budget of the primary tier; unbounded when unset.
    pub primary_quota_bytes: Option<u64>,
    pub reduction: ReductionPolicy,
    pub sync: SyncSettings,
    pub remote: RemoteSettings,
    pub offload: OffloadPolicy,
    pub workers: WorkerSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".strata"));
        let export_dir = dirs::download_dir().unwrap_or_else(|| data_dir.join("exports"));

        Self {
            data_dir,
            export_dir,
            primary_quota_bytes: Some(50 * 1024 * 1024),
            reduction: ReductionPolicy::default(),
            sync: SyncSettings::default(),
            remote: RemoteSettings::default(),
            offload: OffloadPolicy::default(),
            workers: WorkerSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, then the JSON file, then `STRATA_` environment variables
    /// (`__` separates nested keys, e.g. `STRATA_SYNC__INTERVAL_SECS`).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load_from(path: &Path) -> EngineResult<Self> {
        Self::figment(path)
            .extract::<EngineConfig>()
            .map_err(Box::new)
            .context(ExtractConfigSnafu {
                stage: "config-extract",
                path: path.to_path_buf(),
            })
    }

    pub fn primary_database_path(&self) -> PathBuf {
        self.data_dir.join(PRIMARY_DATABASE_FILE_NAME)
    }

    pub fn secondary_database_path(&self) -> PathBuf {
        self.data_dir.join(SECONDARY_DATABASE_FILE_NAME)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync.max_attempts.max(1),
            backoff: BackoffPolicy {
                base_ms: self.sync.retry_base_ms,
                factor: 2,
                cap_ms: self.sync.retry_cap_ms,
            },
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            conversations_folder: self.sync.conversations_folder.clone(),
        }
    }

    pub fn http_remote_config(&self) -> Option<HttpRemoteConfig> {
        let base_url = self.remote.base_url.as_ref()?.trim();
        if base_url.is_empty() {
            return None;
        }

        Some(HttpRemoteConfig {
            max_retries: self.remote.max_retries,
            backoff: BackoffPolicy {
                base_ms: self.remote.backoff_base_ms,
                factor: 2,
                cap_ms: self.remote.backoff_cap_ms,
            },
            request_timeout: self.remote.request_timeout_secs.map(Duration::from_secs),
            ..HttpRemoteConfig::new(base_url)
        })
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: self.workers.worker_count,
            startup_window: Duration::from_millis(self.workers.startup_window_ms),
            task_timeout: Duration::from_millis(self.workers.task_timeout_ms),
            degrade_after_timeouts: self.workers.degrade_after_timeouts.max(1),
        }
    }
}

/// Live engine configuration backed by a JSON file.
pub struct ConfigStore {
    config: Arc<ArcSwap<EngineConfig>>,
    config_path: PathBuf,
}

impl ConfigStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".strata"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let config = Self::load_from_disk(&config_path);
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, config: EngineConfig) -> EngineResult<()> {
        self.persist(&config)?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> EngineConfig {
        if !path.exists() {
            tracing::info!(?path, "config file not found, using defaults and environment");
        }

        match EngineConfig::load_from(path) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(?path, %error, "failed to load config, using defaults");
                EngineConfig::default()
            }
        }
    }

    fn persist(&self, config: &EngineConfig) -> EngineResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(ConfigDirectorySnafu {
                stage: "config-create-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(config).context(SerializeConfigSnafu {
            stage: "config-serialize",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteConfigSnafu {
            stage: "config-write-temporary",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &self.config_path).context(RenameConfigSnafu {
            stage: "config-rename-temporary",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved engine config");
        Ok(())
    }
}
