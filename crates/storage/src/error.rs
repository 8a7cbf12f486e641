use std::path::PathBuf;

use snafu::Snafu;

use super::tier::TierKind;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("payload encoding '{raw}' is not recognized"))]
    InvalidPayload { stage: &'static str, raw: String },
    #[snafu(display("failed to decode inline payload on `{stage}`: {source}"))]
    DecodeInlinePayload {
        stage: &'static str,
        source: base64::DecodeError,
    },
    #[snafu(display("tier '{tier}' is out of capacity: {details}"))]
    CapacityExceeded {
        stage: &'static str,
        tier: String,
        details: String,
    },
    #[snafu(display("tier '{tier}' is unavailable: {details}"))]
    TierUnavailable {
        stage: &'static str,
        tier: String,
        details: String,
    },
    #[snafu(display(
        "every local tier refused record '{record_id}' ({consecutive} consecutive exhaustions)"
    ))]
    AllTiersExhausted {
        stage: &'static str,
        record_id: String,
        consecutive: u32,
        attempted: Vec<TierKind>,
        export_path: Option<PathBuf>,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to encode record '{record_id}' on `{stage}`: {source}"))]
    EncodeRecord {
        stage: &'static str,
        record_id: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode stored record on `{stage}`: {source}"))]
    DecodeRecord {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("memory tier lock was poisoned at {stage}"))]
    LockPoisoned { stage: &'static str },
    #[snafu(display("failed to write export file at {path:?} on `{stage}`: {source}"))]
    WriteExport {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to encode export document on `{stage}`: {source}"))]
    EncodeExport {
        stage: &'static str,
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Failures that send the write path on to the next tier.
    pub fn is_fallthrough(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::TierUnavailable { .. }
        )
    }

    pub fn export_path(&self) -> Option<&PathBuf> {
        match self {
            Self::AllTiersExhausted { export_path, .. } => export_path.as_ref(),
            _ => None,
        }
    }

    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::AllTiersExhausted { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
