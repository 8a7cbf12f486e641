use std::fmt;

use snafu::Snafu;
use strata_storage::{ArtifactReference, StorageError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RemoteError {
    #[snafu(display("remote credential expired or was rejected on `{stage}`"))]
    AuthExpired { stage: &'static str },
    #[snafu(display("no remote credential configured on `{stage}`"))]
    MissingCredential { stage: &'static str },
    #[snafu(display("remote rate limit persisted after {attempts} attempts on `{stage}`"))]
    RateLimited { stage: &'static str, attempts: u32 },
    #[snafu(display("remote request failed on `{stage}`: {source}"))]
    Network {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to build remote client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("remote responded with HTTP {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("remote object '{remote_id}' was not found on `{stage}`"))]
    NotFound {
        stage: &'static str,
        remote_id: String,
    },
    #[snafu(display("failed to decode remote response on `{stage}`: {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("remote store unavailable on `{stage}`: {details}"))]
    Unavailable {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("remote store lock was poisoned at {stage}"))]
    RemoteLockPoisoned { stage: &'static str },
}

impl RemoteError {
    /// Network-class failures worth another attempt later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::RateLimited { .. } | Self::Unavailable { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired { .. } | Self::MissingCredential { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("local storage failed during sync on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to encode record '{record_id}' for upload on `{stage}`: {source}"))]
    EncodeUpload {
        stage: &'static str,
        record_id: String,
        source: serde_json::Error,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Why an artifact reference could not be turned back into bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    Missing,
    AuthExpired,
    Network(String),
    NoRemoteConfigured,
    LocalStore(String),
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => formatter.write_str("artifact is missing"),
            Self::AuthExpired => formatter.write_str("remote credential expired"),
            Self::Network(details) => write!(formatter, "network failure: {details}"),
            Self::NoRemoteConfigured => formatter.write_str("no remote store configured"),
            Self::LocalStore(details) => write!(formatter, "local artifact store failed: {details}"),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArtifactError {
    #[snafu(display("artifact '{reference}' could not be resolved on `{stage}`: {reason}"))]
    Unresolved {
        stage: &'static str,
        reference: ArtifactReference,
        reason: UnresolvedReason,
    },
    #[snafu(display("failed to upload artifact on `{stage}`: {source}"))]
    OffloadUpload {
        stage: &'static str,
        source: RemoteError,
    },
    #[snafu(display("failed to store artifact locally on `{stage}`: {source}"))]
    OffloadLocal {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("payload was stripped to save space ({original_bytes} bytes) on `{stage}`"))]
    PayloadStripped {
        stage: &'static str,
        original_bytes: u64,
    },
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;
