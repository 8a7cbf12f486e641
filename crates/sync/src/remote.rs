use serde::{Deserialize, Serialize};
use strata_storage::BoxFuture;

use crate::error::RemoteResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub folder: String,
    pub file_name: String,
    pub content_type: String,
    pub modified_at: u64,
    /// Existing object to overwrite instead of creating a new one.
    pub replace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub id: String,
    pub modified_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub modified_at: u64,
}

/// Authoritative blob store the reconciler and artifact manager push to.
///
/// Every call carries the bearer credential last handed to
/// [`RemoteStore::set_credential`]. An expired credential surfaces as
/// [`crate::RemoteError::AuthExpired`] and is never retried internally.
pub trait RemoteStore: Send + Sync {
    fn upload<'a>(
        &'a self,
        bytes: Vec<u8>,
        metadata: UploadMetadata,
    ) -> BoxFuture<'a, RemoteResult<UploadReceipt>>;
    fn download<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, RemoteResult<Vec<u8>>>;
    fn list<'a>(&'a self, folder: &'a str) -> BoxFuture<'a, RemoteResult<Vec<RemoteEntry>>>;
    fn delete<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, RemoteResult<()>>;
    fn set_credential(&self, credential: Option<String>);
}
