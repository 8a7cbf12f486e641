use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use strata_storage::BoxFuture;

use crate::error::{
    AuthExpiredSnafu, NotFoundSnafu, RemoteLockPoisonedSnafu, RemoteResult, UnavailableSnafu,
};
use crate::remote::{RemoteEntry, RemoteStore, UploadMetadata, UploadReceipt};

/// Failure injected into the next remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Unavailable,
    AuthExpired,
}

#[derive(Debug, Clone)]
struct StoredFile {
    folder: String,
    name: String,
    modified_at: u64,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct RemoteState {
    files: BTreeMap<String, StoredFile>,
    next_id: u64,
    scripted: VecDeque<ScriptedFailure>,
    auth_expired: bool,
    uploads: usize,
    downloads: usize,
}

/// Process-local remote store used by tests and the QA runner.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<RemoteState>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, failure: ScriptedFailure) {
        if let Ok(mut state) = self.state.lock() {
            state.scripted.push_back(failure);
        }
    }

    /// Every call fails with `AuthExpired` until a new credential arrives.
    pub fn expire_credential(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.auth_expired = true;
        }
    }

    /// Writes a file as another client would, bypassing failure injection.
    pub fn seed(&self, folder: &str, name: &str, modified_at: u64, bytes: Vec<u8>) -> String {
        let Ok(mut state) = self.state.lock() else {
            return String::new();
        };
        let existing = state
            .files
            .iter()
            .find(|(_, file)| file.folder == folder && file.name == name)
            .map(|(id, _)| id.clone());
        let remote_id = existing.unwrap_or_else(|| allocate_id(&mut state));
        state.files.insert(
            remote_id.clone(),
            StoredFile {
                folder: folder.to_string(),
                name: name.to_string(),
                modified_at,
                bytes,
            },
        );
        remote_id
    }

    pub fn file_bytes(&self, remote_id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .ok()?
            .files
            .get(remote_id)
            .map(|file| file.bytes.clone())
    }

    pub fn file_count(&self, folder: &str) -> usize {
        self.state.lock().map_or(0, |state| {
            state
                .files
                .values()
                .filter(|file| file.folder == folder)
                .count()
        })
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().map_or(0, |state| state.uploads)
    }

    pub fn download_count(&self) -> usize {
        self.state.lock().map_or(0, |state| state.downloads)
    }

    fn enter(&self, stage: &'static str) -> RemoteResult<MutexGuard<'_, RemoteState>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RemoteLockPoisonedSnafu { stage }.build())?;
        if state.auth_expired {
            return AuthExpiredSnafu { stage }.fail();
        }
        let scripted = state.scripted.pop_front();
        match scripted {
            Some(ScriptedFailure::Unavailable) => UnavailableSnafu {
                stage,
                details: "scripted outage",
            }
            .fail(),
            Some(ScriptedFailure::AuthExpired) => {
                state.auth_expired = true;
                AuthExpiredSnafu { stage }.fail()
            }
            None => Ok(state),
        }
    }
}

impl RemoteStore for InMemoryRemoteStore {
    fn upload<'a>(
        &'a self,
        bytes: Vec<u8>,
        metadata: UploadMetadata,
    ) -> BoxFuture<'a, RemoteResult<UploadReceipt>> {
        Box::pin(async move {
            let mut state = self.enter("memory-remote-upload")?;
            let remote_id = match metadata.replace {
                Some(remote_id) => {
                    if !state.files.contains_key(&remote_id) {
                        return NotFoundSnafu {
                            stage: "memory-remote-replace",
                            remote_id,
                        }
                        .fail();
                    }
                    remote_id
                }
                None => allocate_id(&mut state),
            };

            state.files.insert(
                remote_id.clone(),
                StoredFile {
                    folder: metadata.folder,
                    name: metadata.file_name,
                    modified_at: metadata.modified_at,
                    bytes,
                },
            );
            state.uploads += 1;
            Ok(UploadReceipt {
                id: remote_id,
                modified_at: metadata.modified_at,
            })
        })
    }

    fn download<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, RemoteResult<Vec<u8>>> {
        Box::pin(async move {
            let mut state = self.enter("memory-remote-download")?;
            state.downloads += 1;
            state
                .files
                .get(remote_id)
                .map(|file| file.bytes.clone())
                .ok_or_else(|| {
                    NotFoundSnafu {
                        stage: "memory-remote-download",
                        remote_id,
                    }
                    .build()
                })
        })
    }

    fn list<'a>(&'a self, folder: &'a str) -> BoxFuture<'a, RemoteResult<Vec<RemoteEntry>>> {
        Box::pin(async move {
            let state = self.enter("memory-remote-list")?;
            Ok(state
                .files
                .iter()
                .filter(|(_, file)| file.folder == folder)
                .map(|(id, file)| RemoteEntry {
                    id: id.clone(),
                    name: file.name.clone(),
                    modified_at: file.modified_at,
                })
                .collect())
        })
    }

    fn delete<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, RemoteResult<()>> {
        Box::pin(async move {
            let mut state = self.enter("memory-remote-delete")?;
            match state.files.remove(remote_id) {
                Some(_) => Ok(()),
                None => NotFoundSnafu {
                    stage: "memory-remote-delete",
                    remote_id,
                }
                .fail(),
            }
        })
    }

    fn set_credential(&self, credential: Option<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.auth_expired = credential.is_none();
        }
    }
}

fn allocate_id(state: &mut RemoteState) -> String {
    state.next_id += 1;
    format!("file-{:04}", state.next_id)
}
