use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use strata_storage::BoxFuture;

use crate::backoff::BackoffPolicy;
use crate::error::{
    AuthExpiredSnafu, BuildClientSnafu, DecodeResponseSnafu, MissingCredentialSnafu,
    NetworkSnafu, NotFoundSnafu, RateLimitedSnafu, RemoteResult, StatusSnafu,
};
use crate::remote::{RemoteEntry, RemoteStore, UploadMetadata, UploadReceipt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    /// Rate-limit retries per call before giving up with `RateLimited`.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub request_timeout: Option<Duration>,
}

impl HttpRemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            max_retries: 5,
            backoff: BackoffPolicy::default(),
            request_timeout: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    files: Vec<RemoteEntry>,
}

/// Object-store client speaking a small folder/file REST surface:
///
/// - `POST {base}/folders/{folder}/files?name=..&modified_at=..` creates
/// - `PUT {base}/files/{id}?modified_at=..` replaces
/// - `GET {base}/files/{id}` downloads, `DELETE {base}/files/{id}` removes
/// - `GET {base}/folders/{folder}/files` lists `{files: [{id, name, modified_at}]}`
pub struct HttpRemoteStore {
    client: Client,
    config: HttpRemoteConfig,
    credential: ArcSwapOption<String>,
}

impl HttpRemoteStore {
    pub fn new(config: HttpRemoteConfig) -> RemoteResult<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context(BuildClientSnafu {
            stage: "http-remote-build-client",
        })?;

        Ok(Self {
            client,
            config,
            credential: ArcSwapOption::empty(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    // Rate-limit retries stay local to this call; the reconciler never sees them
    // unless the retry budget runs out.
    async fn send<F>(&self, stage: &'static str, subject: &str, build: F) -> RemoteResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let credential = self
            .credential
            .load_full()
            .ok_or_else(|| MissingCredentialSnafu { stage }.build())?;

        let mut rate_limited = 0_u32;
        loop {
            let response = build(&self.client)
                .bearer_auth(credential.as_str())
                .send()
                .await
                .context(NetworkSnafu { stage })?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            match status {
                StatusCode::UNAUTHORIZED => {
                    tracing::warn!(stage, "remote rejected bearer credential");
                    return AuthExpiredSnafu { stage }.fail();
                }
                StatusCode::NOT_FOUND => {
                    return NotFoundSnafu {
                        stage,
                        remote_id: subject.to_string(),
                    }
                    .fail();
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    rate_limited += 1;
                    if rate_limited > self.config.max_retries {
                        return RateLimitedSnafu {
                            stage,
                            attempts: rate_limited,
                        }
                        .fail();
                    }
                    let delay = retry_after(&response)
                        .map(|delay| delay.min(self.config.backoff.cap()))
                        .unwrap_or_else(|| self.config.backoff.delay_for(rate_limited));
                    tracing::debug!(stage, attempt = rate_limited, ?delay, "remote rate limited, backing off");
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    return StatusSnafu {
                        stage,
                        status: status.as_u16(),
                        body,
                    }
                    .fail();
                }
            }
        }
    }

    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        metadata: UploadMetadata,
    ) -> RemoteResult<UploadReceipt> {
        let modified_at = metadata.modified_at.to_string();
        let response = match metadata.replace.as_deref() {
            Some(remote_id) => {
                let url = self.url(&format!("files/{remote_id}"));
                self.send("http-remote-replace", remote_id, |client| {
                    client
                        .put(&url)
                        .query(&[("modified_at", modified_at.as_str())])
                        .header(CONTENT_TYPE, metadata.content_type.as_str())
                        .body(bytes.clone())
                })
                .await?
            }
            None => {
                let url = self.url(&format!("folders/{}/files", metadata.folder));
                self.send("http-remote-create", &metadata.folder, |client| {
                    client
                        .post(&url)
                        .query(&[
                            ("name", metadata.file_name.as_str()),
                            ("modified_at", modified_at.as_str()),
                        ])
                        .header(CONTENT_TYPE, metadata.content_type.as_str())
                        .body(bytes.clone())
                })
                .await?
            }
        };

        response
            .json::<UploadReceipt>()
            .await
            .context(DecodeResponseSnafu {
                stage: "http-remote-upload-decode",
            })
    }
}

impl RemoteStore for HttpRemoteStore {
    fn upload<'a>(
        &'a self,
        bytes: Vec<u8>,
        metadata: UploadMetadata,
    ) -> BoxFuture<'a, RemoteResult<UploadReceipt>> {
        Box::pin(self.upload_bytes(bytes, metadata))
    }

    fn download<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, RemoteResult<Vec<u8>>> {
        Box::pin(async move {
            let url = self.url(&format!("files/{remote_id}"));
            let response = self
                .send("http-remote-download", remote_id, |client| client.get(&url))
                .await?;
            let bytes = response.bytes().await.context(NetworkSnafu {
                stage: "http-remote-download-body",
            })?;
            Ok(bytes.to_vec())
        })
    }

    fn list<'a>(&'a self, folder: &'a str) -> BoxFuture<'a, RemoteResult<Vec<RemoteEntry>>> {
        Box::pin(async move {
            let url = self.url(&format!("folders/{folder}/files"));
            let response = match self
                .send("http-remote-list", folder, |client| client.get(&url))
                .await
            {
                Ok(response) => response,
                // A folder that was never written to has no entries.
                Err(error) if error.is_not_found() => return Ok(Vec::new()),
                Err(error) => return Err(error),
            };
            let listing = response
                .json::<ListResponse>()
                .await
                .context(DecodeResponseSnafu {
                    stage: "http-remote-list-decode",
                })?;
            Ok(listing.files)
        })
    }

    fn delete<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, RemoteResult<()>> {
        Box::pin(async move {
            let url = self.url(&format!("files/{remote_id}"));
            self.send("http-remote-delete", remote_id, |client| client.delete(&url))
                .await?;
            Ok(())
        })
    }

    fn set_credential(&self, credential: Option<String>) {
        self.credential.store(credential.map(Arc::new));
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
