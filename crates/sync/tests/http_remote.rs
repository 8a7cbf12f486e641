use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use strata_sync::{
    BackoffPolicy, HttpRemoteConfig, HttpRemoteStore, RemoteError, RemoteStore, UploadMetadata,
};

const TOKEN: &str = "good-token";

#[derive(Default)]
struct ServerState {
    rate_limited_responses: AtomicU32,
    requests: AtomicU32,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(format!("Bearer {TOKEN}").as_str())
}

async fn create_file(
    State(state): State<Arc<ServerState>>,
    Path(folder): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let remaining = state.rate_limited_responses.load(Ordering::SeqCst);
    if remaining > 0 {
        state
            .rate_limited_responses
            .store(remaining - 1, Ordering::SeqCst);
        return (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "0")]).into_response();
    }

    let modified_at = query
        .get("modified_at")
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or_default();
    let name = query.get("name").cloned().unwrap_or_default();
    Json(json!({ "id": format!("{folder}/{name}"), "modified_at": modified_at })).into_response()
}

async fn list_files(Path(folder): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if folder == "empty" {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "files": [{ "id": "f-1", "name": "one.json", "modified_at": 42 }]
    }))
    .into_response()
}

async fn download_file(Path(remote_id): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if remote_id == "missing" {
        return StatusCode::NOT_FOUND.into_response();
    }
    (StatusCode::OK, remote_id.into_bytes()).into_response()
}

async fn spawn_server(state: Arc<ServerState>) -> String {
    let app = Router::new()
        .route("/folders/{folder}/files", post(create_file).get(list_files))
        .route("/files/{remote_id}", get(download_file))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let address = listener.local_addr().expect("address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{address}")
}

fn client(base_url: String, max_retries: u32) -> HttpRemoteStore {
    let store = HttpRemoteStore::new(HttpRemoteConfig {
        max_retries,
        backoff: BackoffPolicy {
            base_ms: 1,
            factor: 2,
            cap_ms: 5,
        },
        ..HttpRemoteConfig::new(base_url)
    })
    .expect("client");
    store.set_credential(Some(TOKEN.to_string()));
    store
}

fn metadata() -> UploadMetadata {
    UploadMetadata {
        folder: "conversations".to_string(),
        file_name: "a.json".to_string(),
        content_type: "application/json".to_string(),
        modified_at: 77,
        replace: None,
    }
}

#[tokio::test]
async fn rate_limited_upload_retries_inside_the_call() {
    let state = Arc::new(ServerState::default());
    state.rate_limited_responses.store(2, Ordering::SeqCst);
    let store = client(spawn_server(state.clone()).await, 5);

    let receipt = store
        .upload(b"{}".to_vec(), metadata())
        .await
        .expect("upload");

    assert_eq!(receipt.id, "conversations/a.json");
    assert_eq!(receipt.modified_at, 77);
    assert_eq!(state.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limit_budget_is_bounded() {
    let state = Arc::new(ServerState::default());
    state.rate_limited_responses.store(10, Ordering::SeqCst);
    let store = client(spawn_server(state.clone()).await, 2);

    let error = store
        .upload(b"{}".to_vec(), metadata())
        .await
        .expect_err("should give up");

    assert!(matches!(error, RemoteError::RateLimited { attempts: 3, .. }));
    assert!(error.is_transient());
    assert_eq!(state.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rejected_credential_surfaces_auth_expired() {
    let base_url = spawn_server(Arc::new(ServerState::default())).await;
    let store = client(base_url, 5);
    store.set_credential(Some("stale-token".to_string()));

    let error = store.list("conversations").await.expect_err("unauthorized");

    assert!(matches!(error, RemoteError::AuthExpired { .. }));
}

#[tokio::test]
async fn missing_credential_never_reaches_the_network() {
    let state = Arc::new(ServerState::default());
    let store = client(spawn_server(state.clone()).await, 5);
    store.set_credential(None);

    let error = store
        .upload(b"{}".to_vec(), metadata())
        .await
        .expect_err("no credential");

    assert!(matches!(error, RemoteError::MissingCredential { .. }));
    assert_eq!(state.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn listing_download_and_not_found_map_cleanly() {
    let store = client(spawn_server(Arc::new(ServerState::default())).await, 5);

    let listing = store.list("conversations").await.expect("list");
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].modified_at, 42);
    assert!(store.list("empty").await.expect("empty list").is_empty());

    assert_eq!(store.download("f-1").await.expect("download"), b"f-1".to_vec());
    let missing = store.download("missing").await.expect_err("missing");
    assert!(missing.is_not_found());
}
