//! HTTP surface of the task daemon
//!
//! JSON routes for listing, inspecting, enqueueing, cancelling and starting
//! tasks of both domains.

use crate::daemon::{Daemon, DaemonError, DownloadRequest, TranscodeRequest};
use crate::locator::LocatorError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;
use crate::task::{DownloadJob, TaskRecord, TranscodeJob};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Invalid bind address {0}")]
    Address(String),
}

type ApiResult<T> = Result<Json<T>, DaemonError>;

impl DaemonError {
    fn status_code(&self) -> StatusCode {
        match self {
            DaemonError::Scheduler(SchedulerError::NotFound(_))
            | DaemonError::Scheduler(SchedulerError::Store(StoreError::NotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            DaemonError::Scheduler(SchedulerError::Busy { .. })
            | DaemonError::Scheduler(SchedulerError::NotWaiting { .. }) => StatusCode::CONFLICT,
            DaemonError::Invalid(_)
            | DaemonError::Locator(LocatorError::MissingDescriptor(_))
            | DaemonError::Locator(LocatorError::Decode(_))
            | DaemonError::Locator(LocatorError::Failed(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_downloads(State(daemon): State<Arc<Daemon>>) -> ApiResult<Vec<TaskRecord<DownloadJob>>> {
    Ok(Json(daemon.downloads.list()?))
}

async fn get_download(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<TaskRecord<DownloadJob>> {
    Ok(Json(daemon.downloads.get(&id)?))
}

async fn enqueue_download(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<DownloadRequest>,
) -> Result<(StatusCode, Json<TaskRecord<DownloadJob>>), DaemonError> {
    let id = daemon.enqueue_download(request).await?;
    Ok((StatusCode::CREATED, Json(daemon.downloads.get(&id)?)))
}

async fn cancel_download(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<TaskRecord<DownloadJob>> {
    daemon.downloads.cancel(&id).await?;
    Ok(Json(daemon.downloads.get(&id)?))
}

async fn start_download(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<TaskRecord<DownloadJob>> {
    daemon.downloads.resume(&id).await?;
    Ok(Json(daemon.downloads.get(&id)?))
}

async fn list_transcodes(State(daemon): State<Arc<Daemon>>) -> ApiResult<Vec<TaskRecord<TranscodeJob>>> {
    Ok(Json(daemon.transcodes.list()?))
}

async fn get_transcode(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<TaskRecord<TranscodeJob>> {
    Ok(Json(daemon.transcodes.get(&id)?))
}

async fn enqueue_transcode(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<TranscodeRequest>,
) -> Result<(StatusCode, Json<TaskRecord<TranscodeJob>>), DaemonError> {
    let id = daemon.enqueue_transcode(request).await?;
    Ok((StatusCode::CREATED, Json(daemon.transcodes.get(&id)?)))
}

async fn cancel_transcode(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<TaskRecord<TranscodeJob>> {
    daemon.transcodes.cancel(&id).await?;
    Ok(Json(daemon.transcodes.get(&id)?))
}

async fn start_transcode(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<TaskRecord<TranscodeJob>> {
    daemon.transcodes.resume(&id).await?;
    Ok(Json(daemon.transcodes.get(&id)?))
}

/// Creates the axum Router with all task routes
pub fn create_api_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/downloads", get(list_downloads).post(enqueue_download))
        .route("/downloads/:id", get(get_download))
        .route("/downloads/:id/cancel", post(cancel_download))
        .route("/downloads/:id/start", post(start_download))
        .route("/transcodes", get(list_transcodes).post(enqueue_transcode))
        .route("/transcodes/:id", get(get_transcode))
        .route("/transcodes/:id/cancel", post(cancel_transcode))
        .route("/transcodes/:id/start", post(start_transcode))
        .with_state(daemon)
}

/// Serve the API on `bind` until `shutdown` resolves
pub async fn run_api_server(
    daemon: Arc<Daemon>,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let addr: std::net::SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::Address(bind.to_string()))?;
    let app = create_api_router(daemon);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::task::TaskStatus;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_daemon(temp: &TempDir) -> Arc<Daemon> {
        let mut config = Config::default();
        config.tools.fetch = PathBuf::from("/nonexistent/torrent");
        config.tools.encoder = PathBuf::from("/nonexistent/ffmpeg");
        config.encoder.allow_hardware = false;
        config.resolve_paths(temp.path());
        Arc::new(Daemon::new_without_checks(config))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let temp = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&temp));

        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_download_lifecycle_over_http() {
        let temp = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&temp));

        let (status, body) = send(
            &app,
            "POST",
            "/downloads",
            Some(json!({ "locator": "magnet:?xt=urn:btih:abc", "name": "abc" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().unwrap().to_string();
        assert_eq!(body["name"], "abc");
        // The fetch tool is missing, so the launch fails immediately.
        assert_eq!(body["status"], "failed");

        let (status, list) = send(&app, "GET", "/downloads", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "GET", &format!("/downloads/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id.as_str());

        let (status, body) = send(&app, "POST", &format!("/downloads/{}/start", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("not waiting"));

        let (status, body) = send(&app, "POST", &format!("/downloads/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let temp = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&temp));

        for uri in [
            "/downloads/missing",
            "/transcodes/missing",
        ] {
            let (status, body) = send(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert!(body["error"].is_string());
        }
        let (status, _) = send(&app, "POST", "/transcodes/missing/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "POST", "/downloads/missing/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_transcode_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&temp));

        let (status, body) = send(
            &app,
            "POST",
            "/transcodes",
            Some(json!({ "source": "/nonexistent/in.mkv", "format": "mp4" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("does not exist"));

        let (_, list) = send(&app, "GET", "/transcodes", None).await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transcode_enqueue_over_http() {
        let temp = TempDir::new().unwrap();
        let daemon = test_daemon(&temp);
        let app = create_api_router(Arc::clone(&daemon));
        let source = temp.path().join("clip.mkv");
        std::fs::write(&source, b"x").unwrap();

        let (status, body) = send(
            &app,
            "POST",
            "/transcodes",
            Some(json!({ "source": source, "format": "mp4", "quality": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["bitrate"], "2000k");

        let id = body["id"].as_str().unwrap();
        let task = daemon.transcodes.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.job.destination, temp.path().join("clip_converted.mp4"));
    }
}
