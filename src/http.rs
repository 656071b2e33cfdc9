//! HTTP transport for the task engine
//!
//! Thin axum adapter: each route calls one engine operation and maps
//! `EngineError` variants to status codes. No task logic lives here.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::TaskRequest;
use crate::engine::TaskEngine;
use crate::error::EngineError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TaskEngine>,
    /// Normalized to end with `/`, or empty
    pub host_url: String,
    pub app_path: String,
}

impl AppState {
    fn location(&self, id: &str) -> String {
        if self.host_url.is_empty() {
            format!("{}/v1/{}", self.app_path, id)
        } else {
            format!("{}v1/{}", self.host_url, id)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskId {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub description: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self {
            EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::GONE,
            EngineError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error_code: format!("cdservice_{}", self.kind()),
            message: self.message().to_string(),
            description: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/", get(service_metadata))
        .route("/v1", axum::routing::post(create_task))
        .route("/v1/status", get(server_status))
        .route("/v1/algorithms", get(algorithms))
        .route("/v1/{id}", get(task_result).delete(delete_task))
        .route("/v1/{id}/status", get(task_status))
        .with_state(state.clone());

    match state.app_path.trim_end_matches('/') {
        "" => api,
        prefix => Router::new().nest(prefix, api),
    }
}

/// Serve until `shutdown` resolves
pub async fn serve(
    state: AppState,
    bind_address: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Listening on {}", bind_address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn service_metadata(State(state): State<AppState>) -> Result<Response, EngineError> {
    let metadata = state
        .engine
        .metadata()
        .cloned()
        .ok_or_else(|| EngineError::Internal("No service metadata available".to_string()))?;
    Ok(Json(metadata).into_response())
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<Option<TaskRequest>>,
) -> Result<Response, EngineError> {
    let id = state.engine.request(request).await?;
    let location = state.location(&id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(TaskId { id }),
    )
        .into_response())
}

async fn task_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, EngineError> {
    Ok(Json(state.engine.get_result(&id).await?).into_response())
}

async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, EngineError> {
    Ok(Json(state.engine.get_status(&id).await?).into_response())
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, EngineError> {
    state.engine.delete(&id).await?;
    Ok(StatusCode::OK)
}

async fn server_status(State(state): State<AppState>) -> Result<Response, EngineError> {
    Ok(Json(state.engine.get_server_status()?).into_response())
}

async fn algorithms(State(state): State<AppState>) -> Result<Response, EngineError> {
    Ok(Json(state.engine.get_algorithms()?).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{AlgorithmDescriptor, AlgorithmSet};
    use crate::pool::WorkerPool;
    use crate::runner::RunnerSettings;
    use serde_json::json;
    use std::time::Duration;

    fn state(dir: &std::path::Path, host_url: &str) -> AppState {
        let settings = RunnerSettings {
            task_dir: dir.to_path_buf(),
            docker_cmd: "echo".to_string(),
            mount_options: None,
            timeout: Duration::from_secs(10),
        };
        let algorithms = AlgorithmSet::new([AlgorithmDescriptor::new("louvain", "img:1")]);
        AppState {
            engine: Arc::new(TaskEngine::new(settings, WorkerPool::new(1, 0), Some(algorithms))),
            host_url: host_url.to_string(),
            app_path: "/cd/communitydetection".to_string(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let cases = [
            (EngineError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::NotFound("x".into()), StatusCode::GONE),
            (EngineError::Transient("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_null_request_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = create_task(State(state(dir.path(), "")), Json(None))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["errorCode"], "cdservice_bad_request");
        assert_eq!(body["message"], "Request is null");
    }

    #[tokio::test]
    async fn test_create_sets_location() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), "http://host/cd/");
        let request = TaskRequest::new("louvain", json!("a\tb"));

        let response = create_task(State(state.clone()), Json(Some(request)))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let location = response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .to_string();
        let body = body_json(response).await;
        let id = body["id"].as_str().unwrap();
        assert_eq!(location, format!("http://host/cd/v1/{}", id));

        let status = task_status(State(state.clone()), Path(id.to_string()))
            .await
            .into_response();
        assert_eq!(status.status(), StatusCode::OK);

        state.engine.delete(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_task_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let response = task_result(State(state(dir.path(), "")), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_delete_unknown_task_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let response = delete_task(State(state(dir.path(), "")), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_relative_location_without_host_url() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            state(dir.path(), "").location("1"),
            "/cd/communitydetection/v1/1"
        );
    }

    #[tokio::test]
    async fn test_router_builds_with_root_app_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state(dir.path(), "");
        state.app_path = "/".to_string();
        let _ = router(state);
    }
}
