//! HTTP routes consumed by the notebook front-end.
//!
//! These handlers are an external collaborator of the execution core: they
//! only parse requests and call into `runner.submit` / `jobLoop.submit`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use cellrun_core::secure_relative_file_path;

use crate::app::AppState;
use crate::error::ServerError;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/interactive", post(interactive_handler))
        .route("/file-runs", post(file_run_handler))
        .route("/files", post(files_write_handler).get(files_read_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Language {
    Shell,
    Python,
}

#[derive(Debug, Deserialize)]
struct InteractiveQuery {
    language: Language,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteractiveBody {
    cell_id: String,
    channel: String,
    code: String,
}

async fn interactive_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InteractiveQuery>,
    Json(body): Json<InteractiveBody>,
) -> Result<impl IntoResponse, ServerError> {
    match query.language {
        Language::Python => state.console.submit(body.cell_id, body.channel, body.code)?,
        Language::Shell => {
            state
                .job_loop
                .submit(body.cell_id, body.channel, vec!["/bin/bash".to_string(), "-c".to_string(), body.code], HashMap::new())?;
        }
    }
    Ok((StatusCode::OK, "Ok"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRunBody {
    cell_id: String,
    channel: String,
    file_path: String,
}

async fn file_run_handler(State(state): State<Arc<AppState>>, Json(body): Json<FileRunBody>) -> Result<impl IntoResponse, ServerError> {
    if !body.file_path.ends_with(".py") {
        return Err(ServerError::BadRequest("file run path must end with .py".to_string()));
    }

    let relative = secure_relative_file_path(&body.file_path);
    let full_path = state.config.file_root_dir.join(&relative);

    let mut env = HashMap::new();
    env.insert("PYTHONPATH".to_string(), state.config.file_root_dir.display().to_string());

    let strip_prefix = format!("{}/", state.config.file_root_dir.display());
    state.job_loop.submit_with_stripped_prefix(
        body.cell_id,
        body.channel,
        vec![state.config.python.clone(), "-u".to_string(), full_path.display().to_string()],
        env,
        Some(strip_prefix),
    )?;

    Ok((StatusCode::OK, "Ok"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileWriteBody {
    file_path: String,
    content: String,
}

async fn files_write_handler(State(state): State<Arc<AppState>>, Json(body): Json<FileWriteBody>) -> Result<impl IntoResponse, ServerError> {
    let relative = secure_relative_file_path(&body.file_path);
    let full_path = state.config.file_root_dir.join(&relative);

    if let Some(parent) = full_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&full_path, body.content).await?;

    Ok((StatusCode::OK, "Ok"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileReadQuery {
    file_path: String,
}

async fn files_read_handler(State(state): State<Arc<AppState>>, Query(query): Query<FileReadQuery>) -> Result<impl IntoResponse, ServerError> {
    let relative = secure_relative_file_path(&query.file_path);
    let full_path = state.config.file_root_dir.join(&relative);

    let content = tokio::fs::read_to_string(&full_path).await?;
    Ok((StatusCode::OK, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use cellrun_core::TestSocketSink;
    use tower::ServiceExt;

    fn test_state(root: std::path::PathBuf) -> (Arc<AppState>, Arc<TestSocketSink>) {
        let sink = Arc::new(TestSocketSink::new());
        let config = Config::for_testing(root);
        let state = crate::app::AppFactory::build_with_sink(config, sink.clone());
        (state, sink)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _sink) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let response = router.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn files_round_trip_neutralises_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _sink) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let write_body = json!({"filePath": "../../../..ssh/config", "content": "x"});
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/files")
                    .header("content-type", "application/json")
                    .body(Body::from(write_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(dir.path().join("ssh/config").exists());

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/files?filePath=ssh%2Fconfig")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn file_run_rejects_non_python_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _sink) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let body = json!({"cellId": "cid", "channel": "chan", "filePath": "modules/test.sh"});
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/file-runs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn interactive_shell_enqueues_and_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (state, sink) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let body = json!({"cellId": "shcid", "channel": "channel", "code": "echo Hello"});
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/interactive?language=shell")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let found = sink
            .find_event_polling("cell_run_end", &json!({"id": "shcid", "status": "done"}), "channel", "/cells")
            .await;
        assert!(found);
    }
}
