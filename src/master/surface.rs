//! Outward JSON-RPC command surface.
//!
//! One HTTP endpoint, `POST /rpc`, speaking JSON-RPC 2.0. Every method is
//! a thin projection over Master state; nothing here touches the
//! processing hot path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, routing::post};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::Master;

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const APP_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct DirectoryParams {
    directory: PathBuf,
}

/// Serve the command surface until aborted.
pub async fn serve(master: Arc<Master>, bind: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/rpc", post(handle))
        .with_state(master);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding command surface to {bind}"))?;
    info!(%bind, "command surface listening");

    axum::serve(listener, app).await.context("command surface server")
}

async fn handle(State(master): State<Arc<Master>>, body: String) -> Json<Value> {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return Json(error_reply(Value::Null, PARSE_ERROR, &e.to_string())),
    };

    let id = request.id.clone();
    match dispatch(&master, request).await {
        Ok(result) => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        })),
        Err((code, message)) => Json(error_reply(id, code, &message)),
    }
}

async fn dispatch(master: &Master, request: RpcRequest) -> Result<Value, (i64, String)> {
    match request.method.as_str() {
        "health_check" => Ok(master.health_check().await),
        "get_system_stats" => Ok(master.system_stats()),
        "get_processing_stats" => Ok(master.processing_stats()),
        "get_queue_status" => Ok(master.queue_status()),
        "list_watched_directories" => Ok(json!({
            "directories": master.list_watched(),
        })),
        "start_watching" => {
            let params = directory_params(request.params)?;
            let added = master
                .start_watching(&params.directory)
                .map_err(|e| (APP_ERROR, e.to_string()))?;
            Ok(json!({ "directory": params.directory, "added": added }))
        }
        "stop_watching" => {
            let params = directory_params(request.params)?;
            let was_watched = master
                .stop_watching(&params.directory)
                .await
                .map_err(|e| (APP_ERROR, e.to_string()))?;
            Ok(json!({ "directory": params.directory, "was_watched": was_watched }))
        }
        "get_watch_status" => {
            let params = directory_params(request.params)?;
            Ok(master.watch_status(&params.directory))
        }
        other => Err((METHOD_NOT_FOUND, format!("unknown method: {other}"))),
    }
}

fn directory_params(params: Value) -> Result<DirectoryParams, (i64, String)> {
    serde_json::from_value(params).map_err(|e| (INVALID_PARAMS, e.to_string()))
}

fn error_reply(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::facade::{CommitReceipt, FacadeError, HealthReport, VectorStore};
    use crate::models::{Chunk, IndexedFileRecord};
    use async_trait::async_trait;
    use std::path::Path;

    struct NullStore;

    #[async_trait]
    impl VectorStore for NullStore {
        async fn list_files(&self, _dir: &Path) -> Result<Vec<IndexedFileRecord>, FacadeError> {
            Ok(Vec::new())
        }
        async fn prepare_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, FacadeError> {
            Ok(chunks)
        }
        async fn commit_chunks(&self, chunks: &[Chunk]) -> Result<CommitReceipt, FacadeError> {
            Ok(CommitReceipt {
                created: chunks.len() as u64,
                ids: Vec::new(),
            })
        }
        async fn delete_by_source(&self, _source_id: &str) -> Result<u64, FacadeError> {
            Ok(0)
        }
        async fn health(&self) -> HealthReport {
            HealthReport::new()
        }
    }

    fn master() -> Master {
        Master::new(Config::default(), None, Arc::new(NullStore)).unwrap()
    }

    async fn call(master: &Master, method: &str, params: Value) -> Result<Value, (i64, String)> {
        dispatch(
            master,
            RpcRequest {
                id: json!(1),
                method: method.to_string(),
                params,
            },
        )
        .await
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let m = master();
        let err = call(&m, "no_such_method", Value::Null).await.unwrap_err();
        assert_eq!(err.0, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_then_list() {
        let m = master();
        let result = call(&m, "start_watching", json!({ "directory": "/tmp/docs" }))
            .await
            .unwrap();
        assert_eq!(result["added"], true);

        let listed = call(&m, "list_watched_directories", Value::Null)
            .await
            .unwrap();
        assert_eq!(listed["directories"], json!(["/tmp/docs"]));
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let m = master();
        let err = call(&m, "start_watching", json!({ "dir": "/tmp/docs" }))
            .await
            .unwrap_err();
        assert_eq!(err.0, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_relative_directory_is_app_error() {
        let m = master();
        let err = call(&m, "start_watching", json!({ "directory": "docs" }))
            .await
            .unwrap_err();
        assert_eq!(err.0, APP_ERROR);
    }

    #[tokio::test]
    async fn test_watch_status_unknown_directory() {
        let m = master();
        let status = call(&m, "get_watch_status", json!({ "directory": "/nowhere" }))
            .await
            .unwrap();
        assert_eq!(status["watched"], false);
        assert!(status["worker"].is_null());
    }

    #[tokio::test]
    async fn test_stats_methods_answer() {
        let m = master();
        assert!(call(&m, "get_system_stats", Value::Null).await.is_ok());
        assert!(call(&m, "get_processing_stats", Value::Null).await.is_ok());
        assert!(call(&m, "get_queue_status", Value::Null).await.is_ok());
        assert!(call(&m, "health_check", Value::Null).await.is_ok());
    }
}
