// src/server.rs
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::Method;
use axum::routing::{any, get};
use axum::{Json, Router};
use jsonrpsee_types::error::{ErrorObject, ErrorObjectOwned, PARSE_ERROR_CODE, PARSE_ERROR_MSG};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::dispatch::{Dispatcher, Response};
use crate::store::ApiKeyStore;

/// Shared state of the HTTP transport.
pub struct AppState<S> {
    pub dispatcher: Arc<Dispatcher<S>>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    /// Deadline for one API-key lookup.
    pub key_timeout: Duration,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            api_keys: self.api_keys.clone(),
            key_timeout: self.key_timeout,
        }
    }
}

/// `POST /:key` carries one JSON-RPC call; `GET /health` is unauthenticated.
pub fn router<S: Send + Sync + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", any(missing_key))
        .route("/:key", any(handle_rpc::<S>))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn missing_key() -> Json<Response> {
    Json(gate_error("Key error", "No key"))
}

async fn handle_rpc<S: Send + Sync + 'static>(
    State(state): State<AppState<S>>,
    method: Method,
    Path(key): Path<String>,
    body: Bytes,
) -> Json<Response> {
    if method != Method::POST {
        return Json(gate_error(PARSE_ERROR_MSG, "POST method excepted"));
    }
    if body.is_empty() {
        return Json(gate_error(PARSE_ERROR_MSG, "No POST data"));
    }
    let authorized = authorize(state.api_keys.as_ref(), &key, state.key_timeout).await;
    if let Err(response) = authorized {
        return Json(response);
    }

    Json(state.dispatcher.handle(&body).await)
}

/// Requires `key` to name an enabled API key.
pub async fn authorize(
    api_keys: &dyn ApiKeyStore,
    key: &str,
    deadline: Duration,
) -> Result<(), Response> {
    if key.is_empty() {
        return Err(gate_error("Key error", "No key"));
    }

    match tokio::time::timeout(deadline, api_keys.find_key(key)).await {
        Ok(Ok(Some(api_key))) if api_key.enabled => Ok(()),
        Ok(Ok(_)) => {
            debug!("Rejected unknown or disabled api key");
            Err(gate_error("Key error", "Apikey error"))
        }
        Ok(Err(e)) => {
            error!("Query api key error: {}", e);
            Err(gate_error("Database error", "Query apikey error"))
        }
        Err(_) => {
            error!("Query api key exceeded {:?}", deadline);
            Err(gate_error("Database error", "Query apikey error"))
        }
    }
}

fn gate_error(message: &str, data: &str) -> Response {
    let error: ErrorObjectOwned = ErrorObject::owned(PARSE_ERROR_CODE, message, Some(data));
    Response::error(Value::Null, error)
}
