// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// HTTP transport
//
// POST /log           ingest a batch        -> {"result": "OK" | "TRY_LATER" | "ERROR"}
// GET  /status        status and details
// PUT  /status        operational override
// GET  /counters      counter snapshot
// POST /reinitialize  reload the configuration file
// GET  /version       daemon version

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::handler::LogHandler;
use crate::protocol::{
    LogEntry, LogRequest, LogResponse, ReinitializeResponse, SetStatusRequest, StatusResponse,
};

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

/// Build the HTTP routes around a shared handler
pub fn create_router(handler: Arc<LogHandler>) -> Router {
    Router::new()
        .route("/log", post(log_handler))
        .route("/status", get(status_handler).put(set_status_handler))
        .route("/counters", get(counters_handler))
        .route("/reinitialize", post(reinitialize_handler))
        .route("/version", get(version_handler))
        .with_state(handler)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, handler: Arc<LogHandler>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }
    axum::serve(listener, create_router(handler))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn log_handler(
    State(handler): State<Arc<LogHandler>>,
    Json(request): Json<LogRequest>,
) -> Json<LogResponse> {
    let count = request.messages.len();
    let entries: Vec<LogEntry> = request.messages.into_iter().map(LogEntry::from).collect();
    let result = handler.log(entries).await;
    debug!("Log request with {} messages -> {}", count, result.as_str());
    Json(LogResponse { result })
}

fn status_response(handler: &LogHandler) -> StatusResponse {
    StatusResponse {
        status: handler.status(),
        details: handler.status_details(),
        version: handler.version().to_string(),
    }
}

async fn status_handler(State(handler): State<Arc<LogHandler>>) -> Json<StatusResponse> {
    Json(status_response(&handler))
}

async fn set_status_handler(
    State(handler): State<Arc<LogHandler>>,
    Json(request): Json<SetStatusRequest>,
) -> Json<StatusResponse> {
    if let Some(status) = request.status {
        handler.set_status(status);
    }
    if let Some(details) = request.details {
        handler.set_status_details(details);
    }
    Json(status_response(&handler))
}

async fn counters_handler(State(handler): State<Arc<LogHandler>>) -> Json<BTreeMap<String, i64>> {
    Json(handler.counters())
}

async fn reinitialize_handler(State(handler): State<Arc<LogHandler>>) -> Response {
    match handler.reinitialize().await {
        Ok(_) => Json(ReinitializeResponse::success()).into_response(),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ReinitializeResponse::error(e.to_string())),
        )
            .into_response(),
    }
}

async fn version_handler(State(handler): State<Arc<LogHandler>>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: handler.version(),
    })
}
