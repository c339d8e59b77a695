//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that pings the metadata and data stores

use crate::services::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

/// `GET /healthz`
///
/// Liveness check. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Pings both stores. HTTP 200 when every check passes, 503 otherwise,
/// with a JSON body describing each check.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let metadata = match service.metadata.ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(err) => {
            warn!(error = %err, "metadata store not ready");
            CheckStatus::failed(err.to_string())
        }
    };
    let data = match service.data.ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(err) => {
            warn!(error = %err, "data store not ready");
            CheckStatus::failed(err.to_string())
        }
    };

    let overall_ok = metadata.ok && data.ok;
    let mut checks = HashMap::new();
    checks.insert("metadata", metadata);
    checks.insert("data", data);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
