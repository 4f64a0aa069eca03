//! Error kinds shared across components, plus the HTTP envelope used by
//! the worker dispatcher.
//!
//! Domain code returns these `thiserror` enums so callers can `match` on a
//! specific kind (e.g. the vehicle gateway's `AuthExpired` triggering
//! exactly one `force_refresh` + retry); binaries and outer glue still use
//! `anyhow::Error` at their boundaries.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced by the vehicle gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("access token expired")]
    AuthExpired,
    #[error("access forbidden: {0}")]
    AuthForbidden(String),
    #[error("vehicle {0} is offline")]
    VehicleOffline(String),
    #[error("vehicle {0} is asleep")]
    VehicleAsleep(String),
    #[error("signed command requires the proxy but it is unavailable")]
    ProxyRequired,
    #[error("vehicle command rejected: {0}")]
    CommandRejected(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors surfaced by the signed-command proxy supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("private key is not ready")]
    PrivateKeyNotReady,
    #[error("proxy failed to become healthy within the readiness window")]
    NotReady,
    #[error("proxy process failed to spawn: {0}")]
    SpawnFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the token manager.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("no token material available in canonical store, legacy store, or local cache")]
    NoTokenMaterial,
    #[error("refresh exchange failed: {0}")]
    RefreshFailed(String),
    #[error("secret store error: {0}")]
    Store(String),
}

/// Errors surfaced by the off-peak reconciler's pricing client.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("planner unavailable: {0}")]
    Unavailable(String),
    #[error("planner request timed out")]
    Timeout,
}

/// Errors surfaced at the worker dispatcher's cycle boundary.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("token unavailable: {0}")]
    TokenUnavailable(#[from] TokenError),
    #[error("private key not ready")]
    PrivateKeyNotReady,
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("cycle exceeded its overall timeout and was abandoned")]
    Timeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A malformed spreadsheet row, recoverable at the per-row boundary.
#[derive(Debug, thiserror::Error)]
#[error("malformed special-charging row {row}: {reason}")]
pub struct SheetRowMalformed {
    pub row: u32,
    pub reason: String,
}

/// The `{status:"error", error:<string>, ...}` envelope used by every
/// non-2xx Worker Dispatcher response, grounded on
/// `core-server-rs/src/error.rs::AppError`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        AppError {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(json!({"status": "error", "error": self.message})),
        )
            .into_response()
    }
}

impl From<CycleError> for AppError {
    fn from(err: CycleError) -> Self {
        let status = match &err {
            CycleError::TokenUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CycleError::PrivateKeyNotReady => StatusCode::INTERNAL_SERVER_ERROR,
            CycleError::Proxy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CycleError::Gateway(_) => StatusCode::BAD_GATEWAY,
            CycleError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            CycleError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
