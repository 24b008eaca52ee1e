use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum PeakError {
    #[error("Unknown server or group: {0}")]
    UnknownIdentifier(String),

    #[error("Invalid group name: {0}")]
    InvalidGroupName(String),

    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<duckdb::Error> for PeakError {
    fn from(err: duckdb::Error) -> Self {
        PeakError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for PeakError {
    fn from(err: config::ConfigError) -> Self {
        PeakError::Config(err.to_string())
    }
}

impl PeakError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PeakError::UnknownIdentifier(_) => StatusCode::NOT_FOUND,
            PeakError::InvalidGroupName(_) | PeakError::InvalidWindow(_) => StatusCode::BAD_REQUEST,
            PeakError::StoreUnavailable(_) | PeakError::Config(_) | PeakError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for PeakError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, PeakError>;
