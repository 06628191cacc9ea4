//! Error types for the shopfloor services
//!
//! One taxonomy is observable at every service interface: business-rule
//! failures (`NotFound`, `Underflow`), transport failures (`Network`),
//! store failures (`Store`), and the reserved `Conflict`. Business and
//! transport failures map to 400, store failures to 500; a 4xx reply means
//! no entity state change was made durable (log records excepted — the
//! sweeper reconciles those).
//!
//! Handlers return `ApiError`, which pairs a `ServiceError` with the
//! correlation id of the request so callers can follow the log trail of a
//! failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::kv::StoreError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Underflow(String),

    #[error("Request error: {0}")]
    Network(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Conflict(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_)
            | ServiceError::Underflow(_)
            | ServiceError::Network(_)
            | ServiceError::Conflict(_) => StatusCode::BAD_REQUEST,
            ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        ServiceError::Network(e.to_string())
    }
}

/// A service error annotated with the correlation id of the request that
/// produced it, for the HTTP error body.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ServiceError,
    pub log_id: Option<Uuid>,
}

impl ApiError {
    pub fn new(kind: ServiceError) -> Self {
        Self { kind, log_id: None }
    }

    pub fn with_log(kind: ServiceError, log_id: Uuid) -> Self {
        Self {
            kind,
            log_id: Some(log_id),
        }
    }
}

impl<E: Into<ServiceError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError::new(e.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_id: Option<Uuid>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        let body = ErrorBody {
            error: self.kind.to_string(),
            log_id: self.log_id,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Underflow("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Network("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Store(StoreError::InvalidKey).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_carries_log_id() {
        let log_id = Uuid::new_v4();
        let error = ApiError::with_log(ServiceError::NotFound("item missing".into()), log_id);
        let body = ErrorBody {
            error: error.kind.to_string(),
            log_id: error.log_id,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("item missing"));
        assert!(json.contains(&log_id.to_string()));
    }
}
