//! HTTP/JSON transport.
//!
//! Routes:
//! - `POST /identify`, `POST /api/identify`: [`IdentifyRequest`] in,
//!   [`IdentifyResponse`] out
//! - `GET /healthz`: liveness
//!
//! Resolution is synchronous and takes store locks, so it runs on the
//! blocking pool. Internal failures are logged here and reach the caller
//! only as an opaque 500.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::error::ReconcileError;
use crate::identify::{IdentifyRequest, IdentifyResponse};
use crate::resolver::IdentityResolver;

/// Body sent with every 500.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// Build the router.
pub fn router(resolver: Arc<IdentityResolver>) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/api/identify", post(identify))
        .route("/healthz", get(healthz))
        .with_state(resolver)
}

/// Errors the transport turns into responses.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed body or missing identifiers (400).
    BadRequest(String),
    /// Anything else (500); the cause was already logged.
    Internal,
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        if err.is_client_error() {
            Self::BadRequest(err.to_string())
        } else {
            tracing::error!(error = %err, "identify failed");
            Self::Internal
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": INTERNAL_ERROR_MESSAGE })),
            )
                .into_response(),
        }
    }
}

async fn identify(
    State(resolver): State<Arc<IdentityResolver>>,
    body: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let response = tokio::task::spawn_blocking(move || resolver.identify(&request))
        .await
        .map_err(|e| ReconcileError::internal(format!("identify task failed: {e}")))??;

    Ok(Json(response))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn missing_identifier_is_bad_request() {
        let err: ReconcileError = crate::error::ValidationError::MissingIdentifier.into();
        let api = ApiError::from(err);
        assert!(matches!(api, ApiError::BadRequest(ref m) if m.contains("phoneNumber")));
        assert_eq!(status_of(api), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn storage_failure_is_opaque_internal_error() {
        let err: ReconcileError = StorageError::BackendError("disk on fire".to_string()).into();
        let api = ApiError::from(err);
        assert!(matches!(api, ApiError::Internal));
        assert_eq!(status_of(api), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn panicked_task_maps_to_internal_error() {
        let join_err = tokio::task::spawn_blocking::<_, ()>(|| panic!("boom")).await.unwrap_err();
        let api = ApiError::from(ReconcileError::internal(format!("identify task failed: {join_err}")));
        assert!(matches!(api, ApiError::Internal));
        assert_eq!(status_of(api), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
