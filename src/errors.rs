use crate::{cors::apply_cors_headers, services::object_store::StorageError};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A client-facing error: status code, machine-readable kind and a description.
///
/// Rendered as `{"error": kind, "description": description}` with the CORS
/// header set attached.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub description: String,
}

impl AppError {
    /// Create a new AppError with a specific status, kind and description.
    pub fn new(status: StatusCode, kind: &'static str, description: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            description: description.into(),
        }
    }

    /// Shortcut for 404 Not Found
    pub fn not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "the requested resource does not exist",
        )
    }

    /// Shortcut for 405 Method Not Allowed
    pub fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "request method is not allowed",
        )
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            description,
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.kind,
            "description": self.description,
        }));

        let mut response = (self.status, body).into_response();
        let headers = response.headers_mut();
        apply_cors_headers(headers);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        tracing::error!("object store failure: {}", err);
        AppError::internal("the object store could not be reached")
    }
}
