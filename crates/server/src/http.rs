//! The `{data}` / `{error}` body conventions and the anyhow → HTTP bridge.
//! All handlers return `Result<_, HttpResponseError>`; conversion happens at
//! the single exit point of the HTTP layer.

use axum::{
    response::{
        IntoResponse,
        Response,
    },
    Json,
};
use errors::{
    ErrorMetadataAnyhowExt,
    FieldViolation,
};
use http::StatusCode;
use serde::Serialize;

/// Success envelope: every 2xx body is `{"data": ...}`.
#[derive(Serialize)]
pub struct Data<T> {
    pub data: T,
}

pub fn ok<T: Serialize>(value: T) -> Response {
    (StatusCode::OK, Json(Data { data: value })).into_response()
}

pub fn created<T: Serialize>(value: T) -> Response {
    (StatusCode::CREATED, Json(Data { data: value })).into_response()
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorPayload,
}

#[derive(Serialize)]
struct ErrorPayload {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldViolation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
    /// Development builds only; production bodies never carry a stack.
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
}

/// Error carrier for every handler. Wraps the full anyhow chain so the exit
/// point can log it, while the response body only exposes the stable code
/// and the user-facing message.
#[derive(Debug)]
pub struct HttpResponseError {
    trace: anyhow::Error,
}

impl From<anyhow::Error> for HttpResponseError {
    fn from(trace: anyhow::Error) -> Self {
        Self { trace }
    }
}

impl From<errors::ErrorMetadata> for HttpResponseError {
    fn from(metadata: errors::ErrorMetadata) -> Self {
        Self {
            trace: metadata.into(),
        }
    }
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        // The one place request errors get logged and counted.
        errors::report_error(&self.trace);

        let status = self.trace.http_status();
        let details = self
            .trace
            .metadata()
            .filter(|m| !m.details.is_empty())
            .map(|m| m.details.clone());
        let stack = cfg!(debug_assertions).then(|| format!("{:?}", self.trace));
        let body = ErrorBody {
            error: ErrorPayload {
                code: self.trace.short_code().to_owned(),
                message: self.trace.user_facing_message(),
                details,
                retry_after_seconds: self.trace.retry_after().map(|d| d.as_secs().max(1)),
                stack,
            },
        };
        (status, Json(body)).into_response()
    }
}
