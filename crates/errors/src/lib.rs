//! The SyncKairos error taxonomy.
//!
//! Domain errors travel as [`ErrorMetadata`] attached to an `anyhow` chain
//! via `.context(..)`. The metadata carries a stable machine-readable code
//! (the `code` field of REST error bodies and WS `ERROR` messages), a human
//! message, and an HTTP status class. Ingress surfaces read them back through
//! [`ErrorMetadataAnyhowExt`].

use std::{
    borrow::Cow,
    time::Duration,
};

use http::StatusCode;
use serde::Serialize;

mod metrics;

/// Stable machine-readable codes surfaced to clients. These strings are part
/// of the public contract; renaming one is a breaking API change.
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
pub const CONCURRENT_MODIFICATION: &str = "CONCURRENT_MODIFICATION";
pub const INVALID_STATE_TRANSITION: &str = "INVALID_STATE_TRANSITION";
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const STATE_DESERIALIZATION_ERROR: &str = "STATE_DESERIALIZATION_ERROR";
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
pub const OVERLOADED: &str = "OVERLOADED";
pub const CLIENT_DISCONNECTED: &str = "CLIENT_DISCONNECTED";

const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";

/// One constraint violation inside a `VALIDATION_ERROR`, surfaced in the
/// `details` array of the error body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: Cow<'static, str>,
    pub constraint: Cow<'static, str>,
}

impl FieldViolation {
    pub fn new(
        field: impl Into<Cow<'static, str>>,
        constraint: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            field: field.into(),
            constraint: constraint.into(),
        }
    }
}

/// ErrorMetadata rides an anyhow error chain via `.context(e)`. The `code`
/// field carries the stable client-facing string; `kind` classifies it for
/// HTTP status mapping and log severity.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub kind: ErrorKind,
    /// Stable machine code, e.g. `SESSION_NOT_FOUND`. Usable in tests for
    /// string matching.
    pub code: Cow<'static, str>,
    /// Human readable, developer facing.
    pub msg: Cow<'static, str>,
    /// Field-level violations; populated only for validation errors.
    pub details: Vec<FieldViolation>,
    /// Populated only for rate-limit errors; surfaced as
    /// `retry_after_seconds`.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    /// Optimistic-concurrency conflict: the caller may retry.
    Conflict,
    RateLimited,
    /// The client went away mid-request.
    ClientDisconnect,
    /// A defensive limit tripped; retrying later is safe.
    Overloaded,
    InternalServerError,
}

impl ErrorMetadata {
    fn new(
        kind: ErrorKind,
        code: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            msg: msg.into(),
            details: Vec::new(),
            retry_after: None,
        }
    }

    /// Bad request. Maps to 400. `code` should be one of the stable
    /// SCREAMING_SNAKE constants above.
    pub fn bad_request(
        code: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(ErrorKind::BadRequest, code, msg)
    }

    /// Resource not found. Maps to 404.
    pub fn not_found(
        code: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(ErrorKind::NotFound, code, msg)
    }

    /// Defensive-limit error. Maps to 503.
    pub fn overloaded(
        code: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(ErrorKind::Overloaded, code, msg)
    }

    pub fn client_disconnect() -> Self {
        Self::new(
            ErrorKind::ClientDisconnect,
            CLIENT_DISCONNECTED,
            "Client disconnected before the request completed",
        )
    }

    pub fn session_not_found(session_id: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::NotFound,
            SESSION_NOT_FOUND,
            format!("Session {session_id} does not exist or has expired"),
        )
    }

    /// Version-checked write lost the race. Maps to 409; the caller decides
    /// whether to retry.
    pub fn concurrent_modification(
        session_id: impl std::fmt::Display,
        expected: u64,
        actual: u64,
    ) -> Self {
        Self::new(
            ErrorKind::Conflict,
            CONCURRENT_MODIFICATION,
            format!(
                "Session {session_id} was modified concurrently (expected version {expected}, \
                 found {actual})"
            ),
        )
    }

    pub fn invalid_state_transition(
        session_id: impl std::fmt::Display,
        from: impl std::fmt::Display,
        attempted: impl std::fmt::Display,
    ) -> Self {
        Self::new(
            ErrorKind::BadRequest,
            INVALID_STATE_TRANSITION,
            format!("Session {session_id} cannot move from {from} to {attempted}"),
        )
    }

    pub fn validation_error(
        msg: impl Into<Cow<'static, str>>,
        details: Vec<FieldViolation>,
    ) -> Self {
        Self {
            details,
            ..Self::new(ErrorKind::BadRequest, VALIDATION_ERROR, msg)
        }
    }

    /// Corrupt payload under a session key. Session-fatal; the caller cannot
    /// recover and an operator should look at the raw bytes (logged).
    pub fn state_deserialization(session_id: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::InternalServerError,
            STATE_DESERIALIZATION_ERROR,
            format!("Stored state for session {session_id} could not be decoded"),
        )
    }

    pub fn rate_limited(msg: impl Into<Cow<'static, str>>, retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(ErrorKind::RateLimited, RATE_LIMIT_EXCEEDED, msg)
        }
    }

    pub fn operational_internal_server_error() -> Self {
        Self::new(
            ErrorKind::InternalServerError,
            INTERNAL_SERVER_ERROR,
            INTERNAL_SERVER_ERROR_MSG,
        )
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_bad_request(&self) -> bool {
        self.kind == ErrorKind::BadRequest
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == ErrorKind::RateLimited
    }

    pub fn is_overloaded(&self) -> bool {
        self.kind == ErrorKind::Overloaded
    }

    /// True when the error is deterministically the caller's fault, so it is
    /// logged quietly and never pages anyone.
    pub fn is_deterministic_user_error(&self) -> bool {
        match self.kind {
            ErrorKind::BadRequest | ErrorKind::NotFound | ErrorKind::RateLimited => true,
            ErrorKind::Conflict
            | ErrorKind::ClientDisconnect
            | ErrorKind::Overloaded
            | ErrorKind::InternalServerError => false,
        }
    }
}

impl ErrorKind {
    pub fn http_status_code(&self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ClientDisconnect => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Read [`ErrorMetadata`] back off an `anyhow::Error`. Untagged chains
/// classify as internal server errors.
pub trait ErrorMetadataAnyhowExt {
    fn metadata(&self) -> Option<&ErrorMetadata>;
    fn is_conflict(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_bad_request(&self) -> bool;
    fn is_rate_limited(&self) -> bool;
    fn is_deterministic_user_error(&self) -> bool;
    fn short_code(&self) -> &str;
    fn user_facing_message(&self) -> String;
    fn http_status(&self) -> StatusCode;
    fn retry_after(&self) -> Option<Duration>;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn is_conflict(&self) -> bool {
        self.metadata().is_some_and(ErrorMetadata::is_conflict)
    }

    fn is_not_found(&self) -> bool {
        self.metadata().is_some_and(ErrorMetadata::is_not_found)
    }

    fn is_bad_request(&self) -> bool {
        self.metadata().is_some_and(ErrorMetadata::is_bad_request)
    }

    fn is_rate_limited(&self) -> bool {
        self.metadata().is_some_and(ErrorMetadata::is_rate_limited)
    }

    fn is_deterministic_user_error(&self) -> bool {
        self.metadata()
            .is_some_and(ErrorMetadata::is_deterministic_user_error)
    }

    /// The stable code, or `INTERNAL_SERVER_ERROR` for untagged chains.
    fn short_code(&self) -> &str {
        self.metadata()
            .map_or(INTERNAL_SERVER_ERROR, |e| e.code.as_ref())
    }

    /// The message safe to show a client. Untagged chains get a generic
    /// message so internals never leak.
    fn user_facing_message(&self) -> String {
        self.metadata()
            .map_or_else(|| INTERNAL_SERVER_ERROR_MSG.to_owned(), |e| e.msg.to_string())
    }

    fn http_status(&self) -> StatusCode {
        self.metadata()
            .map_or(StatusCode::INTERNAL_SERVER_ERROR, |e| {
                e.kind.http_status_code()
            })
    }

    fn retry_after(&self) -> Option<Duration> {
        self.metadata().and_then(|e| e.retry_after)
    }
}

/// Logs an error at a severity derived from its classification and bumps the
/// per-code counter. The single funnel for "something went wrong" across the
/// service.
pub fn report_error(err: &anyhow::Error) {
    metrics::log_error_reported(err.short_code());
    if err.is_deterministic_user_error() {
        tracing::debug!("client error: {err:#}");
    } else if err.is_conflict() {
        // Conflicts are expected under contention; only the volume matters.
        tracing::info!("commit race: {err:#}");
    } else {
        tracing::error!("server error: {err:#}");
        tracing::debug!("{err:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_chain_classifies() {
        let err: anyhow::Error =
            anyhow::anyhow!("root cause").context(ErrorMetadata::session_not_found("abc"));
        assert!(err.is_not_found());
        assert_eq!(err.short_code(), SESSION_NOT_FOUND);
        assert_eq!(err.http_status(), StatusCode::NOT_FOUND);
        assert!(err.user_facing_message().contains("abc"));
    }

    #[test]
    fn untagged_chain_is_internal() {
        let err = anyhow::anyhow!("redis exploded");
        assert_eq!(err.short_code(), INTERNAL_SERVER_ERROR);
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        // Internals must not leak to clients.
        assert!(!err.user_facing_message().contains("redis"));
    }

    #[test]
    fn conflict_carries_versions() {
        let meta = ErrorMetadata::concurrent_modification("s", 3, 5);
        assert!(meta.is_conflict());
        assert_eq!(meta.kind.http_status_code(), StatusCode::CONFLICT);
        assert!(meta.msg.contains("expected version 3"));
        assert!(meta.msg.contains("found 5"));
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err: anyhow::Error =
            ErrorMetadata::rate_limited("Too many switch requests", Duration::from_secs(2)).into();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(err.http_status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn validation_details_serialize() {
        let meta = ErrorMetadata::validation_error(
            "invalid session config",
            vec![FieldViolation::new("participants", "non_empty")],
        );
        let json = serde_json::to_value(&meta.details).unwrap();
        assert_eq!(json[0]["field"], "participants");
        assert_eq!(json[0]["constraint"], "non_empty");
    }
}
