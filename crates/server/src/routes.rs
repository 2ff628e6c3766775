use axum::{
    body::Bytes,
    extract::{
        ConnectInfo,
        Path,
        Request,
        State,
    },
    middleware::Next,
    response::{
        IntoResponse,
        Response,
    },
    Json,
};
use engine::{
    ParticipantConfig,
    SessionConfig,
};
use errors::ErrorMetadata;
use http::StatusCode;
use serde::Deserialize;
use sync_types::{
    ParticipantId,
    SessionId,
};

use crate::{
    http::{
        created,
        ok,
        HttpResponseError,
    },
    AppState,
};

type HandlerResult = Result<Response, HttpResponseError>;

/// Bodies are parsed by hand so malformed JSON produces the `{error}`
/// envelope instead of the framework's plain-text rejection.
fn parse_json_body<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<T, HttpResponseError> {
    serde_json::from_slice(bytes).map_err(|e| {
        ErrorMetadata::validation_error(format!("Invalid request body: {e}"), vec![]).into()
    })
}

fn parse_session_id(raw: &str) -> Result<SessionId, HttpResponseError> {
    raw.parse().map_err(|_| {
        ErrorMetadata::validation_error(
            format!("'{raw}' is not a valid v4 session id"),
            vec![errors::FieldViolation::new("session_id", "uuid_v4")],
        )
        .into()
    })
}

pub async fn create_session(State(app): State<AppState>, body: Bytes) -> HandlerResult {
    let config: SessionConfig = parse_json_body(&body)?;
    let state = app.engine.create_session(config).await?;
    Ok(created(state))
}

pub async fn get_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    let state = app.engine.get_current_state(session_id).await?;
    Ok(ok(state))
}

pub async fn delete_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    app.engine.delete_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn start_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    let state = app.engine.start_session(session_id).await?;
    Ok(ok(state))
}

#[derive(Debug, Default, Deserialize)]
pub struct SwitchRequest {
    #[serde(default)]
    pub current_participant_id: Option<ParticipantId>,
    #[serde(default)]
    pub next_participant_id: Option<ParticipantId>,
}

pub async fn switch_cycle(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    app.rate_limiter.check_switch(session_id).await?;
    let request: SwitchRequest = if body.is_empty() {
        SwitchRequest::default()
    } else {
        parse_json_body(&body)?
    };
    let outcome = app
        .engine
        .switch_cycle(
            session_id,
            request.current_participant_id.as_ref(),
            request.next_participant_id.as_ref(),
        )
        .await?;
    Ok(ok(outcome))
}

pub async fn pause_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    let state = app.engine.pause_session(session_id).await?;
    Ok(ok(state))
}

pub async fn resume_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    let state = app.engine.resume_session(session_id).await?;
    Ok(ok(state))
}

pub async fn complete_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    let state = app.engine.complete_session(session_id).await?;
    Ok(ok(state))
}

pub async fn cancel_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    let state = app.engine.cancel_session(session_id).await?;
    Ok(ok(state))
}

pub async fn add_participant(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    let participant: ParticipantConfig = parse_json_body(&body)?;
    let state = app.engine.add_participant(session_id, participant).await?;
    Ok(ok(state))
}

pub async fn remove_participant(
    State(app): State<AppState>,
    Path((id, participant_id)): Path<(String, String)>,
) -> HandlerResult {
    let session_id = parse_session_id(&id)?;
    let participant_id: ParticipantId = participant_id.parse().map_err(|_| {
        HttpResponseError::from(ErrorMetadata::validation_error(
            "Invalid participant id",
            vec![errors::FieldViolation::new("participant_id", "non_empty")],
        ))
    })?;
    let state = app
        .engine
        .remove_participant(session_id, &participant_id)
        .await?;
    Ok(ok(state))
}

/// Clock endpoint for the calculate-don't-count client model: clients anchor
/// their local countdown against this server timestamp.
pub async fn server_time() -> Response {
    Json(serde_json::json!({
        "timestamp_ms": chrono::Utc::now().timestamp_millis(),
        "server_version": env!("CARGO_PKG_VERSION"),
        "drift_tolerance_ms": 50,
    }))
    .into_response()
}

pub async fn health() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

pub async fn ready(State(app): State<AppState>) -> Response {
    // Readiness means the fan-out subscriptions are live, which is implied
    // by the gateway having started; expose the connection count for
    // operators.
    Json(serde_json::json!({
        "status": "ready",
        "connections": app.gateway.connection_count(),
    }))
    .into_response()
}

pub async fn metrics() -> Response {
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => (
            [(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
    }
}

/// Per-IP fixed-window limit on the general API. Health, readiness, and
/// metrics are mounted outside this layer and stay exempt.
pub async fn ip_rate_limit(
    State(app): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, HttpResponseError> {
    // Absent ConnectInfo (some test harnesses) means no address to key on.
    if let Some(ConnectInfo(addr)) = request
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
    {
        app.rate_limiter.check_ip(addr.ip()).await?;
    }
    Ok(next.run(request).await)
}
