use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    ids::SessionId,
    session::SessionState,
};

/// Messages a client may send over an established socket. Anything else is
/// logged and ignored; a bad message never tears down the connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Liveness probe; answered with [`ServerMessage::Pong`].
    Ping,
    /// Request a full-state resync after a reconnect or suspected gap.
    Reconnect,
}

/// Messages the server sends to connected clients. The envelope fields are
/// camelCase on the wire (`sessionId`); the embedded state document keeps its
/// stored snake_case form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },
    /// Full-state snapshot after a mutation somewhere in the fleet. Clients
    /// diff against their previous snapshot; any update heals missed ones.
    #[serde(rename_all = "camelCase")]
    StateUpdate {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
        state: SessionState,
    },
    /// Full-state snapshot in response to [`ClientMessage::Reconnect`].
    #[serde(rename_all = "camelCase")]
    StateSync {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
        state: SessionState,
    },
    #[serde(rename_all = "camelCase")]
    SessionDeleted {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Pong { timestamp: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug)]
pub enum ParsedClientMessage {
    Message(ClientMessage),
    /// Valid JSON carrying a `type` tag outside the closed set.
    UnknownType(String),
    /// Not valid JSON (or not an object).
    Malformed(serde_json::Error),
}

/// Decodes a client frame, distinguishing unknown tags from garbage so the
/// caller can log them differently. Neither case is fatal to the connection.
pub fn parse_client_message(text: &str) -> ParsedClientMessage {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return ParsedClientMessage::Malformed(e),
    };
    match serde_json::from_value::<ClientMessage>(value.clone()) {
        Ok(message) => ParsedClientMessage::Message(message),
        Err(e) => {
            let tag = value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("<missing>")
                .to_owned();
            if tag == "<missing>" {
                ParsedClientMessage::Malformed(e)
            } else {
                ParsedClientMessage::UnknownType(tag)
            }
        },
    }
}
