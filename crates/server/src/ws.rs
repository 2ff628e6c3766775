//! WebSocket ingress: query-parameter validation and the adapters bridging
//! axum's socket halves onto the gateway's sink/stream traits.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{
            CloseFrame,
            Message,
            WebSocket,
            WebSocketUpgrade,
        },
        Query,
        State,
    },
    response::Response,
};
use futures::{
    stream::{
        SplitSink,
        SplitStream,
    },
    SinkExt,
    StreamExt,
};
use gateway::{
    InboundFrame,
    SocketSink,
    SocketStream,
    CLOSE_POLICY_VIOLATION,
};
use sync_types::SessionId;

use crate::AppState;

pub async fn ws_handler(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match parse_session_param(params.get("sessionId").map(String::as_str)) {
            Ok(session_id) => {
                let (sink, stream) = socket.split();
                app.gateway
                    .handle_connection(
                        Box::new(AxumSocketSink { inner: sink }),
                        Box::new(AxumSocketStream { inner: stream }),
                        session_id,
                    )
                    .await;
            },
            Err(reason) => {
                // Policy close before any protocol traffic.
                let mut socket = socket;
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_POLICY_VIOLATION,
                        reason: reason.into(),
                    })))
                    .await;
            },
        }
    })
}

/// The contract for connection establishment: `sessionId` must be present
/// and a UUIDv4, otherwise the socket closes with 1008 and one of these
/// exact reasons.
pub fn parse_session_param(raw: Option<&str>) -> Result<SessionId, &'static str> {
    let raw = raw.ok_or("Missing sessionId parameter")?;
    raw.parse().map_err(|_| "Invalid sessionId format")
}

struct AxumSocketSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl SocketSink for AxumSocketSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(anyhow::Error::from)
    }

    async fn send_ping(&mut self) -> anyhow::Result<()> {
        self.inner
            .send(Message::Ping(bytes::Bytes::new()))
            .await
            .map_err(anyhow::Error::from)
    }

    async fn close(&mut self, code: u16, reason: &str) -> anyhow::Result<()> {
        self.inner
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_owned().into(),
            })))
            .await
            .map_err(anyhow::Error::from)
    }
}

struct AxumSocketStream {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl SocketStream for AxumSocketStream {
    async fn recv(&mut self) -> Option<anyhow::Result<InboundFrame>> {
        let frame = match self.inner.next().await? {
            Ok(Message::Text(text)) => Ok(InboundFrame::Text(text.as_str().to_owned())),
            Ok(Message::Pong(_)) => Ok(InboundFrame::Pong),
            Ok(Message::Close(_)) => Ok(InboundFrame::Close),
            // Pings are answered by the protocol layer; binary is not part
            // of this protocol.
            Ok(Message::Ping(_) | Message::Binary(_)) => Ok(InboundFrame::Other),
            Err(e) => Err(anyhow::Error::from(e)),
        };
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::parse_session_param;

    #[test]
    fn session_param_contract() {
        assert_eq!(
            parse_session_param(None).unwrap_err(),
            "Missing sessionId parameter"
        );
        assert_eq!(
            parse_session_param(Some("not-a-uuid")).unwrap_err(),
            "Invalid sessionId format"
        );
        // v1 UUIDs are structurally valid but the wrong version.
        assert_eq!(
            parse_session_param(Some("c232ab00-9414-11ec-b3c8-9f6bdeced846")).unwrap_err(),
            "Invalid sessionId format"
        );
        parse_session_param(Some("11111111-1111-4111-8111-111111111111")).unwrap();
    }
}
