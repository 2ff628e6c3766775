use async_trait::async_trait;
use chrono::Utc;
use errors::ErrorMetadataAnyhowExt;
use sync_types::{
    parse_client_message,
    ClientMessage,
    ParsedClientMessage,
    ServerMessage,
    SessionId,
};
use tokio::sync::mpsc;

use crate::{
    metrics,
    registry::{
        OutboundMessage,
        CLOSE_GOING_AWAY,
        CLOSE_POLICY_VIOLATION,
    },
    FanoutGateway,
};

/// Write half of a client connection. The axum adapter lives in the server
/// crate; tests use an in-memory pair.
#[async_trait]
pub trait SocketSink: Send + 'static {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;
    async fn send_ping(&mut self) -> anyhow::Result<()>;
    async fn close(&mut self, code: u16, reason: &str) -> anyhow::Result<()>;
}

/// Read half of a client connection.
#[async_trait]
pub trait SocketStream: Send + 'static {
    /// `None` when the peer is gone.
    async fn recv(&mut self) -> Option<anyhow::Result<InboundFrame>>;
}

#[derive(Debug)]
pub enum InboundFrame {
    Text(String),
    /// Reply to our heartbeat probe.
    Pong,
    Close,
    /// Binary or other frames we do not speak; ignored.
    Other,
}

/// How long a closing connection may spend flushing its outbound queue.
const WRITER_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Drives one accepted connection until the client leaves, the session is
/// deleted, the connection falls too far behind, or the process shuts down.
pub(crate) async fn run_connection(
    gateway: &FanoutGateway,
    mut sink: Box<dyn SocketSink>,
    mut stream: Box<dyn SocketStream>,
    session_id: SessionId,
) {
    let (connection_id, sender, mut receiver, kill) = gateway
        .registry()
        .register(session_id, gateway.config().send_queue_depth);
    tracing::debug!(%session_id, connection_id, "connection established");

    let _ = sender
        .send(OutboundMessage::Message(ServerMessage::Connected {
            session_id,
            timestamp: Utc::now(),
        }))
        .await;

    // Single-writer discipline: everything that reaches the wire goes
    // through the outbound queue and this task.
    let mut writer = tokio::spawn(async move {
        while let Some(out) = receiver.recv().await {
            let result = match out {
                OutboundMessage::Message(message) => match serde_json::to_string(&message) {
                    Ok(text) => sink.send_text(text).await,
                    Err(e) => {
                        tracing::error!("failed to encode server message: {e}");
                        continue;
                    },
                },
                OutboundMessage::Raw(payload) => match String::from_utf8(payload.to_vec()) {
                    Ok(text) => sink.send_text(text).await,
                    Err(_) => {
                        tracing::warn!("dropping non-utf8 broadcast payload");
                        continue;
                    },
                },
                OutboundMessage::Ping => sink.send_ping().await,
                OutboundMessage::Close { code, reason } => {
                    let _ = sink.close(code, &reason).await;
                    return;
                },
            };
            if result.is_err() {
                // Peer went away mid-send; the reader will notice too.
                return;
            }
        }
    });

    let mut heartbeat = tokio::time::interval(gateway.config().heartbeat_interval);
    // The first tick fires immediately; skip it so the client gets a full
    // interval before the first probe.
    heartbeat.tick().await;
    let mut responsive = true;

    let shutdown = gateway.shutdown_token();
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                let _ = sender.try_send(OutboundMessage::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "Server shutting down".to_owned(),
                });
                break;
            },
            () = kill.cancelled() => {
                let _ = sender.try_send(OutboundMessage::Close {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: "Send queue overrun".to_owned(),
                });
                break;
            },
            _ = &mut writer => {
                // Writer finished (close sent or peer gone); nothing more to do.
                break;
            },
            _ = heartbeat.tick() => {
                if !responsive {
                    tracing::debug!(%session_id, connection_id, "heartbeat timeout");
                    metrics::log_heartbeat_timeout();
                    let _ = sender.try_send(OutboundMessage::Close {
                        code: CLOSE_POLICY_VIOLATION,
                        reason: "Heartbeat timeout".to_owned(),
                    });
                    break;
                }
                responsive = false;
                let _ = sender.try_send(OutboundMessage::Ping);
            },
            frame = stream.recv() => match frame {
                Some(Ok(InboundFrame::Text(text))) => {
                    responsive = true;
                    metrics::log_message_in();
                    handle_client_message(gateway, &sender, session_id, &text).await;
                },
                Some(Ok(InboundFrame::Pong)) => {
                    responsive = true;
                },
                Some(Ok(InboundFrame::Other)) => {},
                Some(Ok(InboundFrame::Close)) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(%session_id, connection_id, "socket error: {e:#}");
                    break;
                },
            },
        }
    }

    gateway.registry().unregister(session_id, connection_id);
    // Let the writer flush whatever is already queued (the registry's sender
    // clone is gone once unregistered; ours closes the channel on drop). A
    // peer that stopped reading can wedge the flush, so it is bounded.
    drop(sender);
    if !writer.is_finished()
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
    {
        writer.abort();
    }
    tracing::debug!(%session_id, connection_id, "connection closed");
}

/// One inbound text frame. Bad input never tears the connection down.
async fn handle_client_message(
    gateway: &FanoutGateway,
    sender: &mpsc::Sender<OutboundMessage>,
    session_id: SessionId,
    text: &str,
) {
    let message = match parse_client_message(text) {
        ParsedClientMessage::Message(message) => message,
        ParsedClientMessage::UnknownType(tag) => {
            tracing::debug!(%session_id, %tag, "ignoring unknown client message type");
            return;
        },
        ParsedClientMessage::Malformed(e) => {
            tracing::debug!(%session_id, "ignoring malformed client message: {e}");
            return;
        },
    };
    match message {
        ClientMessage::Ping => {
            let _ = sender.try_send(OutboundMessage::Message(ServerMessage::Pong {
                timestamp: Utc::now(),
            }));
        },
        ClientMessage::Reconnect => {
            let reply = match gateway.state_manager().get_session(session_id).await {
                Ok(Some(state)) => ServerMessage::StateSync {
                    session_id,
                    timestamp: Utc::now(),
                    state,
                },
                Ok(None) => ServerMessage::Error {
                    code: errors::SESSION_NOT_FOUND.to_owned(),
                    message: format!("Session {session_id} does not exist or has expired"),
                },
                Err(e) => {
                    errors::report_error(&e);
                    ServerMessage::Error {
                        code: e.short_code().to_owned(),
                        message: e.user_facing_message(),
                    }
                },
            };
            let _ = sender.try_send(OutboundMessage::Message(reply));
        },
    }
}
