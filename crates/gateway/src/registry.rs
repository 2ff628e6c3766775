use std::{
    collections::HashMap,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use sync_types::{
    ServerMessage,
    SessionId,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// Close codes this gateway uses.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

pub(crate) type ConnectionId = u64;

/// What the writer half of a connection consumes, in order.
#[derive(Debug)]
pub(crate) enum OutboundMessage {
    Message(ServerMessage),
    /// Opaque cross-instance broadcast, forwarded verbatim as a text frame.
    Raw(Bytes),
    /// Heartbeat probe (protocol-level ping frame).
    Ping,
    Close { code: u16, reason: String },
}

pub(crate) struct ConnectionHandle {
    sender: mpsc::Sender<OutboundMessage>,
    /// Cancelled to terminate a connection whose send queue overran.
    kill: CancellationToken,
}

/// The local per-session connection sets. Membership is mutated only by
/// connect/disconnect handlers and the subscription pumps; deliveries work
/// on a snapshot so no lock is held across a send.
#[derive(Default)]
pub struct SessionRegistry {
    connections: Mutex<HashMap<SessionId, HashMap<ConnectionId, ConnectionHandle>>>,
    next_connection_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection and hands back its id, outbound queue, and kill
    /// token. `queue_depth` bounds how far a slow client may fall behind
    /// before it is disconnected.
    pub(crate) fn register(
        &self,
        session_id: SessionId,
        queue_depth: usize,
    ) -> (
        ConnectionId,
        mpsc::Sender<OutboundMessage>,
        mpsc::Receiver<OutboundMessage>,
        CancellationToken,
    ) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(queue_depth);
        let kill = CancellationToken::new();
        self.connections.lock().entry(session_id).or_default().insert(
            connection_id,
            ConnectionHandle {
                sender: sender.clone(),
                kill: kill.clone(),
            },
        );
        metrics::log_connection_opened();
        (connection_id, sender, receiver, kill)
    }

    pub(crate) fn unregister(&self, session_id: SessionId, connection_id: ConnectionId) {
        let mut connections = self.connections.lock();
        if let Some(session) = connections.get_mut(&session_id) {
            if session.remove(&connection_id).is_some() {
                metrics::log_connection_closed();
            }
            if session.is_empty() {
                connections.remove(&session_id);
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().values().map(HashMap::len).sum()
    }

    pub fn session_connection_count(&self, session_id: SessionId) -> usize {
        self.connections
            .lock()
            .get(&session_id)
            .map_or(0, HashMap::len)
    }

    /// Enqueues `message` for every local connection on `session_id`. A full
    /// queue means the client stopped draining; that connection is killed
    /// rather than letting it back-pressure the subscription loop.
    pub(crate) fn deliver(
        &self,
        session_id: SessionId,
        message: impl Fn() -> OutboundMessage,
    ) {
        let handles: Vec<(ConnectionId, mpsc::Sender<OutboundMessage>)> = {
            let connections = self.connections.lock();
            match connections.get(&session_id) {
                Some(session) => session
                    .iter()
                    .map(|(id, handle)| (*id, handle.sender.clone()))
                    .collect(),
                None => return,
            }
        };
        for (connection_id, sender) in handles {
            match sender.try_send(message()) {
                Ok(()) => metrics::log_message_out(),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        %session_id,
                        connection_id,
                        "send queue overrun; disconnecting slow consumer"
                    );
                    metrics::log_slow_consumer_disconnect();
                    self.kill(session_id, connection_id);
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.unregister(session_id, connection_id);
                },
            }
        }
    }

    /// Removes the whole session set (after a deletion) and enqueues the
    /// goodbye sequence on each former member.
    pub(crate) fn drain_session(&self, session_id: SessionId) {
        let Some(session) = self.connections.lock().remove(&session_id) else {
            return;
        };
        let now = chrono::Utc::now();
        for (_, handle) in session {
            let _ = handle.sender.try_send(OutboundMessage::Message(
                ServerMessage::SessionDeleted {
                    session_id,
                    timestamp: now,
                },
            ));
            let _ = handle.sender.try_send(OutboundMessage::Close {
                code: CLOSE_NORMAL,
                reason: "Session deleted".to_owned(),
            });
            metrics::log_connection_closed();
        }
    }

    /// Kills one connection (queue overrun or policy): its socket worker
    /// observes the token and closes.
    fn kill(&self, session_id: SessionId, connection_id: ConnectionId) {
        let mut connections = self.connections.lock();
        if let Some(session) = connections.get_mut(&session_id) {
            if let Some(handle) = session.remove(&connection_id) {
                handle.kill.cancel();
                metrics::log_connection_closed();
            }
            if session.is_empty() {
                connections.remove(&session_id);
            }
        }
    }
}
