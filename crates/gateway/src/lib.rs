//! The fan-out gateway: persistent client connections keyed by session.
//!
//! Each instance holds exactly two long-lived subscriptions — the fleet-wide
//! state-update channel and the per-session broadcast pattern — established
//! before the listener accepts its first connection so there is no
//! silent-drop window. Incoming updates are delivered to every local
//! connection on the session through bounded per-connection queues; a client
//! that stops draining is disconnected rather than back-pressuring the
//! subscription loop.

use std::{
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use state_manager::{
    BroadcastStream,
    SessionUpdate,
    StateManager,
    UpdateStream,
};
use sync_types::{
    ServerMessage,
    SessionId,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod metrics;
mod registry;
mod socket;

pub use registry::{
    SessionRegistry,
    CLOSE_GOING_AWAY,
    CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION,
};
pub use socket::{
    InboundFrame,
    SocketSink,
    SocketStream,
};

use registry::OutboundMessage;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Probe cadence; a connection that misses one full interval is reaped.
    pub heartbeat_interval: Duration,
    /// Outbound queue depth per connection before it counts as too slow.
    pub send_queue_depth: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            send_queue_depth: 64,
        }
    }
}

pub struct FanoutGateway {
    registry: Arc<SessionRegistry>,
    state: Arc<StateManager>,
    config: GatewayConfig,
    shutdown: CancellationToken,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl FanoutGateway {
    /// Subscribes to both cross-instance channels and starts the delivery
    /// pumps. Call before binding the listener.
    pub async fn start(
        state: Arc<StateManager>,
        config: GatewayConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let updates = state.subscribe_to_updates().await?;
        let broadcasts = state.subscribe_to_broadcasts().await?;

        let gateway = Arc::new(Self {
            registry: Arc::new(SessionRegistry::new()),
            state,
            config,
            shutdown: CancellationToken::new(),
            pumps: Mutex::new(Vec::new()),
        });
        let pumps = vec![
            tokio::spawn(run_update_pump(
                gateway.registry.clone(),
                updates,
                gateway.shutdown.clone(),
            )),
            tokio::spawn(run_broadcast_pump(
                gateway.registry.clone(),
                broadcasts,
                gateway.shutdown.clone(),
            )),
        ];
        *gateway.pumps.lock() = pumps;
        Ok(gateway)
    }

    /// Drives one accepted connection to completion. The caller has already
    /// validated the session id (close 1008 otherwise).
    pub async fn handle_connection(
        &self,
        sink: Box<dyn SocketSink>,
        stream: Box<dyn SocketStream>,
        session_id: SessionId,
    ) {
        socket::run_connection(self, sink, stream, session_id).await;
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn session_connection_count(&self, session_id: SessionId) -> usize {
        self.registry.session_connection_count(session_id)
    }

    /// Stops the pumps and tells every open connection to close with 1001.
    /// Connection tasks unwind on their own once the token flips.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pumps = std::mem::take(&mut *self.pumps.lock());
        for pump in pumps {
            if let Err(e) = pump.await {
                tracing::warn!("fan-out pump terminated abnormally: {e}");
            }
        }
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub(crate) fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Fans state updates out to the local connection sets. A deletion sentinel
/// says goodbye to the whole set and discards it.
async fn run_update_pump(
    registry: Arc<SessionRegistry>,
    mut updates: UpdateStream,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            update = updates.next() => match update {
                Some(SessionUpdate { session_id, state: Some(state) }) => {
                    let timestamp = Utc::now();
                    registry.deliver(session_id, || {
                        OutboundMessage::Message(ServerMessage::StateUpdate {
                            session_id,
                            timestamp,
                            state: state.clone(),
                        })
                    });
                },
                Some(SessionUpdate { session_id, state: None }) => {
                    registry.drain_session(session_id);
                },
                None => {
                    tracing::error!("state-update subscription ended unexpectedly");
                    break;
                },
            },
        }
    }
}

/// Forwards per-session broadcasts verbatim to the local sets.
async fn run_broadcast_pump(
    registry: Arc<SessionRegistry>,
    mut broadcasts: BroadcastStream,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            broadcast = broadcasts.next() => match broadcast {
                Some(message) => {
                    registry.deliver(message.session_id, || {
                        OutboundMessage::Raw(message.payload.clone())
                    });
                },
                None => {
                    tracing::error!("broadcast subscription ended unexpectedly");
                    break;
                },
            },
        }
    }
}

#[cfg(test)]
mod tests;
