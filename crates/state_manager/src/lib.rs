//! The state manager composes the primary store and the audit queue into the
//! mutation primitives the sync engine and the fan-out gateway consume.
//!
//! Every mutation follows the same shape: bump the version, write with TTL
//! refresh, publish the new state on the update channel, and enqueue an
//! audit job. The store write is the only synchronization point; publish and
//! audit are fire-and-forget observers of a write that already happened.

use std::{
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use audit::{
    AuditEventType,
    AuditJob,
    AuditQueue,
};
use bytes::Bytes;
use chrono::{
    DateTime,
    Utc,
};
use errors::ErrorMetadata;
use futures::{
    Stream,
    StreamExt,
};
use serde::{
    Deserialize,
    Serialize,
};
use store::{
    CasOutcome,
    KeySpace,
    PrimaryStore,
};
use sync_types::{
    SessionId,
    SessionState,
};

mod metrics;

/// One channel for all sessions: every mutation in the fleet lands here.
pub const SESSION_UPDATES_CHANNEL: &str = "session-updates";

/// Pattern covering the per-session broadcast channels.
pub const WS_CHANNEL_PATTERN: &str = "ws:*";

pub fn ws_channel(session_id: SessionId) -> String {
    format!("ws:{session_id}")
}

/// Wire envelope on [`SESSION_UPDATES_CHANNEL`]. A null `state` is the
/// deletion sentinel; TTL expiries publish nothing, by convention.
#[derive(Debug, Serialize, Deserialize)]
struct UpdateEnvelope {
    session_id: SessionId,
    state: Option<SessionState>,
    timestamp: DateTime<Utc>,
}

/// A state change observed via the cross-instance update channel.
#[derive(Clone, Debug)]
pub struct SessionUpdate {
    pub session_id: SessionId,
    /// `None` means the session was deleted.
    pub state: Option<SessionState>,
}

/// An opaque payload addressed to everyone watching one session, not tied to
/// a state change.
#[derive(Clone, Debug)]
pub struct SessionBroadcast {
    pub session_id: SessionId,
    pub payload: Bytes,
}

pub type UpdateStream = Pin<Box<dyn Stream<Item = SessionUpdate> + Send>>;
pub type BroadcastStream = Pin<Box<dyn Stream<Item = SessionBroadcast> + Send>>;

pub struct StateManager {
    store: Arc<dyn PrimaryStore>,
    audit: Arc<AuditQueue>,
    keys: KeySpace,
    ttl: Duration,
}

impl StateManager {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        audit: Arc<AuditQueue>,
        keys: KeySpace,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            audit,
            keys,
            ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn PrimaryStore> {
        &self.store
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    pub fn audit_queue(&self) -> &Arc<AuditQueue> {
        &self.audit
    }

    /// Missing keys are `None`; corrupt payloads are session-fatal and carry
    /// the raw bytes to the log for forensics.
    pub async fn get_session(&self, session_id: SessionId) -> anyhow::Result<Option<SessionState>> {
        let key = self.keys.session_key(session_id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<SessionState>(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::error!(
                    %session_id,
                    payload = %String::from_utf8_lossy(&bytes),
                    "corrupt session payload: {e}"
                );
                Err(anyhow::Error::new(e)
                    .context(ErrorMetadata::state_deserialization(session_id)))
            },
        }
    }

    /// Unconditional first write at version 1, then publish + audit.
    pub async fn create_session(&self, mut state: SessionState) -> anyhow::Result<SessionState> {
        let _timer = metrics::mutation_timer("create");
        state.version = 1;
        let key = self.keys.session_key(state.session_id);
        let bytes = serialize_state(&state)?;
        self.store.set_with_ttl(&key, bytes, self.ttl).await?;
        self.publish_state(state.session_id, Some(&state)).await;
        self.audit.enqueue(AuditJob::new(
            state.session_id,
            AuditEventType::SessionCreated,
            Some(state.clone()),
        ));
        Ok(state)
    }

    /// Version-checked write. With `expected_version` the caller's read is
    /// the CAS token; without it, the current stored version is fetched and
    /// used. Either way the state is persisted at `expected + 1` and the
    /// in-state version field matches what was written.
    pub async fn update_session(
        &self,
        session_id: SessionId,
        mut state: SessionState,
        expected_version: Option<u64>,
        event_type: AuditEventType,
    ) -> anyhow::Result<SessionState> {
        let _timer = metrics::mutation_timer("update");
        let expected = match expected_version {
            Some(version) => version,
            None => self
                .get_session(session_id)
                .await?
                .ok_or_else(|| ErrorMetadata::session_not_found(session_id))?
                .version,
        };
        state.version = expected + 1;
        let key = self.keys.session_key(session_id);
        let bytes = serialize_state(&state)?;
        match self
            .store
            .compare_and_set_with_ttl(&key, expected, bytes, self.ttl)
            .await?
        {
            CasOutcome::Written => {},
            CasOutcome::VersionMismatch { actual } => {
                return Err(ErrorMetadata::concurrent_modification(
                    session_id, expected, actual,
                )
                .into());
            },
            CasOutcome::Missing => {
                return Err(ErrorMetadata::session_not_found(session_id).into());
            },
        }
        self.publish_state(session_id, Some(&state)).await;
        self.audit
            .enqueue(AuditJob::new(session_id, event_type, Some(state.clone())));
        Ok(state)
    }

    /// Deletes the key, publishes the deletion sentinel, and enqueues the
    /// final audit event (with the last observed state when readable).
    pub async fn delete_session(&self, session_id: SessionId) -> anyhow::Result<()> {
        let _timer = metrics::mutation_timer("delete");
        // Best-effort snapshot for the audit trail; a corrupt payload must
        // not block deletion.
        let last_state = self.get_session(session_id).await.unwrap_or(None);
        let key = self.keys.session_key(session_id);
        if !self.store.delete(&key).await? {
            return Err(ErrorMetadata::session_not_found(session_id).into());
        }
        self.publish_state(session_id, None).await;
        self.audit.enqueue(AuditJob::new(
            session_id,
            AuditEventType::SessionDeleted,
            last_state,
        ));
        Ok(())
    }

    /// One long-lived subscription per instance; the gateway establishes it
    /// before accepting its first connection.
    pub async fn subscribe_to_updates(&self) -> anyhow::Result<UpdateStream> {
        let stream = self.store.subscribe(SESSION_UPDATES_CHANNEL).await?;
        Ok(Box::pin(stream.filter_map(|message| {
            let update = match serde_json::from_slice::<UpdateEnvelope>(&message.payload) {
                Ok(envelope) => Some(SessionUpdate {
                    session_id: envelope.session_id,
                    state: envelope.state,
                }),
                Err(e) => {
                    tracing::warn!("undecodable update envelope: {e}");
                    None
                },
            };
            futures::future::ready(update)
        })))
    }

    /// Cross-instance broadcasts not tied to a state change (`ws:*`).
    pub async fn subscribe_to_broadcasts(&self) -> anyhow::Result<BroadcastStream> {
        let stream = self.store.psubscribe(WS_CHANNEL_PATTERN).await?;
        Ok(Box::pin(stream.filter_map(|message| {
            let broadcast = match message
                .channel
                .strip_prefix("ws:")
                .and_then(|raw| raw.parse::<SessionId>().ok())
            {
                Some(session_id) => Some(SessionBroadcast {
                    session_id,
                    payload: message.payload,
                }),
                None => {
                    tracing::warn!(channel = %message.channel, "unroutable broadcast channel");
                    None
                },
            };
            futures::future::ready(broadcast)
        })))
    }

    /// Publishes on the per-session channel without touching state.
    pub async fn broadcast_to_session(
        &self,
        session_id: SessionId,
        payload: Bytes,
    ) -> anyhow::Result<()> {
        self.store.publish(&ws_channel(session_id), payload).await
    }

    /// Drains the audit queue and closes store connections. Publishes are
    /// fire-and-forget, so anything already awaited has left the building.
    pub async fn close(&self) {
        self.audit.close().await;
        self.store.close().await;
    }

    async fn publish_state(&self, session_id: SessionId, state: Option<&SessionState>) {
        let envelope = UpdateEnvelope {
            session_id,
            state: state.cloned(),
            timestamp: Utc::now(),
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                tracing::error!(%session_id, "failed to encode update envelope: {e}");
                return;
            },
        };
        // A failed publish must not fail the mutation: the write is durable
        // and clients recover via RECONNECT resync.
        if let Err(e) = self
            .store
            .publish(SESSION_UPDATES_CHANNEL, payload)
            .await
        {
            tracing::warn!(%session_id, "failed to publish state update: {e:#}");
        }
    }
}

fn serialize_state(state: &SessionState) -> anyhow::Result<Bytes> {
    let bytes = serde_json::to_vec(state).context("failed to serialize session state")?;
    Ok(Bytes::from(bytes))
}
