use std::{
    collections::HashMap,
    sync::atomic::{
        AtomicU32,
        Ordering,
    },
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use parking_lot::Mutex;
use sync_types::{
    ParticipantId,
    SessionId,
    SessionStatus,
    SyncMode,
};
use uuid::Uuid;

use crate::{
    AuditEventType,
    AuditJob,
    AuditLogSink,
    SinkError,
};

/// What the `events` log records per job.
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub session_id: SessionId,
    pub event_type: AuditEventType,
    pub participant_id: Option<ParticipantId>,
    pub time_remaining_ms: Option<i64>,
    pub occurred_at: DateTime<Utc>,
    pub state_snapshot: Option<serde_json::Value>,
}

/// Current aggregate row in the by-session projection.
#[derive(Clone, Debug)]
pub struct SessionProjection {
    pub sync_mode: Option<SyncMode>,
    pub status: Option<SessionStatus>,
    pub participant_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// In-memory [`AuditLogSink`]: the unit-test double for the Postgres sink,
/// with injectable failures so the queue's retry ladder can be exercised
/// deterministically.
#[derive(Default)]
pub struct MemoryAuditLog {
    sessions: Mutex<HashMap<SessionId, SessionProjection>>,
    events: Mutex<Vec<RecordedEvent>>,
    persist_calls: AtomicU32,
    fail_transient: AtomicU32,
    fail_permanent: AtomicU32,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` persist calls fail with a connection-class error.
    pub fn fail_next_transient(&self, n: u32) {
        self.fail_transient.store(n, Ordering::SeqCst);
    }

    /// The next `n` persist calls fail with a constraint-class error.
    pub fn fail_next_permanent(&self, n: u32) {
        self.fail_permanent.store(n, Ordering::SeqCst);
    }

    pub fn persist_calls(&self) -> u32 {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, session_id: SessionId) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn projected_status(&self, session_id: SessionId) -> Option<SessionStatus> {
        self.sessions
            .lock()
            .get(&session_id)
            .and_then(|p| p.status)
    }

    pub fn projection(&self, session_id: SessionId) -> Option<SessionProjection> {
        self.sessions.lock().get(&session_id).cloned()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AuditLogSink for MemoryAuditLog {
    async fn persist(&self, job: &AuditJob) -> Result<(), SinkError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_transient) {
            return Err(SinkError::Transient(anyhow::anyhow!(
                "injected connection failure"
            )));
        }
        if Self::take_failure(&self.fail_permanent) {
            return Err(SinkError::Permanent(anyhow::anyhow!(
                "injected constraint violation"
            )));
        }

        // Both writes under one lock scope stand in for the transaction.
        let snapshot = job.state_snapshot.as_ref();
        let active = snapshot.and_then(|s| s.active_participant());
        self.sessions.lock().insert(
            job.session_id,
            SessionProjection {
                sync_mode: snapshot.map(|s| s.sync_mode),
                status: snapshot.map(|s| s.status),
                participant_count: snapshot.map_or(0, |s| s.participants.len()),
                updated_at: job.timestamp,
            },
        );
        self.events.lock().push(RecordedEvent {
            event_id: Uuid::new_v4(),
            session_id: job.session_id,
            event_type: job.event_type,
            participant_id: active.map(|p| p.participant_id.clone()),
            time_remaining_ms: active.map(|p| p.time_remaining_ms),
            occurred_at: job.timestamp,
            state_snapshot: snapshot
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| SinkError::Permanent(e.into()))?,
        });
        Ok(())
    }
}
