//! The asynchronous audit pipeline.
//!
//! Every state transition enqueues an [`AuditJob`]; a worker pool persists
//! them to an append-only log (PostgreSQL in production) off the hot path.
//! The audit log is history, not truth: after exhaustive retries a job may be
//! dropped (and surfaced to operators), and the primary store must always be
//! recoverable from its own contents alone.

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use sync_types::{
    SessionId,
    SessionState,
};

mod memory;
mod metrics;
mod postgres;
mod queue;

pub use memory::{
    MemoryAuditLog,
    RecordedEvent,
    SessionProjection,
};
pub use postgres::PostgresAuditLog;
pub use queue::{
    AuditQueue,
    AuditQueueConfig,
    DeadJob,
    QueueStatsSnapshot,
};

/// Tags describing what happened. Opaque to the queue itself; the sink
/// writes them verbatim into the event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionCreated,
    SessionUpdated,
    SessionStarted,
    CycleSwitched,
    SessionPaused,
    SessionResumed,
    SessionCompleted,
    SessionCancelled,
    SessionDeleted,
    ParticipantAdded,
    ParticipantRemoved,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionUpdated => "session_updated",
            Self::SessionStarted => "session_started",
            Self::CycleSwitched => "cycle_switched",
            Self::SessionPaused => "session_paused",
            Self::SessionResumed => "session_resumed",
            Self::SessionCompleted => "session_completed",
            Self::SessionCancelled => "session_cancelled",
            Self::SessionDeleted => "session_deleted",
            Self::ParticipantAdded => "participant_added",
            Self::ParticipantRemoved => "participant_removed",
        }
    }
}

/// One unit of audit work: the full state snapshot at the moment of the
/// transition. The snapshot is absent only for deletions, where the state is
/// already gone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditJob {
    pub session_id: SessionId,
    pub event_type: AuditEventType,
    pub state_snapshot: Option<SessionState>,
    pub timestamp: DateTime<Utc>,
}

impl AuditJob {
    pub fn new(
        session_id: SessionId,
        event_type: AuditEventType,
        state_snapshot: Option<SessionState>,
    ) -> Self {
        Self {
            session_id,
            event_type,
            state_snapshot,
            timestamp: Utc::now(),
        }
    }
}

/// How a failed persist attempt should be handled.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Connection-class failure (refused, timed out, pool exhausted):
    /// worth retrying.
    #[error("transient audit sink failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// Constraint or schema violation: retrying can never succeed, so the
    /// job is logged and completed without retry.
    #[error("permanent audit sink failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

/// Durable destination for audit jobs. One call persists one job in one
/// atomic transaction: the by-session projection upsert and the append-only
/// event insert commit or roll back together.
#[async_trait]
pub trait AuditLogSink: Send + Sync + 'static {
    async fn persist(&self, job: &AuditJob) -> Result<(), SinkError>;
}
