use async_trait::async_trait;
use sqlx::postgres::{
    PgPool,
    PgPoolOptions,
};
use uuid::Uuid;

use crate::{
    AuditJob,
    AuditLogSink,
    SinkError,
};

const UPSERT_SESSION: &str = r"
INSERT INTO sessions (
    session_id, sync_mode, status, participant_count,
    total_time_ms, time_per_cycle_ms, increment_ms, max_time_ms,
    session_started_at, session_completed_at, created_at, updated_at, metadata
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
ON CONFLICT (session_id) DO UPDATE SET
    status = EXCLUDED.status,
    participant_count = EXCLUDED.participant_count,
    session_started_at = EXCLUDED.session_started_at,
    session_completed_at = EXCLUDED.session_completed_at,
    updated_at = EXCLUDED.updated_at
";

const INSERT_EVENT: &str = r"
INSERT INTO events (
    event_id, session_id, event_type, participant_id,
    time_remaining_ms, occurred_at, state_snapshot, metadata
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
";

/// PostgreSQL audit sink. Each job is one transaction: the by-session
/// aggregate upsert and the append-only event insert commit together or not
/// at all.
pub struct PostgresAuditLog {
    pool: PgPool,
}

impl PostgresAuditLog {
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        tracing::info!("connected to audit log");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl AuditLogSink for PostgresAuditLog {
    async fn persist(&self, job: &AuditJob) -> Result<(), SinkError> {
        let snapshot = job.state_snapshot.as_ref();
        let active = snapshot.and_then(|s| s.active_participant());
        let snapshot_json = snapshot
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| SinkError::Permanent(e.into()))?;
        let metadata = serde_json::json!({});

        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query(UPSERT_SESSION)
            .bind(job.session_id.as_uuid())
            .bind(snapshot.map(|s| mode_str(s.sync_mode)))
            .bind(snapshot.map(|s| status_str(s.status)))
            .bind(snapshot.map_or(0, |s| s.participants.len() as i32))
            .bind(snapshot.and_then(|s| s.total_time_ms))
            .bind(snapshot.and_then(|s| s.time_per_cycle_ms))
            .bind(snapshot.map(|s| s.increment_ms))
            .bind(snapshot.and_then(|s| s.max_time_ms))
            .bind(snapshot.and_then(|s| s.session_started_at))
            .bind(snapshot.and_then(|s| s.session_completed_at))
            .bind(snapshot.map_or(job.timestamp, |s| s.created_at))
            .bind(job.timestamp)
            .bind(&metadata)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        sqlx::query(INSERT_EVENT)
            .bind(Uuid::new_v4())
            .bind(job.session_id.as_uuid())
            .bind(job.event_type.as_str())
            .bind(active.map(|p| p.participant_id.as_str().to_owned()))
            .bind(active.map(|p| p.time_remaining_ms))
            .bind(job.timestamp)
            .bind(snapshot_json)
            .bind(&metadata)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(())
    }
}

fn mode_str(mode: sync_types::SyncMode) -> &'static str {
    match mode {
        sync_types::SyncMode::PerParticipant => "per_participant",
        sync_types::SyncMode::PerCycle => "per_cycle",
        sync_types::SyncMode::PerGroup => "per_group",
        sync_types::SyncMode::Global => "global",
        sync_types::SyncMode::CountUp => "count_up",
    }
}

fn status_str(status: sync_types::SessionStatus) -> &'static str {
    match status {
        sync_types::SessionStatus::Pending => "pending",
        sync_types::SessionStatus::Running => "running",
        sync_types::SessionStatus::Paused => "paused",
        sync_types::SessionStatus::Expired => "expired",
        sync_types::SessionStatus::Completed => "completed",
        sync_types::SessionStatus::Cancelled => "cancelled",
    }
}

/// Connection-class failures retry; integrity and schema violations cannot
/// succeed on retry and complete the job instead.
fn classify(error: sqlx::Error) -> SinkError {
    match &error {
        sqlx::Error::Database(db) => {
            let permanent = db
                .code()
                .is_some_and(|code| code.starts_with("23") || code.starts_with("42"));
            if permanent {
                SinkError::Permanent(error.into())
            } else {
                SinkError::Transient(error.into())
            }
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => SinkError::Transient(error.into()),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_) => SinkError::Permanent(error.into()),
        _ => SinkError::Transient(error.into()),
    }
}
