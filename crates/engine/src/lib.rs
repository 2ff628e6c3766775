//! The sync engine: every session operation the service exposes.
//!
//! Operations follow one shape — load the current state (capturing its
//! version as the CAS token), run a pure transition, persist through the
//! state manager. A lost race surfaces as `CONCURRENT_MODIFICATION`; the
//! engine never retries internally, the caller decides.

use std::sync::Arc;

use anyhow::Context;
use audit::AuditEventType;
use chrono::Utc;
use errors::{
    ErrorMetadata,
    FieldViolation,
};
use state_manager::StateManager;
use sync_types::{
    ParticipantId,
    SessionId,
    SessionState,
    SessionStatus,
    SwitchOutcome,
};

pub mod config;
mod metrics;
pub mod transitions;

pub use config::{
    ParticipantConfig,
    SessionConfig,
    MAX_PARTICIPANTS,
};

pub struct SyncEngine {
    state: Arc<StateManager>,
}

impl SyncEngine {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub async fn create_session(&self, config: SessionConfig) -> anyhow::Result<SessionState> {
        config.validate()?;
        let state = transitions::build_initial_state(config, Utc::now());
        let persisted = self.state.create_session(state).await?;
        metrics::log_operation("create");
        Ok(persisted)
    }

    pub async fn start_session(&self, session_id: SessionId) -> anyhow::Result<SessionState> {
        let current = self.load(session_id).await?;
        let expected = current.version;
        let next = transitions::start(current, Utc::now())?;
        let persisted = self
            .state
            .update_session(
                session_id,
                next,
                Some(expected),
                AuditEventType::SessionStarted,
            )
            .await?;
        metrics::log_operation("start");
        Ok(persisted)
    }

    /// The hot path: debit, rotate, persist via CAS. Target is tens of
    /// milliseconds end-to-end; everything here is one store read, pure
    /// arithmetic, and one version-checked write.
    pub async fn switch_cycle(
        &self,
        session_id: SessionId,
        current_participant_id: Option<&ParticipantId>,
        next_participant_id: Option<&ParticipantId>,
    ) -> anyhow::Result<SwitchOutcome> {
        let _timer = metrics::switch_timer();
        let current = self.load(session_id).await?;
        let expected = current.version;
        let (next, expired_participant_id) = transitions::switch(
            current,
            current_participant_id,
            next_participant_id,
            Utc::now(),
        )?;
        let persisted = self
            .state
            .update_session(
                session_id,
                next,
                Some(expected),
                AuditEventType::CycleSwitched,
            )
            .await?;
        metrics::log_operation("switch");
        let active_participant_id = persisted
            .active_participant_id
            .clone()
            .context("switched session has no active participant")?;
        let cycle_started_at = persisted
            .cycle_started_at
            .context("switched session has no cycle start")?;
        Ok(SwitchOutcome {
            session_id,
            active_participant_id,
            cycle_started_at,
            participants: persisted.participants,
            status: persisted.status,
            expired_participant_id,
        })
    }

    pub async fn pause_session(&self, session_id: SessionId) -> anyhow::Result<SessionState> {
        let current = self.load(session_id).await?;
        let expected = current.version;
        let next = transitions::pause(current, Utc::now())?;
        let persisted = self
            .state
            .update_session(
                session_id,
                next,
                Some(expected),
                AuditEventType::SessionPaused,
            )
            .await?;
        metrics::log_operation("pause");
        Ok(persisted)
    }

    pub async fn resume_session(&self, session_id: SessionId) -> anyhow::Result<SessionState> {
        let current = self.load(session_id).await?;
        let expected = current.version;
        let next = transitions::resume(current, Utc::now())?;
        let persisted = self
            .state
            .update_session(
                session_id,
                next,
                Some(expected),
                AuditEventType::SessionResumed,
            )
            .await?;
        metrics::log_operation("resume");
        Ok(persisted)
    }

    /// Idempotent sink: completing an already-completed session returns it
    /// unchanged (no version bump, no events). Every other non-running
    /// status rejects.
    pub async fn complete_session(&self, session_id: SessionId) -> anyhow::Result<SessionState> {
        let current = self.load(session_id).await?;
        if current.status == SessionStatus::Completed {
            return Ok(current);
        }
        let expected = current.version;
        let next = transitions::complete(current, Utc::now())?;
        let persisted = self
            .state
            .update_session(
                session_id,
                next,
                Some(expected),
                AuditEventType::SessionCompleted,
            )
            .await?;
        metrics::log_operation("complete");
        Ok(persisted)
    }

    pub async fn cancel_session(&self, session_id: SessionId) -> anyhow::Result<SessionState> {
        let current = self.load(session_id).await?;
        let expected = current.version;
        let next = transitions::cancel(current, Utc::now())?;
        let persisted = self
            .state
            .update_session(
                session_id,
                next,
                Some(expected),
                AuditEventType::SessionCancelled,
            )
            .await?;
        metrics::log_operation("cancel");
        Ok(persisted)
    }

    pub async fn delete_session(&self, session_id: SessionId) -> anyhow::Result<()> {
        self.state.delete_session(session_id).await?;
        metrics::log_operation("delete");
        Ok(())
    }

    /// Pure read. Clients derive remaining time from `cycle_started_at` and
    /// their own clock; the server never runs timers on their behalf.
    pub async fn get_current_state(&self, session_id: SessionId) -> anyhow::Result<SessionState> {
        self.load(session_id).await
    }

    pub async fn add_participant(
        &self,
        session_id: SessionId,
        participant: ParticipantConfig,
    ) -> anyhow::Result<SessionState> {
        let current = self.load(session_id).await?;
        if current.participants.len() >= MAX_PARTICIPANTS {
            return Err(ErrorMetadata::validation_error(
                "Session roster is full",
                vec![FieldViolation::new("participants", "max_length_1000")],
            )
            .into());
        }
        if let Err(constraint) = config::validate_participant_time(participant.total_time_ms) {
            return Err(ErrorMetadata::validation_error(
                "Invalid participant configuration",
                vec![FieldViolation::new("total_time_ms", constraint)],
            )
            .into());
        }
        let expected = current.version;
        let next = transitions::add_participant(current, participant, Utc::now())?;
        let persisted = self
            .state
            .update_session(
                session_id,
                next,
                Some(expected),
                AuditEventType::ParticipantAdded,
            )
            .await?;
        metrics::log_operation("add_participant");
        Ok(persisted)
    }

    pub async fn remove_participant(
        &self,
        session_id: SessionId,
        participant_id: &ParticipantId,
    ) -> anyhow::Result<SessionState> {
        let current = self.load(session_id).await?;
        let expected = current.version;
        let next = transitions::remove_participant(current, participant_id, Utc::now())?;
        let persisted = self
            .state
            .update_session(
                session_id,
                next,
                Some(expected),
                AuditEventType::ParticipantRemoved,
            )
            .await?;
        metrics::log_operation("remove_participant");
        Ok(persisted)
    }

    async fn load(&self, session_id: SessionId) -> anyhow::Result<SessionState> {
        self.state
            .get_session(session_id)
            .await?
            .ok_or_else(|| ErrorMetadata::session_not_found(session_id).into())
    }
}
