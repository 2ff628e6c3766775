use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::ids::{
    ParticipantId,
    SessionId,
};

/// How time budgets are shared across the rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    PerParticipant,
    PerCycle,
    PerGroup,
    Global,
    CountUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Expired,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Completed | Self::Cancelled)
    }

    /// The session state machine. `Expired` is only ever reached implicitly
    /// when the primary-store TTL lapses, but it is listed here so the table
    /// is the single source of truth for legality checks.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Pending, Cancelled)
                | (Paused, Cancelled)
                | (Pending, Expired)
                | (Running, Expired)
                | (Paused, Expired)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    /// 0-based position in the rotation.
    pub participant_index: u32,
    /// Remaining budget in milliseconds. Floors at zero.
    pub total_time_ms: i64,
    /// Accumulated consumption in milliseconds. Monotonically non-decreasing.
    pub time_used_ms: i64,
    /// Mirror of `total_time_ms`, kept so clients need no arithmetic.
    pub time_remaining_ms: i64,
    /// Number of cycles this participant has held the active slot.
    pub cycle_count: u32,
    pub is_active: bool,
    pub has_expired: bool,
    pub group_id: Option<String>,
}

/// The single persisted entity: unit of read, write, and publish. One JSON
/// document per session key in the primary store.
///
/// All timestamps serialize as RFC 3339 strings and all durations as integer
/// milliseconds; absent values serialize as explicit nulls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub sync_mode: SyncMode,
    pub status: SessionStatus,
    /// Monotonically increasing; starts at 1; the compare-and-set token.
    pub version: u64,
    pub participants: Vec<Participant>,
    pub active_participant_id: Option<ParticipantId>,
    pub total_time_ms: Option<i64>,
    pub time_per_cycle_ms: Option<i64>,
    #[serde(default)]
    pub increment_ms: i64,
    pub max_time_ms: Option<i64>,
    /// When the current active participant began consuming time. Non-null
    /// exactly while `status == running`.
    pub cycle_started_at: Option<DateTime<Utc>>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.participant_id == id)
    }

    pub fn participant_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| &p.participant_id == id)
    }

    pub fn active_participant(&self) -> Option<&Participant> {
        self.participants.iter().find(|p| p.is_active)
    }

    /// Checks the structural invariants that must hold after every
    /// successful mutation. Exercised after each operation in tests; not on
    /// the hot path.
    pub fn check_consistency(&self) -> Result<(), ConsistencyError> {
        let active = self.participants.iter().filter(|p| p.is_active).count();
        if self.status == SessionStatus::Running {
            if active != 1 {
                return Err(ConsistencyError::ActiveCount {
                    status: self.status,
                    count: active,
                });
            }
            let active_id = self
                .active_participant()
                .map(|p| p.participant_id.clone());
            if active_id != self.active_participant_id {
                return Err(ConsistencyError::ActiveIdMismatch);
            }
            if self.cycle_started_at.is_none() {
                return Err(ConsistencyError::MissingCycleStart);
            }
        } else {
            if active != 0 {
                return Err(ConsistencyError::ActiveCount {
                    status: self.status,
                    count: active,
                });
            }
            if self.cycle_started_at.is_some() {
                return Err(ConsistencyError::StrayCycleStart(self.status));
            }
        }
        for p in &self.participants {
            if p.has_expired && p.total_time_ms != 0 {
                return Err(ConsistencyError::ExpiredWithBudget(
                    p.participant_id.clone(),
                ));
            }
            if p.time_remaining_ms != p.total_time_ms {
                return Err(ConsistencyError::RemainingMirror(p.participant_id.clone()));
            }
        }
        let mut ids: Vec<_> = self
            .participants
            .iter()
            .map(|p| &p.participant_id)
            .collect();
        ids.sort();
        ids.dedup();
        if ids.len() != self.participants.len() {
            return Err(ConsistencyError::DuplicateParticipant);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("{count} active participants with status {status:?}")]
    ActiveCount {
        status: SessionStatus,
        count: usize,
    },
    #[error("active_participant_id does not match the flagged participant")]
    ActiveIdMismatch,
    #[error("running session has no cycle_started_at")]
    MissingCycleStart,
    #[error("cycle_started_at set while status is {0:?}")]
    StrayCycleStart(SessionStatus),
    #[error("participant {0} expired with non-zero budget")]
    ExpiredWithBudget(ParticipantId),
    #[error("participant {0} has time_remaining_ms out of sync with total_time_ms")]
    RemainingMirror(ParticipantId),
    #[error("duplicate participant id")]
    DuplicateParticipant,
}

/// Result of a cycle switch: the post-switch rotation plus, when the
/// outgoing participant ran out of budget during this switch, who expired.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwitchOutcome {
    pub session_id: SessionId,
    pub active_participant_id: ParticipantId,
    pub cycle_started_at: DateTime<Utc>,
    pub participants: Vec<Participant>,
    pub status: SessionStatus,
    pub expired_participant_id: Option<ParticipantId>,
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{
        testing::pending_session,
        *,
    };

    #[test]
    fn transition_table() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Paused.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Paused));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Expired.can_transition_to(Running));
    }

    #[test]
    fn serialization_uses_snake_case_tags() {
        let json = serde_json::to_value(SyncMode::PerParticipant).unwrap();
        assert_eq!(json, serde_json::json!("per_participant"));
        let json = serde_json::to_value(SessionStatus::Running).unwrap();
        assert_eq!(json, serde_json::json!("running"));
    }

    #[test]
    fn nulls_are_explicit_in_serialized_state() {
        let state = pending_session();
        let json = serde_json::to_value(&state).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("active_participant_id"));
        assert_eq!(obj["active_participant_id"], serde_json::Value::Null);
        assert_eq!(obj["cycle_started_at"], serde_json::Value::Null);
        assert_eq!(obj["version"], serde_json::json!(1));
    }

    #[test]
    fn json_round_trip_preserves_subsecond_instants() {
        use chrono::TimeZone;
        let mut state = pending_session();
        state.cycle_started_at = Some(Utc.timestamp_millis_opt(1_772_540_400_123).unwrap());
        state.status = SessionStatus::Running;
        state.participants[0].is_active = true;
        state.active_participant_id = Some(state.participants[0].participant_id.clone());

        let bytes = serde_json::to_vec(&state).unwrap();
        let back: SessionState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.cycle_started_at, state.cycle_started_at);
    }

    #[test]
    fn consistency_catches_violations() {
        let mut state = pending_session();
        assert_eq!(state.check_consistency(), Ok(()));

        state.participants[0].is_active = true;
        assert!(matches!(
            state.check_consistency(),
            Err(ConsistencyError::ActiveCount { .. })
        ));

        let mut state = pending_session();
        state.participants[1].participant_id = state.participants[0].participant_id.clone();
        assert_eq!(
            state.check_consistency(),
            Err(ConsistencyError::DuplicateParticipant)
        );

        let mut state = pending_session();
        state.participants[0].has_expired = true;
        assert!(matches!(
            state.check_consistency(),
            Err(ConsistencyError::ExpiredWithBudget(_))
        ));
    }
}

#[cfg(test)]
mod proptests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::{
        testing::pending_session,
        *,
    };

    prop_compose! {
        fn arb_instant()(ms in 0_i64..4_102_444_800_000) -> DateTime<Utc> {
            Utc.timestamp_millis_opt(ms).unwrap()
        }
    }

    prop_compose! {
        fn arb_participant(index: u32)(
            total in 0_i64..86_400_000,
            used in 0_i64..86_400_000,
            cycles in 0_u32..500,
            group in proptest::option::of("[a-z]{1,8}"),
        ) -> Participant {
            Participant {
                participant_id: ParticipantId::new(format!("p{index}")).unwrap(),
                participant_index: index,
                total_time_ms: total,
                time_used_ms: used,
                time_remaining_ms: total,
                cycle_count: cycles,
                is_active: false,
                has_expired: total == 0,
                group_id: group,
            }
        }
    }

    prop_compose! {
        fn arb_state()(
            n in 1_usize..6,
            version in 1_u64..1_000,
            increment in 0_i64..10_000,
            created in arb_instant(),
            cycle_start in proptest::option::of(arb_instant()),
        )(
            participants in (0..n as u32).map(arb_participant).collect::<Vec<_>>(),
            version in Just(version),
            increment in Just(increment),
            created in Just(created),
            cycle_start in Just(cycle_start),
        ) -> SessionState {
            let mut state = pending_session();
            state.version = version;
            state.increment_ms = increment;
            state.created_at = created;
            state.updated_at = created;
            state.cycle_started_at = cycle_start;
            state.participants = participants;
            state
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        /// deserialize(serialize(S)) == S, timestamp instants included.
        #[test]
        fn json_round_trip(state in arb_state()) {
            let bytes = serde_json::to_vec(&state).unwrap();
            let back: SessionState = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(back, state);
        }
    }
}
