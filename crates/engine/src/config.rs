use errors::{
    ErrorMetadata,
    FieldViolation,
};
use serde::{
    Deserialize,
    Serialize,
};
use sync_types::{
    ParticipantId,
    SessionId,
    SyncMode,
};

/// Hard cap on roster size; beyond this the per-switch participant scan and
/// the serialized document size stop being hot-path friendly.
pub const MAX_PARTICIPANTS: usize = 1000;

/// Per-participant budget bounds in milliseconds: one second to one day.
pub const MIN_PARTICIPANT_TIME_MS: i64 = 1_000;
pub const MAX_PARTICIPANT_TIME_MS: i64 = 86_400_000;

/// The immutable session configuration supplied at creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub session_id: SessionId,
    pub sync_mode: SyncMode,
    pub participants: Vec<ParticipantConfig>,
    #[serde(default)]
    pub total_time_ms: Option<i64>,
    #[serde(default)]
    pub time_per_cycle_ms: Option<i64>,
    #[serde(default)]
    pub increment_ms: i64,
    #[serde(default)]
    pub max_time_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantConfig {
    pub participant_id: ParticipantId,
    pub total_time_ms: i64,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl SessionConfig {
    /// All config constraints in one pass; violations come back together so
    /// a client can fix its request in one round.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut violations = Vec::new();

        if self.participants.is_empty() {
            violations.push(FieldViolation::new("participants", "non_empty"));
        }
        if self.participants.len() > MAX_PARTICIPANTS {
            violations.push(FieldViolation::new("participants", "max_length_1000"));
        }
        let mut ids: Vec<_> = self
            .participants
            .iter()
            .map(|p| &p.participant_id)
            .collect();
        ids.sort();
        ids.dedup();
        if ids.len() != self.participants.len() {
            violations.push(FieldViolation::new("participants.participant_id", "unique"));
        }
        for (index, p) in self.participants.iter().enumerate() {
            if let Err(violation) = validate_participant_time(p.total_time_ms) {
                violations.push(FieldViolation::new(
                    format!("participants[{index}].total_time_ms"),
                    violation,
                ));
            }
        }
        if self.increment_ms < 0 {
            violations.push(FieldViolation::new("increment_ms", "non_negative"));
        }
        for (field, value) in [
            ("total_time_ms", self.total_time_ms),
            ("time_per_cycle_ms", self.time_per_cycle_ms),
            ("max_time_ms", self.max_time_ms),
        ] {
            if value.is_some_and(|v| v <= 0) {
                violations.push(FieldViolation::new(field, "positive"));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ErrorMetadata::validation_error("Invalid session configuration", violations).into())
        }
    }
}

pub(crate) fn validate_participant_time(total_time_ms: i64) -> Result<(), &'static str> {
    if total_time_ms < MIN_PARTICIPANT_TIME_MS {
        return Err("min_1000_ms");
    }
    if total_time_ms > MAX_PARTICIPANT_TIME_MS {
        return Err("max_86400000_ms");
    }
    Ok(())
}
