//! Pure state-machine arithmetic. Every function takes the pre-state by
//! value plus an explicit `now` and returns the post-state; nothing here
//! touches a clock or the store, which keeps the whole module
//! deterministically testable.

use chrono::{
    DateTime,
    Utc,
};
use errors::ErrorMetadata;
use sync_types::{
    ParticipantId,
    Participant,
    SessionState,
    SessionStatus,
};

use crate::config::{
    ParticipantConfig,
    SessionConfig,
};

/// Builds the version-1 document from a validated config. Participant order
/// in the config is the rotation order.
pub fn build_initial_state(config: SessionConfig, now: DateTime<Utc>) -> SessionState {
    let participants = config
        .participants
        .into_iter()
        .enumerate()
        .map(|(index, p)| new_participant(p, index as u32))
        .collect();
    SessionState {
        session_id: config.session_id,
        sync_mode: config.sync_mode,
        status: SessionStatus::Pending,
        version: 1,
        participants,
        active_participant_id: None,
        total_time_ms: config.total_time_ms,
        time_per_cycle_ms: config.time_per_cycle_ms,
        increment_ms: config.increment_ms,
        max_time_ms: config.max_time_ms,
        cycle_started_at: None,
        session_started_at: None,
        session_completed_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn new_participant(config: ParticipantConfig, index: u32) -> Participant {
    Participant {
        participant_id: config.participant_id,
        participant_index: index,
        total_time_ms: config.total_time_ms,
        time_used_ms: 0,
        time_remaining_ms: config.total_time_ms,
        cycle_count: 0,
        is_active: false,
        has_expired: false,
        group_id: config.group_id,
    }
}

pub fn start(mut state: SessionState, now: DateTime<Utc>) -> anyhow::Result<SessionState> {
    guard_transition(&state, SessionStatus::Running)?;
    let first = state
        .participants
        .first_mut()
        .ok_or_else(|| anyhow::anyhow!("validated session has no participants"))?;
    first.is_active = true;
    let first_id = first.participant_id.clone();
    state.status = SessionStatus::Running;
    state.active_participant_id = Some(first_id);
    state.cycle_started_at = Some(now);
    state.session_started_at = Some(now);
    state.updated_at = now;
    Ok(state)
}

/// The hot path. Debits the outgoing participant, applies the Fischer
/// increment unless they just ran out, and hands the active slot to the next
/// participant in rotation (or the explicitly requested one).
///
/// Returns the post-switch state and the outgoing participant's id iff their
/// expiry happened during this switch.
pub fn switch(
    mut state: SessionState,
    current_participant_id: Option<&ParticipantId>,
    next_participant_id: Option<&ParticipantId>,
    now: DateTime<Utc>,
) -> anyhow::Result<(SessionState, Option<ParticipantId>)> {
    if state.status != SessionStatus::Running {
        return Err(ErrorMetadata::bad_request(
            errors::INVALID_STATE_TRANSITION,
            format!(
                "Cannot switch cycle while session {} is {}",
                state.session_id,
                status_name(state.status)
            ),
        )
        .into());
    }
    let cycle_started_at = state
        .cycle_started_at
        .ok_or_else(|| anyhow::anyhow!("running session has no cycle_started_at"))?;
    let elapsed = elapsed_ms(cycle_started_at, now);
    let increment_ms = state.increment_ms;

    let outgoing = state
        .participants
        .iter_mut()
        .find(|p| p.is_active)
        .ok_or_else(|| anyhow::anyhow!("running session has no active participant"))?;
    if let Some(expected) = current_participant_id {
        if expected != &outgoing.participant_id {
            return Err(ErrorMetadata::validation_error(
                format!(
                    "Participant {expected} is not the active participant"
                ),
                vec![],
            )
            .into());
        }
    }

    let just_expired = debit(outgoing, elapsed);
    outgoing.cycle_count += 1;
    outgoing.is_active = false;
    // Fischer increment: expired participants get nothing back.
    if !outgoing.has_expired && increment_ms > 0 {
        outgoing.total_time_ms += increment_ms;
        outgoing.time_remaining_ms = outgoing.total_time_ms;
    }
    let outgoing_index = outgoing.participant_index;
    let expired_participant_id = just_expired.then(|| outgoing.participant_id.clone());

    let next_index = match next_participant_id {
        Some(id) => {
            state
                .participant(id)
                .ok_or_else(|| {
                    ErrorMetadata::validation_error(
                        format!("Unknown next participant {id}"),
                        vec![],
                    )
                })?
                .participant_index
        },
        None => (outgoing_index + 1) % state.participants.len() as u32,
    };
    let incoming = state
        .participants
        .iter_mut()
        .find(|p| p.participant_index == next_index)
        .ok_or_else(|| anyhow::anyhow!("rotation index {next_index} has no participant"))?;
    incoming.is_active = true;
    let incoming_id = incoming.participant_id.clone();
    state.active_participant_id = Some(incoming_id);
    state.cycle_started_at = Some(now);
    state.updated_at = now;
    Ok((state, expired_participant_id))
}

/// Debits elapsed time from the paused participant exactly like a switch
/// would, but keeps the rotation where it is. `active_participant_id` stays
/// set so `resume` knows who to re-mark.
pub fn pause(mut state: SessionState, now: DateTime<Utc>) -> anyhow::Result<SessionState> {
    guard_transition(&state, SessionStatus::Paused)?;
    let cycle_started_at = state
        .cycle_started_at
        .ok_or_else(|| anyhow::anyhow!("running session has no cycle_started_at"))?;
    let elapsed = elapsed_ms(cycle_started_at, now);
    let active = state
        .participants
        .iter_mut()
        .find(|p| p.is_active)
        .ok_or_else(|| anyhow::anyhow!("running session has no active participant"))?;
    debit(active, elapsed);
    active.is_active = false;
    state.status = SessionStatus::Paused;
    state.cycle_started_at = None;
    state.updated_at = now;
    Ok(state)
}

pub fn resume(mut state: SessionState, now: DateTime<Utc>) -> anyhow::Result<SessionState> {
    guard_transition(&state, SessionStatus::Running)?;
    let resuming_id = state
        .active_participant_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("paused session lost its active participant"))?;
    let participant = state
        .participant_mut(&resuming_id)
        .ok_or_else(|| anyhow::anyhow!("active participant {resuming_id} not in roster"))?;
    participant.is_active = true;
    state.status = SessionStatus::Running;
    state.cycle_started_at = Some(now);
    state.updated_at = now;
    Ok(state)
}

pub fn complete(mut state: SessionState, now: DateTime<Utc>) -> anyhow::Result<SessionState> {
    guard_transition(&state, SessionStatus::Completed)?;
    for p in &mut state.participants {
        p.is_active = false;
    }
    state.status = SessionStatus::Completed;
    state.active_participant_id = None;
    state.cycle_started_at = None;
    state.session_completed_at = Some(now);
    state.updated_at = now;
    Ok(state)
}

pub fn cancel(mut state: SessionState, now: DateTime<Utc>) -> anyhow::Result<SessionState> {
    guard_transition(&state, SessionStatus::Cancelled)?;
    for p in &mut state.participants {
        p.is_active = false;
    }
    state.status = SessionStatus::Cancelled;
    state.active_participant_id = None;
    state.cycle_started_at = None;
    state.updated_at = now;
    Ok(state)
}

/// Roster edits only make sense before the rotation starts; a live
/// session's order and accounting are never edited underneath it.
pub fn add_participant(
    mut state: SessionState,
    config: ParticipantConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<SessionState> {
    guard_pending_roster_edit(&state)?;
    if state.participant(&config.participant_id).is_some() {
        return Err(ErrorMetadata::validation_error(
            format!("Participant {} already in session", config.participant_id),
            vec![],
        )
        .into());
    }
    let index = state.participants.len() as u32;
    state.participants.push(new_participant(config, index));
    state.updated_at = now;
    Ok(state)
}

pub fn remove_participant(
    mut state: SessionState,
    participant_id: &ParticipantId,
    now: DateTime<Utc>,
) -> anyhow::Result<SessionState> {
    guard_pending_roster_edit(&state)?;
    if state.participant(participant_id).is_none() {
        return Err(ErrorMetadata::validation_error(
            format!("Participant {participant_id} not in session"),
            vec![],
        )
        .into());
    }
    if state.participants.len() == 1 {
        return Err(ErrorMetadata::validation_error(
            "Cannot remove the last participant",
            vec![],
        )
        .into());
    }
    state
        .participants
        .retain(|p| &p.participant_id != participant_id);
    for (index, p) in state.participants.iter_mut().enumerate() {
        p.participant_index = index as u32;
    }
    state.updated_at = now;
    Ok(state)
}

/// Non-negative elapsed wall-clock milliseconds; a clock that stepped
/// backwards debits nothing rather than crediting time.
fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_milliseconds().max(0)
}

/// Time-accounting debit shared by switch and pause. Returns whether the
/// participant's expiry happened in this debit.
fn debit(p: &mut Participant, elapsed: i64) -> bool {
    let was_expired = p.has_expired;
    p.time_used_ms += elapsed;
    p.total_time_ms = (p.total_time_ms - elapsed).max(0);
    p.time_remaining_ms = p.total_time_ms;
    if p.total_time_ms == 0 {
        p.has_expired = true;
    }
    p.has_expired && !was_expired
}

fn guard_transition(state: &SessionState, next: SessionStatus) -> anyhow::Result<()> {
    if !state.status.can_transition_to(next) {
        return Err(ErrorMetadata::invalid_state_transition(
            state.session_id,
            status_name(state.status),
            status_name(next),
        )
        .into());
    }
    Ok(())
}

fn guard_pending_roster_edit(state: &SessionState) -> anyhow::Result<()> {
    if state.status != SessionStatus::Pending {
        return Err(ErrorMetadata::bad_request(
            errors::INVALID_STATE_TRANSITION,
            format!(
                "Participants can only be changed while session {} is pending (currently {})",
                state.session_id,
                status_name(state.status)
            ),
        )
        .into());
    }
    Ok(())
}

pub(crate) fn status_name(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Pending => "pending",
        SessionStatus::Running => "running",
        SessionStatus::Paused => "paused",
        SessionStatus::Expired => "expired",
        SessionStatus::Completed => "completed",
        SessionStatus::Cancelled => "cancelled",
    }
}
