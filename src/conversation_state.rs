use crate::consts::{AGENT_TIMEZONE, HISTORY_LIMIT, INTERVIEW_DURATION_MINUTES};
use crate::decision::{self, Decision};
use crate::error::AppError;
use crate::slots;
use crate::tasks::BookingJob;
use crate::types::{AppState, CandidateContext, TurnMessage};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// The conversation states a call moves through. `End` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Start,
    AwaitVerify,
    AwaitOk,
    AwaitSlotConfirm,
    AwaitAvailability,
    AwaitCallback,
    AwaitFinalQ,
    End,
}

impl CallPhase {
    /// The wire tag exchanged with the decision step.
    pub fn tag(&self) -> &'static str {
        match self {
            CallPhase::Start => "START",
            CallPhase::AwaitVerify => "AWAIT_VERIFY",
            CallPhase::AwaitOk => "AWAIT_OK",
            CallPhase::AwaitSlotConfirm => "AWAIT_SLOT_CONFIRM",
            CallPhase::AwaitAvailability => "AWAIT_AVAILABILITY",
            CallPhase::AwaitCallback => "AWAIT_CALLBACK",
            CallPhase::AwaitFinalQ => "AWAIT_FINAL_Q",
            CallPhase::End => "END",
        }
    }

    /// An unrecognized tag is a malformed decision, never silently accepted.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "START" => Some(CallPhase::Start),
            "AWAIT_VERIFY" => Some(CallPhase::AwaitVerify),
            "AWAIT_OK" => Some(CallPhase::AwaitOk),
            "AWAIT_SLOT_CONFIRM" => Some(CallPhase::AwaitSlotConfirm),
            "AWAIT_AVAILABILITY" => Some(CallPhase::AwaitAvailability),
            "AWAIT_CALLBACK" => Some(CallPhase::AwaitCallback),
            "AWAIT_FINAL_Q" => Some(CallPhase::AwaitFinalQ),
            "END" => Some(CallPhase::End),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::End)
    }
}

/// Everything we track for one call, keyed by Twilio call SID. The
/// store-of-record row is the source of truth; this record only lives for
/// the duration of the call.
pub struct CallState {
    pub phase: CallPhase,
    pub history: Vec<TurnMessage>,
    /// Slot currently under negotiation, as the ISO string the decision step
    /// emitted. Kept as a string so the exact value survives re-parsing.
    pub proposed_slot_iso: Option<String>,
    /// Slot the candidate agreed to; set at the final-question transition.
    pub confirmed_slot_iso: Option<String>,
    /// At-most-once guard for the booking task.
    pub booking_dispatched: bool,
    pub context: CandidateContext,
}

impl CallState {
    pub fn new(context: CandidateContext) -> Self {
        Self {
            phase: CallPhase::Start,
            history: vec![],
            proposed_slot_iso: None,
            confirmed_slot_iso: None,
            booking_dispatched: false,
            context,
        }
    }

    /// Fresh conversation for the first webhook of a call.
    pub fn reset_for_start(&mut self) {
        self.phase = CallPhase::Start;
        self.history.clear();
        self.proposed_slot_iso = None;
        self.confirmed_slot_iso = None;
        self.booking_dispatched = false;
    }

    /// Append a turn entry, truncating oldest-first at the history cap.
    pub fn push_history(&mut self, role: &str, content: &str) {
        self.history.push(TurnMessage {
            role: role.to_string(),
            content: content.to_string(),
        });
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}

/// Per-call state registry. Access to one call SID is serialized through its
/// entry mutex; different SIDs never block each other.
pub struct CallStore {
    calls: DashMap<String, Arc<Mutex<CallState>>>,
}

impl CallStore {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    pub fn insert(&self, call_sid: &str, state: CallState) -> Arc<Mutex<CallState>> {
        let entry = Arc::new(Mutex::new(state));
        self.calls.insert(call_sid.to_string(), entry.clone());
        entry
    }

    pub fn get(&self, call_sid: &str) -> Option<Arc<Mutex<CallState>>> {
        self.calls.get(call_sid).map(|entry| entry.clone())
    }

    /// Drop all state for a call. Safe to call repeatedly and for unknown
    /// SIDs.
    pub fn cleanup(&self, call_sid: &str) {
        match self.calls.remove(call_sid) {
            Some(_) => info!(sid=%call_sid, "removed call state"),
            None => debug!(sid=%call_sid, "call state already removed or never existed"),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl Default for CallStore {
    fn default() -> Self {
        Self::new()
    }
}

/// What one turn of the orchestrator tells the webhook handler to do.
pub struct TurnOutcome {
    pub response_text: String,
    /// Keep gathering caller speech; false means speak and hang up.
    pub keep_listening: bool,
    /// Booking job to hand to the worker pool, at most once per call.
    pub booking: Option<BookingJob>,
}

/// Run one full turn: record the utterance, consult the decision step, and
/// fold its output back into the call state.
pub async fn advance_call(
    app_state: &Arc<AppState>,
    call_sid: &str,
    state: &mut CallState,
    user_input: Option<&str>,
) -> TurnOutcome {
    if let Some(input) = user_input {
        state.push_history("user", input);
    }
    let decision = decision::run_decision_step(app_state, call_sid, state, user_input).await;
    apply_decision(call_sid, state, decision)
}

/// Fold a validated decision into the call state, enforcing the turn
/// invariants regardless of what the decision step returned: proposal
/// bookkeeping, the booking trigger with its dispatch guard, and the
/// keep-listening rule.
pub fn apply_decision(call_sid: &str, state: &mut CallState, decision: Decision) -> TurnOutcome {
    let next = decision.next_state;
    state.push_history("assistant", &decision.response_text);

    if let Some(proposed) = &decision.proposed_slot_iso {
        // Negotiation moves forward; a new proposal replaces the old one.
        debug!(sid=%call_sid, slot=%proposed, "retaining proposed slot");
        state.proposed_slot_iso = Some(proposed.clone());
    } else if decision.confirmed_slot_iso.is_some()
        || matches!(
            next,
            CallPhase::AwaitAvailability | CallPhase::AwaitCallback | CallPhase::End
        )
    {
        if state.proposed_slot_iso.take().is_some() {
            debug!(sid=%call_sid, next=%next.tag(), "cleared proposed slot");
        }
    }
    if let Some(confirmed) = &decision.confirmed_slot_iso {
        // Retained for the final-question state so the closing response can
        // still name the agreed time.
        state.confirmed_slot_iso = Some(confirmed.clone());
    }

    let mut booking = None;
    if let Some(confirmed) = decision.confirmed_slot_iso.as_deref() {
        if next != CallPhase::AwaitFinalQ {
            warn!(sid=%call_sid, next=%next.tag(), "confirmed slot signal outside the final-question transition; ignoring");
        } else if state.booking_dispatched {
            warn!(sid=%call_sid, "confirmed slot re-emitted after booking dispatch; ignoring");
        } else {
            match build_booking_job(call_sid, state, confirmed) {
                Ok(job) => {
                    info!(sid=%call_sid, slot=%confirmed, row=?state.context.row_index, "booking trigger met");
                    state.booking_dispatched = true;
                    booking = Some(job);
                }
                Err(e) => {
                    error!(sid=%call_sid, error=%e, "booking preconditions not met; booking not dispatched");
                }
            }
        }
    } else if next == CallPhase::AwaitFinalQ && !state.booking_dispatched {
        warn!(sid=%call_sid, "reached final-question state without a confirmed slot signal");
    }

    state.phase = next;
    let keep_listening = decision.needs_more_info && !next.is_terminal();
    TurnOutcome {
        response_text: decision.response_text,
        keep_listening,
        booking,
    }
}

fn valid_email(email: &str) -> bool {
    !email.trim().is_empty() && email.contains('@')
}

/// Assemble the deferred booking job. Missing candidate email, interviewer
/// email, or row reference is a hard precondition failure.
fn build_booking_job(
    call_sid: &str,
    state: &CallState,
    confirmed_iso: &str,
) -> Result<BookingJob, AppError> {
    let ctx = &state.context;
    if !valid_email(&ctx.email) {
        return Err(AppError("candidate email missing or invalid"));
    }
    if !valid_email(&ctx.interviewer_email) {
        return Err(AppError("interviewer email missing or invalid"));
    }
    let row_index = ctx.row_index.ok_or(AppError("row reference missing"))?;
    let start = slots::parse_fragment(confirmed_iso, AGENT_TIMEZONE)
        .ok_or(AppError("confirmed slot is not a parsable instant"))?;
    let end = start + chrono::Duration::minutes(INTERVIEW_DURATION_MINUTES);

    let summary = format!("Interview: {} - {}", ctx.name, ctx.title);
    let description = format!(
        "AI scheduled interview for {}.\n\nCandidate: {}\nCandidate email: {}\nInterviewer email: {}\n\nCall SID: {}\nScheduled time: {}",
        ctx.title,
        ctx.name,
        ctx.email,
        ctx.interviewer_email,
        call_sid,
        start.format("%Y-%m-%d %H:%M:%S %Z"),
    );

    Ok(BookingJob {
        call_sid: call_sid.to_string(),
        row_index,
        start,
        end,
        summary,
        description,
        candidate_email: ctx.email.clone(),
        interviewer_email: ctx.interviewer_email.clone(),
        confirmed_iso: confirmed_iso.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Asia::Kolkata;

    fn candidate() -> CandidateContext {
        CandidateContext {
            name: "Asha Rao".to_string(),
            phone: "+911234567890".to_string(),
            email: "asha@example.com".to_string(),
            title: "Backend Engineer".to_string(),
            row_index: Some(7),
            interviewer_email: "lead@example.com".to_string(),
            available_slots: "2099-06-10T09:00:00+05:30; 2099-06-11T14:00:00+05:30".to_string(),
        }
    }

    fn decision(next: CallPhase) -> Decision {
        Decision {
            response_text: "ok".to_string(),
            next_state: next,
            needs_more_info: true,
            proposed_slot_iso: None,
            confirmed_slot_iso: None,
        }
    }

    #[test]
    fn history_is_capped_at_limit_keeping_latest() {
        let mut state = CallState::new(candidate());
        for i in 0..20 {
            state.push_history("user", &format!("turn {i}"));
        }
        assert_eq!(state.history.len(), HISTORY_LIMIT);
        assert_eq!(state.history.last().unwrap().content, "turn 19");
        assert_eq!(state.history.first().unwrap().content, "turn 10");
    }

    #[test]
    fn cleanup_is_idempotent_and_tolerates_unknown_sids() {
        let store = CallStore::new();
        store.insert("CA1", CallState::new(candidate()));
        assert_eq!(store.len(), 1);
        store.cleanup("CA1");
        store.cleanup("CA1");
        store.cleanup("CA-never-existed");
        assert!(store.is_empty());
    }

    #[test]
    fn new_proposal_overwrites_previous_one() {
        let mut state = CallState::new(candidate());
        state.phase = CallPhase::AwaitSlotConfirm;
        let mut d = decision(CallPhase::AwaitSlotConfirm);
        d.proposed_slot_iso = Some("2099-06-10T09:00:00+05:30".to_string());
        apply_decision("CA1", &mut state, d);
        let mut d = decision(CallPhase::AwaitSlotConfirm);
        d.proposed_slot_iso = Some("2099-06-11T14:00:00+05:30".to_string());
        apply_decision("CA1", &mut state, d);
        assert_eq!(
            state.proposed_slot_iso.as_deref(),
            Some("2099-06-11T14:00:00+05:30")
        );
    }

    #[test]
    fn proposal_cleared_when_negotiation_abandoned() {
        for next in [
            CallPhase::AwaitAvailability,
            CallPhase::AwaitCallback,
            CallPhase::End,
        ] {
            let mut state = CallState::new(candidate());
            state.phase = CallPhase::AwaitSlotConfirm;
            state.proposed_slot_iso = Some("2099-06-10T09:00:00+05:30".to_string());
            apply_decision("CA1", &mut state, decision(next));
            assert!(state.proposed_slot_iso.is_none(), "not cleared for {next:?}");
        }
    }

    #[test]
    fn booking_dispatched_exactly_once() {
        let mut state = CallState::new(candidate());
        state.phase = CallPhase::AwaitSlotConfirm;
        state.proposed_slot_iso = Some("2099-06-11T14:00:00+05:30".to_string());

        let mut confirm = decision(CallPhase::AwaitFinalQ);
        confirm.confirmed_slot_iso = Some("2099-06-11T14:00:00+05:30".to_string());
        let outcome = apply_decision("CA1", &mut state, confirm);
        assert!(outcome.booking.is_some());
        assert!(state.booking_dispatched);
        assert!(state.proposed_slot_iso.is_none());

        // Clarification loop re-enters the final-question state without a
        // fresh signal: nothing fires.
        let outcome = apply_decision("CA1", &mut state, decision(CallPhase::AwaitFinalQ));
        assert!(outcome.booking.is_none());

        // A malformed re-emission of the signal is ignored by the guard.
        let mut again = decision(CallPhase::AwaitFinalQ);
        again.confirmed_slot_iso = Some("2099-06-11T14:00:00+05:30".to_string());
        let outcome = apply_decision("CA1", &mut state, again);
        assert!(outcome.booking.is_none());
    }

    #[test]
    fn confirmed_signal_outside_final_question_does_not_book() {
        let mut state = CallState::new(candidate());
        let mut d = decision(CallPhase::AwaitSlotConfirm);
        d.confirmed_slot_iso = Some("2099-06-11T14:00:00+05:30".to_string());
        let outcome = apply_decision("CA1", &mut state, d);
        assert!(outcome.booking.is_none());
        assert!(!state.booking_dispatched);
    }

    #[test]
    fn missing_row_reference_blocks_dispatch() {
        let mut ctx = candidate();
        ctx.row_index = None;
        let mut state = CallState::new(ctx);
        let mut d = decision(CallPhase::AwaitFinalQ);
        d.confirmed_slot_iso = Some("2099-06-11T14:00:00+05:30".to_string());
        let outcome = apply_decision("CA1", &mut state, d);
        assert!(outcome.booking.is_none());
        assert!(!state.booking_dispatched);
    }

    #[test]
    fn terminal_state_never_keeps_listening() {
        let mut state = CallState::new(candidate());
        let mut d = decision(CallPhase::End);
        d.needs_more_info = true;
        let outcome = apply_decision("CA1", &mut state, d);
        assert!(!outcome.keep_listening);
        assert!(state.phase.is_terminal());
    }

    #[test]
    fn full_negotiation_scenario_books_once_with_agreed_instant() {
        let mut state = CallState::new(candidate());

        // START greeting
        let mut d = decision(CallPhase::AwaitVerify);
        d.response_text = "Am I speaking with Asha?".to_string();
        let outcome = apply_decision("CA123", &mut state, d);
        assert!(outcome.keep_listening);

        // "yes this is me"
        state.push_history("user", "yes this is me");
        apply_decision("CA123", &mut state, decision(CallPhase::AwaitOk));

        // "sure" -> first slot proposed
        state.push_history("user", "sure");
        let mut d = decision(CallPhase::AwaitSlotConfirm);
        d.proposed_slot_iso = Some("2024-06-10T09:00:00+05:30".to_string());
        apply_decision("CA123", &mut state, d);

        // "no that doesn't work" -> next slot proposed
        state.push_history("user", "no that doesn't work");
        let mut d = decision(CallPhase::AwaitSlotConfirm);
        d.proposed_slot_iso = Some("2024-06-11T14:00:00+05:30".to_string());
        apply_decision("CA123", &mut state, d);
        assert_eq!(
            state.proposed_slot_iso.as_deref(),
            Some("2024-06-11T14:00:00+05:30")
        );

        // "that works" -> confirmation and booking trigger
        state.push_history("user", "that works");
        let mut d = decision(CallPhase::AwaitFinalQ);
        d.confirmed_slot_iso = Some("2024-06-11T14:00:00+05:30".to_string());
        let outcome = apply_decision("CA123", &mut state, d);

        let job = outcome.booking.expect("booking job must be dispatched");
        assert_eq!(job.call_sid, "CA123");
        assert_eq!(job.row_index, 7);
        assert_eq!(job.confirmed_iso, "2024-06-11T14:00:00+05:30");
        assert_eq!(
            job.start,
            Kolkata.with_ymd_and_hms(2024, 6, 11, 14, 0, 0).unwrap()
        );
        assert_eq!(job.end - job.start, chrono::Duration::minutes(45));

        // Later turns in the final-question loop never re-dispatch.
        state.push_history("user", "what's the format?");
        let outcome = apply_decision("CA123", &mut state, decision(CallPhase::AwaitFinalQ));
        assert!(outcome.booking.is_none());
    }
}
