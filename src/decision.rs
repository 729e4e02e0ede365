use crate::consts::{
    AGENT_NAME, AGENT_TIMEZONE, COMPANY_NAME, INTERVIEW_DURATION_MINUTES, PROMPT_HISTORY_WINDOW,
};
use crate::conversation_state::{CallPhase, CallState};
use crate::error::AppError;
use crate::gemini_types::{GeminiPayload, GeminiResponse};
use crate::slots;
use crate::types::AppState;

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

const DECISION_TIMEOUT: Duration = Duration::from_secs(15);

/// One validated decision-step output. The orchestrator trusts nothing else
/// from the generative collaborator.
#[derive(Debug, Clone)]
pub struct Decision {
    pub response_text: String,
    pub next_state: CallPhase,
    pub needs_more_info: bool,
    pub proposed_slot_iso: Option<String>,
    pub confirmed_slot_iso: Option<String>,
}

impl Decision {
    /// Substitute when the generative backend is unreachable. The caller
    /// still hears a spoken message before hangup.
    pub fn upstream_unavailable() -> Self {
        Self {
            response_text:
                "Sorry, there's an internal issue with the AI connection. Please try calling back later."
                    .to_string(),
            next_state: CallPhase::End,
            needs_more_info: false,
            proposed_slot_iso: None,
            confirmed_slot_iso: None,
        }
    }

    /// Substitute for a malformed decision payload.
    pub fn internal_error() -> Self {
        Self {
            response_text:
                "I'm sorry, I encountered an unexpected internal error. Please try calling back later."
                    .to_string(),
            next_state: CallPhase::End,
            needs_more_info: false,
            proposed_slot_iso: None,
            confirmed_slot_iso: None,
        }
    }
}

#[derive(Deserialize, Debug)]
struct RawDecision {
    response_text: String,
    next_state: String,
    needs_more_info: bool,
    #[serde(default)]
    hr_context: SlotSignals,
}

#[derive(Deserialize, Debug, Default)]
struct SlotSignals {
    #[serde(default)]
    proposed_slot_iso: Option<String>,
    #[serde(default)]
    confirmed_slot_iso: Option<String>,
}

/// Consult the generative backend for the next conversational step. Never
/// fails: upstream or validation errors degrade to a canned terminal
/// decision per the error-handling contract.
pub async fn run_decision_step(
    app_state: &Arc<AppState>,
    call_sid: &str,
    state: &CallState,
    user_input: Option<&str>,
) -> Decision {
    let prompt = build_prompt(app_state, state, user_input);
    debug!(sid=%call_sid, state=%state.phase.tag(), history_len=state.history.len(), "sending decision prompt");

    let raw = match fetch_decision_text(app_state, &prompt).await {
        Ok(text) => text,
        Err(e) => {
            error!(sid=%call_sid, error=%e, "decision backend unavailable; ending call");
            return Decision::upstream_unavailable();
        }
    };
    debug!(sid=%call_sid, raw=%raw, "raw decision payload");

    match parse_decision_text(&raw) {
        Ok(decision) => {
            debug!(sid=%call_sid, next=%decision.next_state.tag(), "decision validated");
            decision
        }
        Err(e) => {
            error!(sid=%call_sid, error=%e, raw=%raw, "malformed decision; ending call");
            Decision::internal_error()
        }
    }
}

async fn fetch_decision_text(app_state: &Arc<AppState>, prompt: &str) -> Result<String, AppError> {
    let url = format!(
        "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
        app_state.gemini_model, app_state.gemini_api_key,
    );
    let payload = GeminiPayload::json_decision(prompt.to_string());
    let resp = app_state
        .http_client
        .post(&url)
        .json(&payload)
        .timeout(DECISION_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            error!(error=%e, "failed to send decision request");
            AppError("decision request error")
        })?
        .error_for_status()
        .map_err(|e| {
            error!(error=%e, "decision request rejected");
            AppError("decision request rejected")
        })?;
    let resp = resp.json::<GeminiResponse>().await.map_err(|e| {
        error!(error=%e, "failed to deserialize decision response envelope");
        AppError("decision response deserialize error")
    })?;
    resp.first_text().ok_or_else(|| {
        error!("decision response contained no text (blocked or empty)");
        AppError("empty decision response")
    })
}

/// Strip the markdown code fences some models wrap JSON output in.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

/// Validate raw decision text against the documented shape. Unknown state
/// tags and missing fields are errors, not defaults.
pub fn parse_decision_text(raw: &str) -> Result<Decision, AppError> {
    let json = strip_code_fences(raw);
    let raw: RawDecision = serde_json::from_str(json).map_err(|e| {
        error!(error=%e, "failed to decode decision json");
        AppError("decision json decode error")
    })?;
    let next_state = CallPhase::parse(&raw.next_state).ok_or_else(|| {
        error!(tag=%raw.next_state, "decision carried an unknown state tag");
        AppError("unknown decision state tag")
    })?;
    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
    Ok(Decision {
        response_text: raw.response_text,
        next_state,
        needs_more_info: raw.needs_more_info,
        proposed_slot_iso: non_empty(raw.hr_context.proposed_slot_iso),
        confirmed_slot_iso: non_empty(raw.hr_context.confirmed_slot_iso),
    })
}

/// First slot strictly after the one on the table, by instant order. Rejection
/// always moves to an unseen time; once the active slot is the latest offer
/// there is no alternative and negotiation falls through to availability.
fn next_alternative_slot<'a>(
    active_iso: Option<&str>,
    parsed_slots: &'a [chrono::DateTime<chrono_tz::Tz>],
) -> Option<&'a chrono::DateTime<chrono_tz::Tz>> {
    let active = slots::parse_fragment(active_iso?, AGENT_TIMEZONE)?;
    parsed_slots.iter().find(|dt| **dt > active)
}

fn or_na(text: &str) -> &str {
    if text.trim().is_empty() {
        "N/A"
    } else {
        text
    }
}

/// Assemble the state-driven prompt. Slot options are re-parsed from the
/// immutable raw text every turn; the next alternative is computed by
/// instant order relative to the slot currently on the table, so rejection
/// always moves to the next unseen time.
fn build_prompt(app_state: &AppState, state: &CallState, user_input: Option<&str>) -> String {
    let ctx = &state.context;
    let first_name = ctx.first_name();

    let parsed_slots = slots::parse_offered_slots(&ctx.available_slots, AGENT_TIMEZONE);
    let formatted_slots: Vec<String> = parsed_slots.iter().map(slots::format_natural).collect();
    let slot_options_text = if formatted_slots.is_empty() {
        "No specific times currently listed.".to_string()
    } else {
        formatted_slots.join("; ")
    };

    let active_slot_iso = state
        .proposed_slot_iso
        .as_deref()
        .or(state.confirmed_slot_iso.as_deref());
    let active_slot_text = slots::format_iso_natural(active_slot_iso.unwrap_or(""), AGENT_TIMEZONE);

    // First slot for the initial proposal out of AWAIT_OK.
    let first_slot_iso = parsed_slots
        .first()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();
    let first_slot_text = formatted_slots.first().cloned().unwrap_or_default();

    let next_slot = next_alternative_slot(active_slot_iso, &parsed_slots);
    let next_slot_iso = next_slot.map(|dt| dt.to_rfc3339());
    let next_slot_text = next_slot.map(slots::format_natural);

    let history_tail =
        &state.history[state.history.len().saturating_sub(PROMPT_HISTORY_WINDOW)..];
    let history_json = serde_json::to_string(history_tail).unwrap_or_else(|_| "[]".to_string());
    let input_json = serde_json::to_string(&user_input.unwrap_or("(No user input)"))
        .unwrap_or_else(|_| "\"\"".to_string());

    format!(
        r#"You are {agent}, an HR representative from {company}. Goal: schedule an interview for {title} with {name}. Be professional, clear, concise. Do NOT identify as an AI.

CANDIDATE CONTEXT: Name: {name} (address as {first_name}) | Job: {title}
COMPANY INFO: {company_info}
JOB DESC: {job_description}
AVAILABLE SLOTS: {slot_options_text}
PROPOSED/CONFIRMED SLOT ISO: {active_iso}
NEXT ALTERNATIVE SLOT ISO: {next_iso}
CURRENT STATE: {current_state}
HISTORY (last few): {history_json}
USER INPUT: {input_json}

YOUR TASK: based ONLY on CURRENT STATE and USER INPUT, decide NEXT STATE and generate RESPONSE TEXT per the STATE LOGIC below.

STATE LOGIC:
- IF STATE 'START': RESPONSE: "Hi, this is {agent} calling from the HR department at {company}. Am I speaking with {first_name}?". NEXT STATE 'AWAIT_VERIFY'. needs_more_info: true. hr_context: {{}}
- IF STATE 'AWAIT_VERIFY':
    - If USER INPUT confirms ("Yes", "Speaking"): RESPONSE: "Great. Calling about your application for {title}. Is now an okay time to discuss scheduling for a minute?". NEXT STATE 'AWAIT_OK'. needs_more_info: true.
    - If USER INPUT denies ("No", "Wrong number"): RESPONSE: "Oh, I apologize. Goodbye.". NEXT STATE 'END'. needs_more_info: false.
    - If unclear: RESPONSE: "Sorry, is this {first_name}?". NEXT STATE 'AWAIT_VERIFY'. needs_more_info: true.
- IF STATE 'AWAIT_OK':
    - If USER INPUT confirms and AVAILABLE SLOTS lists times: acknowledge and propose the first slot: "Okay, great. Are you available on {first_slot_text}?". NEXT STATE 'AWAIT_SLOT_CONFIRM'. needs_more_info: true. hr_context: {{"proposed_slot_iso": "{first_slot_iso}"}}
    - If USER INPUT confirms and no slots are listed: ask what days or times might work for a {duration} minute interview. NEXT STATE 'AWAIT_AVAILABILITY'. needs_more_info: true.
    - If USER INPUT is negative ("No", "Busy"): RESPONSE: "Okay, no problem. When might be a better time for me to call you back briefly?". NEXT STATE 'AWAIT_CALLBACK'. needs_more_info: true.
    - If unclear: re-ask whether now is a good time. NEXT STATE 'AWAIT_OK'. needs_more_info: true.
- IF STATE 'AWAIT_SLOT_CONFIRM':
    - If USER INPUT affirms: RESPONSE: "Okay, confirmed! I have scheduled you for {active_text}. You should receive a calendar invite shortly. Do you have any quick questions before we go?". NEXT STATE 'AWAIT_FINAL_Q'. needs_more_info: true. hr_context: {{"confirmed_slot_iso": "{active_iso}"}}
    - If USER INPUT rejects and NEXT ALTERNATIVE SLOT ISO is not None: acknowledge and propose it: "Understood. Alternatively, how about {next_text}?". NEXT STATE 'AWAIT_SLOT_CONFIRM'. needs_more_info: true. hr_context: {{"proposed_slot_iso": "{next_iso}"}}
    - If USER INPUT rejects and no alternative remains: RESPONSE: "Okay. It looks like that was the last listed option for now. What days or times generally work better for you?". NEXT STATE 'AWAIT_AVAILABILITY'. needs_more_info: true. hr_context: {{}}
    - If USER INPUT asks about the job or company: answer concisely using ONLY JOB DESC and COMPANY INFO (or defer to the hiring manager), then immediately re-ask about the SAME time: "Regarding the time {active_text}, does that still work for you?". NEXT STATE 'AWAIT_SLOT_CONFIRM'. needs_more_info: true. hr_context: {{"proposed_slot_iso": "{active_iso}"}}
    - If unclear: re-ask about {active_text}. NEXT STATE 'AWAIT_SLOT_CONFIRM'. needs_more_info: true. hr_context: {{"proposed_slot_iso": "{active_iso}"}}
- IF STATE 'AWAIT_AVAILABILITY': RESPONSE: "Okay, thank you for letting me know. I've made a note of your availability preference. We will reach out separately if a matching time opens up. Have a great day!". NEXT STATE 'END'. needs_more_info: false.
- IF STATE 'AWAIT_CALLBACK': RESPONSE: "Understood. Thank you for letting me know. Have a great day! Goodbye.". NEXT STATE 'END'. needs_more_info: false.
- IF STATE 'AWAIT_FINAL_Q':
    - If USER INPUT asks a question: answer it from JOB DESC and COMPANY INFO if the information is present; otherwise say "That specific detail isn't listed here, but the hiring manager can clarify during the interview." Then ask "Do you have any other questions?". NEXT STATE 'AWAIT_FINAL_Q'. needs_more_info: true. hr_context: {{}}
    - If USER INPUT confirms no more questions: RESPONSE: "Okay, great! We look forward to the interview at {active_text}. Have a wonderful day. Goodbye.". NEXT STATE 'END'. needs_more_info: false. hr_context: {{}}
    - If unclear: RESPONSE: "Sorry, I didn't quite understand. Did you have another question?". NEXT STATE 'AWAIT_FINAL_Q'. needs_more_info: true. hr_context: {{}}
- Default: RESPONSE: "Sorry, I missed that. Could you please repeat?". NEXT STATE '{current_state}'. needs_more_info: true. hr_context: {{}}

Output ONLY valid JSON with the structure {{"response_text": "...", "next_state": "...", "needs_more_info": boolean, "hr_context": {{...}}}}. "next_state" must be one of START, AWAIT_VERIFY, AWAIT_OK, AWAIT_SLOT_CONFIRM, AWAIT_AVAILABILITY, AWAIT_CALLBACK, AWAIT_FINAL_Q, END. hr_context carries only proposed_slot_iso or confirmed_slot_iso when applicable."#,
        agent = AGENT_NAME,
        company = COMPANY_NAME,
        name = ctx.name,
        first_name = first_name,
        title = ctx.title,
        company_info = or_na(&app_state.company_info),
        job_description = or_na(&app_state.job_description),
        slot_options_text = slot_options_text,
        active_iso = active_slot_iso.unwrap_or("None"),
        active_text = active_slot_text,
        next_iso = next_slot_iso.as_deref().unwrap_or("None"),
        next_text = next_slot_text.as_deref().unwrap_or(""),
        first_slot_iso = first_slot_iso,
        first_slot_text = first_slot_text,
        current_state = state.phase.tag(),
        duration = INTERVIEW_DURATION_MINUTES,
        history_json = history_json,
        input_json = input_json,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decision_with_slot_signal() {
        let raw = r#"{"response_text": "Are you available?", "next_state": "AWAIT_SLOT_CONFIRM", "needs_more_info": true, "hr_context": {"proposed_slot_iso": "2099-06-10T09:00:00+05:30"}}"#;
        let d = parse_decision_text(raw).unwrap();
        assert_eq!(d.next_state, CallPhase::AwaitSlotConfirm);
        assert!(d.needs_more_info);
        assert_eq!(
            d.proposed_slot_iso.as_deref(),
            Some("2099-06-10T09:00:00+05:30")
        );
        assert!(d.confirmed_slot_iso.is_none());
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "```json\n{\"response_text\": \"Goodbye.\", \"next_state\": \"END\", \"needs_more_info\": false}\n```";
        let d = parse_decision_text(raw).unwrap();
        assert_eq!(d.next_state, CallPhase::End);
        assert!(!d.needs_more_info);
    }

    #[test]
    fn empty_slot_strings_are_not_signals() {
        let raw = r#"{"response_text": "ok", "next_state": "AWAIT_OK", "needs_more_info": true, "hr_context": {"proposed_slot_iso": "", "confirmed_slot_iso": "  "}}"#;
        let d = parse_decision_text(raw).unwrap();
        assert!(d.proposed_slot_iso.is_none());
        assert!(d.confirmed_slot_iso.is_none());
    }

    #[test]
    fn unknown_state_tag_is_rejected() {
        let raw = r#"{"response_text": "ok", "next_state": "AWAIT_SOMETHING", "needs_more_info": true}"#;
        assert!(parse_decision_text(raw).is_err());
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(parse_decision_text(r#"{"response_text": "ok"}"#).is_err());
        assert!(parse_decision_text("not json at all").is_err());
    }

    #[test]
    fn rejection_walks_forward_through_slots_until_exhausted() {
        use chrono::TimeZone;
        use chrono_tz::Asia::Kolkata;
        let slots = vec![
            Kolkata.with_ymd_and_hms(2099, 6, 10, 9, 0, 0).unwrap(),
            Kolkata.with_ymd_and_hms(2099, 6, 11, 14, 0, 0).unwrap(),
            Kolkata.with_ymd_and_hms(2099, 6, 12, 11, 30, 0).unwrap(),
        ];
        let next = next_alternative_slot(Some("2099-06-10T09:00:00+05:30"), &slots).unwrap();
        assert_eq!(*next, slots[1]);
        let next = next_alternative_slot(Some("2099-06-11T14:00:00+05:30"), &slots).unwrap();
        assert_eq!(*next, slots[2]);
        // The latest offer has nothing after it; negotiation falls through.
        assert!(next_alternative_slot(Some("2099-06-12T11:30:00+05:30"), &slots).is_none());
        assert!(next_alternative_slot(None, &slots).is_none());
    }

    #[test]
    fn canned_decisions_end_the_call_with_spoken_text() {
        for d in [Decision::upstream_unavailable(), Decision::internal_error()] {
            assert_eq!(d.next_state, CallPhase::End);
            assert!(!d.needs_more_info);
            assert!(!d.response_text.is_empty());
        }
    }
}
