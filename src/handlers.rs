use crate::consts::{FALLBACK_LANG, FALLBACK_VOICE, GATHER_TIMEOUT_SECS};
use crate::conversation_state::{self, CallState};
use crate::twilio_types::{
    wrap_twiml, CallDirection, GatherAction, GatherPrompt, HangupAction, PauseAction, PlayAction,
    RedirectAction, Response, ResponseAction, SayAction, SpeechRequest, StatusRequest,
    VoiceRequest,
};
use crate::types::{AppState, CandidateContext};
use crate::utils;

use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn xml_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/xml"));
    headers
}

fn say_action(text: &str) -> SayAction {
    SayAction {
        text: text.to_string(),
        voice: Some(FALLBACK_VOICE.to_string()),
        language: Some(FALLBACK_LANG.to_string()),
        ..Default::default()
    }
}

fn twiml_response(actions: Vec<ResponseAction>) -> (StatusCode, HeaderMap, String) {
    let body = wrap_twiml(xmlserde::xml_serialize(Response { actions }));
    (StatusCode::OK, xml_headers(), body)
}

/// Gather the next utterance while playing the staged audio (or speaking the
/// fallback). The trailing Redirect fires only when the gather collects
/// nothing.
fn gather_turn(
    app_state: &AppState,
    call_sid: &str,
    audio_file: Option<&str>,
    text: &str,
) -> Vec<ResponseAction> {
    let prompt = match audio_file {
        Some(file) => GatherPrompt::Play(PlayAction {
            url: app_state.audio_url(file),
            ..Default::default()
        }),
        None => GatherPrompt::Say(say_action(text)),
    };
    vec![
        ResponseAction::Gather(GatherAction {
            input: Some("speech".to_string()),
            action: Some(format!(
                "{}/process-voice?call_sid={}",
                app_state.public_base_url, call_sid
            )),
            method: Some("POST".to_string()),
            timeout: Some(GATHER_TIMEOUT_SECS),
            speech_timeout: Some("auto".to_string()),
            speech_model: Some("phone_call".to_string()),
            enhanced: Some(true),
            language: Some(FALLBACK_LANG.to_string()),
            prompts: vec![prompt],
        }),
        ResponseAction::Redirect(RedirectAction {
            url: format!(
                "{}/reprompt?call_sid={}",
                app_state.public_base_url, call_sid
            ),
            method: Some("POST".to_string()),
        }),
    ]
}

/// Speak a final message, pause so the tail is not clipped, and hang up.
fn farewell_turn(
    app_state: &AppState,
    audio_file: Option<&str>,
    text: &str,
) -> Vec<ResponseAction> {
    let spoken = match audio_file {
        Some(file) => ResponseAction::Play(PlayAction {
            url: app_state.audio_url(file),
            ..Default::default()
        }),
        None => ResponseAction::Say(say_action(text)),
    };
    vec![
        spoken,
        ResponseAction::Pause(PauseAction { length: Some(1) }),
        ResponseAction::Hangup(HangupAction::default()),
    ]
}

/// Synthesize the response for playback. `None` means the caller falls back
/// to plain Say; the turn never fails on synthesis.
async fn stage_audio(app_state: &Arc<AppState>, call_sid: &str, text: &str) -> Option<String> {
    match app_state.synthesize_speech(call_sid, text).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(sid=%call_sid, error=%e, "speech synthesis unavailable; falling back to plain say");
            None
        }
    }
}

/// First webhook of a call. Outbound calls find their pre-registered state;
/// inbound callers get an anonymous context on the spot.
pub async fn voice_handler(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, HeaderMap, String) {
    let request: VoiceRequest = match serde_urlencoded::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            error!(error=%e, body=%body, "unparsable voice webhook");
            return twiml_response(farewell_turn(
                &app_state,
                None,
                "There was an error initiating this call. Goodbye.",
            ));
        }
    };
    let call_sid = request.call_sid.clone();
    info!(sid=%call_sid, direction=?request.direction, "voice webhook received");

    let entry = match request.direction {
        CallDirection::Inbound => Some(
            app_state
                .calls
                .insert(&call_sid, CallState::new(CandidateContext::anonymous())),
        ),
        _ => app_state.calls.get(&call_sid),
    };
    let Some(entry) = entry else {
        error!(sid=%call_sid, "no registered state for outbound call");
        return twiml_response(farewell_turn(
            &app_state,
            None,
            "There was an error initiating this call. Goodbye.",
        ));
    };

    let mut state = entry.lock().await;
    state.reset_for_start();
    let outcome = conversation_state::advance_call(&app_state, &call_sid, &mut state, None).await;
    let keep_listening = outcome.keep_listening;
    drop(state);

    if let Some(job) = outcome.booking {
        app_state.dispatch_booking(job);
    }
    let audio = stage_audio(&app_state, &call_sid, &outcome.response_text).await;
    if keep_listening {
        twiml_response(gather_turn(
            &app_state,
            &call_sid,
            audio.as_deref(),
            &outcome.response_text,
        ))
    } else {
        app_state.calls.cleanup(&call_sid);
        twiml_response(farewell_turn(
            &app_state,
            audio.as_deref(),
            &outcome.response_text,
        ))
    }
}

/// Gather result webhook: one conversational turn.
pub async fn process_voice_handler(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, HeaderMap, String) {
    let request: SpeechRequest = match serde_urlencoded::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            error!(error=%e, body=%body, "unparsable speech webhook");
            return twiml_response(farewell_turn(
                &app_state,
                None,
                "I'm sorry, something went wrong on our side. Goodbye.",
            ));
        }
    };
    let call_sid = request.call_sid.clone();

    let Some(entry) = app_state.calls.get(&call_sid) else {
        warn!(sid=%call_sid, "speech webhook for unknown call");
        return twiml_response(farewell_turn(
            &app_state,
            None,
            "I seem to have lost our context. Apologies, goodbye.",
        ));
    };

    let speech = request
        .speech_result
        .as_deref()
        .map(str::trim)
        .unwrap_or("");
    if speech.is_empty() {
        // Gather posted without a transcription; re-ask without burning a
        // decision step.
        debug!(sid=%call_sid, "empty speech result; reprompting");
        let text = "Sorry, I didn't catch that. Could you say it again?";
        let audio = stage_audio(&app_state, &call_sid, text).await;
        return twiml_response(gather_turn(&app_state, &call_sid, audio.as_deref(), text));
    }
    info!(sid=%call_sid, speech=%speech, confidence=?request.confidence, "caller utterance");

    let mut state = entry.lock().await;
    let prior_phase = state.phase;
    let outcome =
        conversation_state::advance_call(&app_state, &call_sid, &mut state, Some(speech)).await;
    let next_phase = state.phase;
    let keep_listening = outcome.keep_listening;
    drop(state);

    if let Some(job) = outcome.booking {
        app_state.dispatch_booking(job);
    }
    utils::append_turn_log(&utils::TurnLogEntry {
        ts: Utc::now().to_rfc3339(),
        sid: &call_sid,
        input: speech,
        confidence: request.confidence.as_deref().unwrap_or(""),
        state: prior_phase.tag(),
        next: next_phase.tag(),
        more: keep_listening,
        out: &outcome.response_text,
    })
    .await;

    let audio = stage_audio(&app_state, &call_sid, &outcome.response_text).await;
    if keep_listening {
        twiml_response(gather_turn(
            &app_state,
            &call_sid,
            audio.as_deref(),
            &outcome.response_text,
        ))
    } else {
        app_state.calls.cleanup(&call_sid);
        twiml_response(farewell_turn(
            &app_state,
            audio.as_deref(),
            &outcome.response_text,
        ))
    }
}

/// Final status callback. Unanswered outbound calls get their row marked so
/// nobody re-dials blindly; terminal statuses always clean up call state.
pub async fn call_status_handler(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> StatusCode {
    let request: StatusRequest = match serde_urlencoded::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            error!(error=%e, body=%body, "unparsable status callback");
            return StatusCode::BAD_REQUEST;
        }
    };
    let call_sid = request.call_sid;
    let status = request.call_status;
    info!(sid=%call_sid, status=?status, duration=?request.call_duration, "status callback");

    let row_info = match app_state.calls.get(&call_sid) {
        Some(entry) => {
            let state = entry.lock().await;
            (state.context.row_index, state.booking_dispatched)
        }
        None => (None, false),
    };

    if status.is_unanswered() {
        if let (Some(row), false) = row_info {
            let note = format!(
                "Final call status: {:?} ({})",
                status,
                Utc::now().format("%Y-%m-%d %H:%M"),
            );
            if let Err(e) = crate::sheets::update_sheet_status(
                &app_state,
                row,
                "No Answer / Failed",
                &note,
                None,
            )
            .await
            {
                error!(sid=%call_sid, row, error=%e, "failed to record unanswered call");
            }
        }
    }

    if status.is_terminal() {
        app_state.calls.cleanup(&call_sid);
    }
    StatusCode::OK
}

#[derive(Deserialize)]
pub struct CallSidParam {
    pub call_sid: Option<String>,
}

/// Reached only when a Gather collected nothing at all. Says goodbye, marks
/// the row when the call never got anywhere, and drops the state.
pub async fn reprompt_handler(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<CallSidParam>,
    body: String,
) -> (StatusCode, HeaderMap, String) {
    let call_sid = params.call_sid.or_else(|| {
        serde_urlencoded::from_str::<SpeechRequest>(&body)
            .ok()
            .map(|r| r.call_sid)
    });
    let text =
        "Sorry, I didn't hear anything. Please call back if you'd like to continue. Goodbye.";

    if let Some(call_sid) = call_sid {
        info!(sid=%call_sid, "gather timed out with no speech; ending call");
        if let Some(entry) = app_state.calls.get(&call_sid) {
            let (row, dispatched) = {
                let state = entry.lock().await;
                (state.context.row_index, state.booking_dispatched)
            };
            if let (Some(row), false) = (row, dispatched) {
                let note = format!(
                    "Call went silent before scheduling ({})",
                    Utc::now().format("%Y-%m-%d %H:%M"),
                );
                if let Err(e) = crate::sheets::update_sheet_status(
                    &app_state,
                    row,
                    "No Answer / Failed",
                    &note,
                    None,
                )
                .await
                {
                    error!(sid=%call_sid, row, error=%e, "failed to record silent call");
                }
            }
        }
        app_state.calls.cleanup(&call_sid);
    } else {
        warn!("reprompt without a call sid");
    }
    twiml_response(farewell_turn(&app_state, None, text))
}

/// Serve one staged audio file by bare name.
pub async fn serve_audio_handler(
    State(app_state): State<Arc<AppState>>,
    Path(file_name): Path<String>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut headers = HeaderMap::new();
    if !utils::is_safe_audio_name(&file_name) {
        warn!(file=%file_name, "rejected unsafe audio file name");
        return (StatusCode::BAD_REQUEST, headers, vec![]);
    }
    let path = app_state.audio_cache_dir.join(&file_name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("audio/mpeg"));
            (StatusCode::OK, headers, bytes)
        }
        Err(e) => {
            debug!(file=%file_name, error=%e, "audio file not found");
            (StatusCode::NOT_FOUND, headers, vec![])
        }
    }
}

pub async fn hello_handler() -> &'static str {
    "hr-agent-rs here!\n"
}
