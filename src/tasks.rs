use crate::calendar;
use crate::conversation_state::CallState;
use crate::error::AppError;
use crate::sheets;
use crate::types::AppState;

use chrono::DateTime;
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// Everything the booking worker needs, captured at the confirmation turn so
/// the job survives the call state being cleaned up.
#[derive(Debug, Clone)]
pub struct BookingJob {
    pub call_sid: String,
    pub row_index: u32,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
    pub summary: String,
    pub description: String,
    pub candidate_email: String,
    pub interviewer_email: String,
    /// The ISO string as confirmed on the call, written back verbatim.
    pub confirmed_iso: String,
}

/// Booking worker loop. Workers share one receiver behind a mutex; the lock
/// is held only while waiting for the next job, never across the booking
/// itself.
pub async fn booking_worker(
    worker_id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<BookingJob>>>,
    app_state: Arc<AppState>,
) -> Result<(), AppError> {
    info!(worker = worker_id, "booking worker started");
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            info!(worker = worker_id, "booking queue closed; worker exiting");
            return Ok(());
        };
        info!(worker = worker_id, sid=%job.call_sid, row = job.row_index, "processing booking job");
        run_booking(&app_state, job).await;
    }
}

/// Execute one booking: create the calendar event, then write the outcome to
/// the store of record. The sheet is updated in BOTH outcomes so a row never
/// silently stays in its pre-call status.
async fn run_booking(app_state: &Arc<AppState>, job: BookingJob) {
    let (status, notes) = match calendar::create_calendar_event(app_state, &job).await {
        Ok(event) => {
            let meet = event.hangout_link.as_deref().unwrap_or("N/A");
            (
                "Scheduled",
                format!("Scheduled via agent. Meet link: {meet}"),
            )
        }
        Err(e) => {
            error!(sid=%job.call_sid, error=%e, "calendar event creation failed");
            (
                "Booking Failed",
                format!("Calendar booking failed ({e}). Manual scheduling required."),
            )
        }
    };

    if let Err(e) = sheets::update_sheet_status(
        app_state,
        job.row_index,
        status,
        &notes,
        Some(&job.confirmed_iso),
    )
    .await
    {
        if status == "Scheduled" {
            error!(
                sid=%job.call_sid,
                row = job.row_index,
                error=%e,
                inconsistent = true,
                "calendar event created but store-of-record update failed; manual reconciliation required"
            );
        } else {
            error!(sid=%job.call_sid, row = job.row_index, error=%e, "failed to record booking failure");
        }
    }
}

/// Find the next "To Call" row and place the outbound call for it. Call
/// state is registered under the returned SID before the first webhook can
/// arrive.
pub async fn run_startup_call(app_state: Arc<AppState>) -> Result<(), AppError> {
    let Some(candidate) = sheets::find_candidate_to_call(&app_state).await? else {
        info!("no candidate marked for calling; startup call skipped");
        return Ok(());
    };
    let sid = place_outbound_call(&app_state, &candidate.phone).await?;
    info!(sid=%sid, name=%candidate.name, "outbound call placed");
    app_state.calls.insert(&sid, CallState::new(candidate));
    Ok(())
}

#[derive(serde::Deserialize)]
struct CallCreated {
    sid: String,
}

async fn place_outbound_call(app_state: &Arc<AppState>, to: &str) -> Result<String, AppError> {
    let url = format!(
        "https://api.twilio.com/2010-04-01/Accounts/{}/Calls.json",
        app_state.twilio_account_sid,
    );
    let mut form: Vec<(&str, String)> = vec![
        ("To", to.to_string()),
        ("From", app_state.twilio_phone_number.clone()),
        ("Url", format!("{}/voice", app_state.public_base_url)),
        (
            "StatusCallback",
            format!("{}/call-status", app_state.public_base_url),
        ),
        ("StatusCallbackMethod", "POST".to_string()),
    ];
    for event in ["completed", "no-answer", "failed", "busy", "canceled"] {
        form.push(("StatusCallbackEvent", event.to_string()));
    }

    let created = app_state
        .http_client
        .post(&url)
        .basic_auth(
            &app_state.twilio_account_sid,
            Some(&app_state.twilio_auth_token),
        )
        .form(&form)
        .send()
        .await
        .map_err(|e| {
            error!(error=%e, "outbound call request failed");
            AppError("outbound call request error")
        })?
        .error_for_status()
        .map_err(|e| {
            error!(error=%e, "outbound call rejected");
            AppError("outbound call rejected")
        })?
        .json::<CallCreated>()
        .await
        .map_err(|e| {
            error!(error=%e, "failed to deserialize call creation response");
            AppError("call creation deserialize error")
        })?;
    if created.sid.is_empty() {
        warn!("call creation response carried an empty sid");
        return Err(AppError("empty call sid"));
    }
    Ok(created.sid)
}
