use crate::error::AppError;
use crate::tasks::BookingJob;
use crate::types::AppState;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventDateTime {
    date_time: String,
    time_zone: String,
}

#[derive(Serialize)]
struct Attendee {
    email: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConferenceSolutionKey {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConferenceRequest {
    request_id: String,
    conference_solution_key: ConferenceSolutionKey,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConferenceData {
    create_request: CreateConferenceRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReminderOverride {
    method: &'static str,
    minutes: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Reminders {
    use_default: bool,
    overrides: Vec<ReminderOverride>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventBody {
    summary: String,
    description: String,
    start: EventDateTime,
    end: EventDateTime,
    attendees: Vec<Attendee>,
    conference_data: ConferenceData,
    reminders: Reminders,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreatedEvent {
    pub id: String,
    #[serde(default)]
    pub html_link: Option<String>,
    #[serde(default)]
    pub hangout_link: Option<String>,
}

/// Create the interview event with both attendees, a Meet link, and email
/// plus popup reminders. Invitation emails go out from the calendar service.
pub async fn create_calendar_event(
    app_state: &Arc<AppState>,
    job: &BookingJob,
) -> Result<CreatedEvent, AppError> {
    let token = app_state.google_token(&[CALENDAR_SCOPE]).await?;
    let time_zone = job.start.timezone().name().to_string();
    let body = EventBody {
        summary: job.summary.clone(),
        description: job.description.clone(),
        start: EventDateTime {
            date_time: job.start.to_rfc3339(),
            time_zone: time_zone.clone(),
        },
        end: EventDateTime {
            date_time: job.end.to_rfc3339(),
            time_zone,
        },
        attendees: vec![
            Attendee {
                email: job.candidate_email.clone(),
            },
            Attendee {
                email: job.interviewer_email.clone(),
            },
        ],
        conference_data: ConferenceData {
            create_request: CreateConferenceRequest {
                request_id: format!("meet-{}-{}", job.call_sid, Uuid::new_v4()),
                conference_solution_key: ConferenceSolutionKey {
                    kind: "hangoutsMeet",
                },
            },
        },
        reminders: Reminders {
            use_default: false,
            overrides: vec![
                ReminderOverride {
                    method: "email",
                    minutes: 60,
                },
                ReminderOverride {
                    method: "popup",
                    minutes: 15,
                },
            ],
        },
    };

    let url = format!(
        "https://www.googleapis.com/calendar/v3/calendars/{}/events?sendNotifications=true&conferenceDataVersion=1",
        app_state.calendar_id,
    );
    let event = app_state
        .http_client
        .post(&url)
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            error!(sid=%job.call_sid, error=%e, "calendar event request failed");
            AppError("calendar event request error")
        })?
        .error_for_status()
        .map_err(|e| {
            error!(sid=%job.call_sid, error=%e, "calendar event rejected");
            AppError("calendar event rejected")
        })?
        .json::<CreatedEvent>()
        .await
        .map_err(|e| {
            error!(sid=%job.call_sid, error=%e, "failed to deserialize created event");
            AppError("calendar event deserialize error")
        })?;
    info!(sid=%job.call_sid, event_id=%event.id, meet=?event.hangout_link, "calendar event created");
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_body_serializes_google_field_names() {
        let body = EventBody {
            summary: "Interview: Asha Rao - Backend Engineer".to_string(),
            description: "details".to_string(),
            start: EventDateTime {
                date_time: "2099-06-11T14:00:00+05:30".to_string(),
                time_zone: "Asia/Kolkata".to_string(),
            },
            end: EventDateTime {
                date_time: "2099-06-11T14:45:00+05:30".to_string(),
                time_zone: "Asia/Kolkata".to_string(),
            },
            attendees: vec![Attendee {
                email: "asha@example.com".to_string(),
            }],
            conference_data: ConferenceData {
                create_request: CreateConferenceRequest {
                    request_id: "meet-CA1-x".to_string(),
                    conference_solution_key: ConferenceSolutionKey {
                        kind: "hangoutsMeet",
                    },
                },
            },
            reminders: Reminders {
                use_default: false,
                overrides: vec![ReminderOverride {
                    method: "email",
                    minutes: 60,
                }],
            },
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"dateTime\""));
        assert!(json.contains("\"timeZone\":\"Asia/Kolkata\""));
        assert!(json.contains("\"conferenceData\""));
        assert!(json.contains("\"type\":\"hangoutsMeet\""));
        assert!(json.contains("\"useDefault\":false"));
    }

    #[test]
    fn created_event_tolerates_missing_links() {
        let event: CreatedEvent = serde_json::from_str(r#"{"id": "ev1"}"#).unwrap();
        assert_eq!(event.id, "ev1");
        assert!(event.hangout_link.is_none());
    }
}
