use crate::consts::ELEVENLABS_MODEL_ID;
use crate::conversation_state::CallStore;
use crate::error::AppError;
use crate::tasks::BookingJob;

use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

pub type GoogleAuthenticator =
    gcs_common::yup_oauth2::authenticator::Authenticator<HttpsConnector<HttpConnector>>;

/// One conversation-history entry, serialized verbatim into the decision
/// prompt and the turn log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TurnMessage {
    pub role: String,
    pub content: String,
}

/// Everything the orchestrator knows about the person on the line. For
/// outbound calls this comes from the store-of-record row; inbound callers
/// get the anonymous defaults.
#[derive(Debug, Clone)]
pub struct CandidateContext {
    pub name: String,
    pub phone: String,
    pub email: String,
    pub title: String,
    /// 1-based spreadsheet row, `None` for inbound callers. Without it no
    /// booking can be written back.
    pub row_index: Option<u32>,
    pub interviewer_email: String,
    /// Raw offered-slots cell text, re-parsed each turn.
    pub available_slots: String,
}

impl CandidateContext {
    /// Context for a caller we have no row for.
    pub fn anonymous() -> Self {
        Self {
            name: "Caller".to_string(),
            phone: String::new(),
            email: String::new(),
            title: "the position".to_string(),
            row_index: None,
            interviewer_email: String::new(),
            available_slots: String::new(),
        }
    }

    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

pub struct AppState {
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_phone_number: String,
    /// Externally reachable base URL Twilio calls back on, no trailing slash.
    pub public_base_url: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub elevenlabs_api_key: String,
    pub elevenlabs_voice_id: String,
    pub sheet_id: String,
    pub calendar_id: String,
    pub company_info: String,
    pub job_description: String,
    pub audio_cache_dir: PathBuf,
    pub google_auth: GoogleAuthenticator,
    pub http_client: reqwest::Client,
    pub calls: CallStore,
    pub booking_queue: mpsc::Sender<BookingJob>,
}

impl AppState {
    /// Bearer token for the Google REST APIs, refreshed by the authenticator
    /// as needed.
    pub async fn google_token(&self, scopes: &[&str]) -> Result<String, AppError> {
        let token = self.google_auth.token(scopes).await.map_err(|e| {
            error!(error=%e, "failed to obtain google access token");
            AppError("google token error")
        })?;
        Ok(token.as_str().to_string())
    }

    pub fn audio_url(&self, file_name: &str) -> String {
        format!("{}/audio/{}", self.public_base_url, file_name)
    }

    /// Hand a booking job to the worker pool without ever blocking the
    /// webhook path.
    pub fn dispatch_booking(&self, job: BookingJob) {
        let sid = job.call_sid.clone();
        if let Err(e) = self.booking_queue.try_send(job) {
            error!(sid=%sid, error=%e, "failed to enqueue booking job; booking will not run");
        } else {
            debug!(sid=%sid, "booking job enqueued");
        }
    }

    /// Synthesize `text` and stage it under the audio cache. Returns the
    /// staged file name; the handler falls back to plain Say on any error.
    pub async fn synthesize_speech(
        &self,
        call_sid: &str,
        text: &str,
    ) -> Result<String, AppError> {
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            self.elevenlabs_voice_id,
        );
        let payload = json!({
            "text": text,
            "model_id": ELEVENLABS_MODEL_ID,
            "voice_settings": { "stability": 0.5, "similarity_boost": 0.75 },
        });
        let resp = self
            .http_client
            .post(&url)
            .header("xi-api-key", &self.elevenlabs_api_key)
            .header("Accept", "audio/mpeg")
            .json(&payload)
            .timeout(Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| {
                error!(sid=%call_sid, error=%e, "speech synthesis request failed");
                AppError("speech synthesis request error")
            })?
            .error_for_status()
            .map_err(|e| {
                error!(sid=%call_sid, error=%e, "speech synthesis rejected");
                AppError("speech synthesis rejected")
            })?;
        let audio = resp.bytes().await.map_err(|e| {
            error!(sid=%call_sid, error=%e, "failed to read synthesized audio body");
            AppError("speech synthesis body error")
        })?;

        let file_name = format!("{}_{}.mp3", call_sid, Uuid::new_v4());
        let path = self.audio_cache_dir.join(&file_name);
        tokio::fs::write(&path, &audio).await.map_err(|e| {
            error!(sid=%call_sid, error=%e, path=%path.display(), "failed to stage audio file");
            AppError("audio staging error")
        })?;
        debug!(sid=%call_sid, file=%file_name, bytes = audio.len(), "staged synthesized audio");
        Ok(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_name_takes_leading_word() {
        let mut ctx = CandidateContext::anonymous();
        ctx.name = "Asha Rao".to_string();
        assert_eq!(ctx.first_name(), "Asha");
        ctx.name = "Priya".to_string();
        assert_eq!(ctx.first_name(), "Priya");
    }

    #[test]
    fn anonymous_context_has_no_row() {
        let ctx = CandidateContext::anonymous();
        assert_eq!(ctx.name, "Caller");
        assert_eq!(ctx.title, "the position");
        assert!(ctx.row_index.is_none());
        assert!(ctx.email.is_empty());
    }
}
