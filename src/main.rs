mod calendar;
mod conversation_state;
mod decision;
mod error;
mod gemini_types;
mod handlers;
mod sheets;
mod slots;
mod tasks;
mod twilio_types;
mod types;
mod utils;

use crate::conversation_state::CallStore;
use crate::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};
use tracing_subscriber::prelude::*;

pub mod consts {
    use chrono_tz::Tz;

    pub const COMPANY_NAME: &str = "Panda Technologies";
    pub const AGENT_NAME: &str = "Ayushi";
    pub const AGENT_TIMEZONE: Tz = chrono_tz::Asia::Kolkata;
    pub const INTERVIEW_DURATION_MINUTES: i64 = 45;
    pub const HISTORY_LIMIT: usize = 10;
    pub const PROMPT_HISTORY_WINDOW: usize = 6;
    pub const FALLBACK_VOICE: &str = "Google.en-IN-Wavenet-A";
    pub const FALLBACK_LANG: &str = "en-IN";
    pub const ELEVENLABS_MODEL_ID: &str = "eleven_multilingual_v2";
    pub const GATHER_TIMEOUT_SECS: u16 = 5;
    pub const BOOKING_WORKERS: usize = 2;
    pub const BOOKING_QUEUE_DEPTH: usize = 32;
    pub const AUDIO_CACHE_DIR: &str = "audio_cache";
    pub const TURN_LOG_FILE: &str = "hr_agent_conversations.log";
}

async fn load_text_file(path: &str) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            warn!(path, error=%e, "context file missing; continuing without it");
            String::new()
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("hr_agent_rs", tracing_subscriber::filter::LevelFilter::DEBUG),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let twilio_account_sid = env::var("TWILIO_ACCOUNT_SID").expect("TWILIO_ACCOUNT_SID not set!");
    let twilio_auth_token = env::var("TWILIO_AUTH_TOKEN").expect("TWILIO_AUTH_TOKEN not set!");
    let twilio_phone_number =
        env::var("TWILIO_PHONE_NUMBER").expect("TWILIO_PHONE_NUMBER not set!");
    let public_base_url = env::var("PUBLIC_BASE_URL")
        .expect("PUBLIC_BASE_URL not set!")
        .trim_end_matches('/')
        .to_string();
    let gemini_api_key = env::var("GEMINI_API_KEY").expect("GEMINI_API_KEY not set!");
    let gemini_model =
        env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-1.5-flash".to_string());
    let elevenlabs_api_key = env::var("ELEVENLABS_API_KEY").expect("ELEVENLABS_API_KEY not set!");
    let elevenlabs_voice_id =
        env::var("ELEVENLABS_VOICE_ID").expect("ELEVENLABS_VOICE_ID not set!");
    let sheet_id = env::var("SHEET_ID").expect("SHEET_ID not set!");
    let calendar_id = env::var("CALENDAR_ID").expect("CALENDAR_ID not set!");
    let google_credentials = env::var("GOOGLE_APPLICATION_CREDENTIALS")
        .expect("No google application credentials set.");
    let google_auth = utils::google_authenticator(&google_credentials).await;

    let company_info = load_text_file("companyinfo.txt").await;
    let job_description = load_text_file("job_description.txt").await;

    let audio_cache_dir = PathBuf::from(consts::AUDIO_CACHE_DIR);
    tokio::fs::create_dir_all(&audio_cache_dir)
        .await
        .expect("failed to create audio cache directory");

    let (booking_tx, booking_rx) = mpsc::channel(consts::BOOKING_QUEUE_DEPTH);
    let booking_rx = Arc::new(Mutex::new(booking_rx));

    let app_state = Arc::new(AppState {
        twilio_account_sid,
        twilio_auth_token,
        twilio_phone_number,
        public_base_url,
        gemini_api_key,
        gemini_model,
        elevenlabs_api_key,
        elevenlabs_voice_id,
        sheet_id,
        calendar_id,
        company_info,
        job_description,
        audio_cache_dir,
        google_auth,
        http_client: reqwest::Client::new(),
        calls: CallStore::new(),
        booking_queue: booking_tx,
    });

    for worker_id in 0..consts::BOOKING_WORKERS {
        let jobs = booking_rx.clone();
        let state = app_state.clone();
        tokio::spawn(async move {
            if let Err(e) = tasks::booking_worker(worker_id, jobs, state).await {
                error!(worker = worker_id, error=%e, "booking worker exited with error");
            }
        });
    }

    {
        let state = app_state.clone();
        tokio::spawn(async move {
            if let Err(e) = tasks::run_startup_call(state).await {
                error!(error=%e, "startup outbound call failed");
            }
        });
    }

    let app = Router::new()
        .route("/voice", post(handlers::voice_handler))
        .route("/process-voice", post(handlers::process_voice_handler))
        .route("/call-status", post(handlers::call_status_handler))
        .route("/reprompt", post(handlers::reprompt_handler))
        .route("/audio/:file_name", get(handlers::serve_audio_handler))
        .route("/", get(handlers::hello_handler))
        .with_state(app_state);

    axum::Server::bind(&"0.0.0.0:3000".parse().unwrap())
        .serve(app.into_make_service())
        .await
        .unwrap();
}
