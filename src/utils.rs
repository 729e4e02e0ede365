use crate::consts::TURN_LOG_FILE;
use crate::types::GoogleAuthenticator;

use gcs_common::yup_oauth2;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Service-account authenticator shared by the Sheets and Calendar clients.
/// `credentials_json` is the key file content itself, not a path.
pub async fn google_authenticator(credentials_json: &str) -> GoogleAuthenticator {
    let conn = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http2()
        .build();
    let tls_client = hyper::Client::builder().build(conn);
    let service_account_key = yup_oauth2::parse_service_account_key(credentials_json)
        .expect("failed to read google service account key");
    yup_oauth2::ServiceAccountAuthenticator::builder(service_account_key)
        .hyper_client(tls_client)
        .persist_tokens_to_disk("tokencache.json")
        .build()
        .await
        .expect("ServiceAccount authenticator failed.")
}

/// Audio files are served by bare file name only; anything that could
/// traverse out of the cache directory is rejected.
pub fn is_safe_audio_name(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && !name.contains('/') && !name.contains('\\')
}

/// One line of the append-only conversation log, written per processed turn.
#[derive(Serialize)]
pub struct TurnLogEntry<'a> {
    pub ts: String,
    pub sid: &'a str,
    pub input: &'a str,
    pub confidence: &'a str,
    pub state: &'a str,
    pub next: &'a str,
    pub more: bool,
    pub out: &'a str,
}

/// Append one JSON line to the conversation log. Logging failures are
/// reported but never fail the turn.
pub async fn append_turn_log(entry: &TurnLogEntry<'_>) {
    let line = match serde_json::to_string(entry) {
        Ok(line) => line,
        Err(e) => {
            warn!(error=%e, "failed to serialize turn log entry");
            return;
        }
    };
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(TURN_LOG_FILE)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await
    }
    .await;
    if let Err(e) = result {
        warn!(error=%e, "failed to append turn log entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_names_are_vetted() {
        assert!(is_safe_audio_name("CA123_9f8e.mp3"));
        assert!(!is_safe_audio_name(""));
        assert!(!is_safe_audio_name("../secrets.txt"));
        assert!(!is_safe_audio_name("/etc/passwd"));
        assert!(!is_safe_audio_name("audio\\..\\x.mp3"));
        assert!(!is_safe_audio_name("sub/dir.mp3"));
    }
}
