pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Play")]
        Play(PlayAction),
        #[xmlserde(name = b"Gather")]
        Gather(GatherAction),
        #[xmlserde(name = b"Redirect")]
        Redirect(RedirectAction),
        #[xmlserde(name = b"Pause")]
        Pause(PauseAction),
        #[xmlserde(name = b"Hangup")]
        Hangup(HangupAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct PlayAction {
        #[xmlserde(ty = "text")]
        pub url: String,
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
    }

    /// Gather wraps the prompt we speak while Twilio collects the caller's
    /// speech; `action` receives the transcription webhook.
    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct GatherAction {
        #[xmlserde(name = b"input", ty = "attr")]
        pub input: Option<String>,
        #[xmlserde(name = b"action", ty = "attr")]
        pub action: Option<String>,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
        #[xmlserde(name = b"timeout", ty = "attr")]
        pub timeout: Option<u16>,
        #[xmlserde(name = b"speechTimeout", ty = "attr")]
        pub speech_timeout: Option<String>,
        #[xmlserde(name = b"speechModel", ty = "attr")]
        pub speech_model: Option<String>,
        #[xmlserde(name = b"enhanced", ty = "attr")]
        pub enhanced: Option<bool>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
        #[xmlserde(ty = "untag")]
        pub prompts: Vec<GatherPrompt>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum GatherPrompt {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Play")]
        Play(PlayAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct RedirectAction {
        #[xmlserde(ty = "text")]
        pub url: String,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct PauseAction {
        #[xmlserde(name = b"length", ty = "attr")]
        pub length: Option<u16>,
    }

    /// Hangup takes no attributes; the optional loop attribute is never set
    /// and exists only because the derive requires at least one field.
    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct HangupAction {
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
    }
}
pub use twiml::*;

mod webhook {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    impl CallStatus {
        /// Statuses after which Twilio sends nothing further for the call.
        pub fn is_terminal(&self) -> bool {
            matches!(
                self,
                CallStatus::Completed
                    | CallStatus::Busy
                    | CallStatus::Failed
                    | CallStatus::NoAnswer
                    | CallStatus::Canceled
            )
        }

        /// Terminal statuses where the candidate was never reached.
        pub fn is_unanswered(&self) -> bool {
            matches!(
                self,
                CallStatus::Busy | CallStatus::Failed | CallStatus::NoAnswer | CallStatus::Canceled
            )
        }
    }

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallDirection {
        Inbound,
        OutboundApi,
        OutboundDial,
    }

    /// Form payload Twilio posts to the voice webhook when a call connects.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct VoiceRequest {
        pub call_sid: String,
        pub direction: CallDirection,
        pub from: Option<String>,
        pub to: Option<String>,
        pub call_status: Option<CallStatus>,
    }

    /// Form payload posted by a speech Gather action.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct SpeechRequest {
        pub call_sid: String,
        #[serde(default)]
        pub speech_result: Option<String>,
        #[serde(default)]
        pub confidence: Option<String>,
    }

    /// Form payload posted to the final status callback.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct StatusRequest {
        pub call_sid: String,
        pub call_status: CallStatus,
        pub to: Option<String>,
        pub call_duration: Option<String>,
    }
}
pub use webhook::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twiml_gather_serializes_prompt_and_redirect() {
        let gather = GatherAction {
            input: Some("speech".to_string()),
            action: Some("/process-voice?call_sid=CA1".to_string()),
            method: Some("POST".to_string()),
            timeout: Some(5),
            prompts: vec![GatherPrompt::Play(PlayAction {
                url: "https://example.test/audio/CA1_x.mp3".to_string(),
                ..Default::default()
            })],
            ..Default::default()
        };
        let response = Response {
            actions: vec![
                ResponseAction::Gather(gather),
                ResponseAction::Redirect(RedirectAction {
                    url: "/reprompt?call_sid=CA1".to_string(),
                    ..Default::default()
                }),
            ],
        };
        let twiml = wrap_twiml(xmlserde::xml_serialize(response));
        assert!(twiml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(twiml.contains("<Gather"));
        assert!(twiml.contains("https://example.test/audio/CA1_x.mp3"));
        assert!(twiml.contains("<Redirect"));
    }

    #[test]
    fn speech_request_deserializes_twilio_form() {
        let body = "CallSid=CA123&SpeechResult=yes+this+is+me&Confidence=0.92";
        let req: SpeechRequest = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(req.call_sid, "CA123");
        assert_eq!(req.speech_result.as_deref(), Some("yes this is me"));
    }

    #[test]
    fn terminal_statuses() {
        let status: StatusRequest =
            serde_urlencoded::from_str("CallSid=CA1&CallStatus=no-answer").unwrap();
        assert_eq!(status.call_status, CallStatus::NoAnswer);
        assert!(status.call_status.is_terminal());
        assert!(status.call_status.is_unanswered());
        assert!(!CallStatus::InProgress.is_terminal());
        assert!(!CallStatus::Completed.is_unanswered());
    }
}
