//! JSON bodies for StartSession and TaskRequest frames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::Event;

const ADDITIONS: &str = r#"{"disable_markdown_filter":true,"enable_word_timestamps":true}"#;

/// Output audio parameters requested from the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub enable_timestamp: bool,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "pcm".to_string(),
            sample_rate: 24_000,
            enable_timestamp: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct User {
    uid: String,
}

#[derive(Debug, Serialize)]
struct ReqParams<'a> {
    speaker: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    audio_params: &'a AudioParams,
    additions: &'static str,
}

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    user: &'a User,
    event: i32,
    req_params: ReqParams<'a>,
}

/// Shared request fields for one synthesis; the uid is fresh per request.
#[derive(Debug)]
pub struct RequestTemplate<'a> {
    user: User,
    speaker: &'a str,
    audio: &'a AudioParams,
}

impl<'a> RequestTemplate<'a> {
    pub fn new(speaker: &'a str, audio: &'a AudioParams) -> Self {
        Self {
            user: User {
                uid: Uuid::now_v7().to_string(),
            },
            speaker,
            audio,
        }
    }

    pub fn start_session(&self) -> Vec<u8> {
        self.render(Event::START_SESSION, None)
    }

    pub fn task_request(&self, text: &str) -> Vec<u8> {
        self.render(Event::TASK_REQUEST, Some(text))
    }

    fn render(&self, event: Event, text: Option<&str>) -> Vec<u8> {
        let body = RequestBody {
            user: &self.user,
            event: event.0,
            req_params: ReqParams {
                speaker: self.speaker,
                text,
                audio_params: self.audio,
                additions: ADDITIONS,
            },
        };
        // Plain structs of strings and integers always serialize.
        serde_json::to_vec(&body).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn start_session_has_no_text() {
        let audio = AudioParams::default();
        let template = RequestTemplate::new("zh_female_1", &audio);
        let body: Value = serde_json::from_slice(&template.start_session()).unwrap();

        assert_eq!(body["event"], 100);
        assert_eq!(body["req_params"]["speaker"], "zh_female_1");
        assert!(body["req_params"].get("text").is_none());
        assert_eq!(body["req_params"]["audio_params"]["sample_rate"], 24_000);
        assert_eq!(body["req_params"]["audio_params"]["format"], "pcm");
    }

    #[test]
    fn task_request_carries_one_character() {
        let audio = AudioParams::default();
        let template = RequestTemplate::new("v", &audio);
        let body: Value = serde_json::from_slice(&template.task_request("你")).unwrap();

        assert_eq!(body["event"], 200);
        assert_eq!(body["req_params"]["text"], "你");
    }

    #[test]
    fn additions_are_a_json_string() {
        let audio = AudioParams::default();
        let template = RequestTemplate::new("v", &audio);
        let body: Value = serde_json::from_slice(&template.start_session()).unwrap();

        let additions: Value =
            serde_json::from_str(body["req_params"]["additions"].as_str().unwrap()).unwrap();
        assert_eq!(additions["disable_markdown_filter"], true);
        assert_eq!(additions["enable_word_timestamps"], true);
    }

    #[test]
    fn uid_is_stable_within_a_request() {
        let audio = AudioParams::default();
        let template = RequestTemplate::new("v", &audio);
        let a: Value = serde_json::from_slice(&template.start_session()).unwrap();
        let b: Value = serde_json::from_slice(&template.task_request("x")).unwrap();
        assert_eq!(a["user"]["uid"], b["user"]["uid"]);
    }
}
