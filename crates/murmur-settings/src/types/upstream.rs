//! Synthesis provider and client authentication settings.
//!
//! Secret fields are accepted from files and the environment but never
//! serialized back out, and `Debug` redacts them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bidirectional TTS provider connection.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    /// Provider websocket URL.
    pub endpoint: String,
    /// Application key sent as `X-Api-App-Key`.
    pub app_key: String,
    /// Access key sent as `X-Api-Access-Key`.
    #[serde(skip_serializing)]
    pub access_key: String,
    /// Upper bound on any single wait for a provider event.
    pub event_timeout_ms: u64,
    /// Character that splits input text into per-sentence sessions.
    pub sentence_terminator: String,
    pub audio_format: String,
    pub sample_rate: u32,
    pub enable_timestamp: bool,
}

impl UpstreamSettings {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    /// The terminator as a `char`, if it is exactly one character.
    pub fn terminator(&self) -> Option<char> {
        let mut chars = self.sentence_terminator.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            endpoint: "wss://openspeech.bytedance.com/api/v3/tts/bidirection".to_string(),
            app_key: String::new(),
            access_key: String::new(),
            event_timeout_ms: 10_000,
            sentence_terminator: "。".to_string(),
            audio_format: "pcm".to_string(),
            sample_rate: 24_000,
            enable_timestamp: true,
        }
    }
}

impl std::fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("endpoint", &self.endpoint)
            .field("app_key", &self.app_key)
            .field("access_key", &"[REDACTED]")
            .field("event_timeout_ms", &self.event_timeout_ms)
            .field("sentence_terminator", &self.sentence_terminator)
            .field("audio_format", &self.audio_format)
            .field("sample_rate", &self.sample_rate)
            .field("enable_timestamp", &self.enable_timestamp)
            .finish()
    }
}

/// Client token validation.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret used to validate client tokens.
    #[serde(skip_serializing)]
    pub jwt_secret: String,
    /// Clock skew tolerated on `exp`.
    pub leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            leeway_secs: 30,
        }
    }
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &"[REDACTED]")
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_not_serialized() {
        let settings = UpstreamSettings {
            access_key: "hunter2".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("accessKey"));

        let auth = AuthSettings {
            jwt_secret: "jwt-secret".into(),
            ..Default::default()
        };
        assert!(!serde_json::to_string(&auth).unwrap().contains("jwt-secret"));
    }

    #[test]
    fn secrets_are_deserialized() {
        let settings: UpstreamSettings =
            serde_json::from_str(r#"{"accessKey":"k","appKey":"a"}"#).unwrap();
        assert_eq!(settings.access_key, "k");
        assert_eq!(settings.app_key, "a");
    }

    #[test]
    fn debug_redacts_secrets() {
        let settings = UpstreamSettings {
            access_key: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{settings:?}").contains("hunter2"));
        let auth = AuthSettings {
            jwt_secret: "jwt-secret".into(),
            ..Default::default()
        };
        assert!(!format!("{auth:?}").contains("jwt-secret"));
    }

    #[test]
    fn terminator_parsing() {
        let mut settings = UpstreamSettings::default();
        assert_eq!(settings.terminator(), Some('。'));
        settings.sentence_terminator = String::new();
        assert_eq!(settings.terminator(), None);
    }
}
