//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial JSON
//! files are accepted and missing fields keep their production default.

mod server;
mod upstream;

pub use server::*;
pub use upstream::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the relay.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "limits": { "maxConnections": 200 },
///   "upstream": { "appKey": "...", "accessKey": "..." }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MurmurSettings {
    pub server: ServerSettings,
    pub limits: LimitSettings,
    pub timeouts: TimeoutSettings,
    pub upstream: UpstreamSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
}

impl MurmurSettings {
    /// Reject combinations that would make the relay misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "limits.maxConnections must be at least 1".into(),
            ));
        }
        if self.timeouts.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "timeouts.sweepIntervalMs must be positive".into(),
            ));
        }
        if self.upstream.event_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "upstream.eventTimeoutMs must be positive".into(),
            ));
        }
        if self.upstream.terminator().is_none() {
            return Err(SettingsError::InvalidValue(format!(
                "upstream.sentenceTerminator must be a single character, got {:?}",
                self.upstream.sentence_terminator
            )));
        }
        if !self.server.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.path must start with '/', got {:?}",
                self.server.path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: MurmurSettings =
            serde_json::from_str(r#"{"limits":{"maxConnections":3}}"#).unwrap();
        assert_eq!(settings.limits.max_connections, 3);
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.timeouts.idle_timeout_ms, 30_000);
    }

    #[test]
    fn zero_connections_rejected() {
        let mut settings = MurmurSettings::default();
        settings.limits.max_connections = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn multi_char_terminator_rejected() {
        let mut settings = MurmurSettings::default();
        settings.upstream.sentence_terminator = "。！".into();
        assert!(settings.validate().is_err());

        settings.upstream.sentence_terminator = ".".into();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn relative_path_rejected() {
        let mut settings = MurmurSettings::default();
        settings.server.path = "tts".into();
        assert!(settings.validate().is_err());
    }
}
