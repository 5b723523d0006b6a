//! # murmur-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`MurmurSettings::default()`]
//! 2. **Settings file**: `~/.murmur/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `MURMUR_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = MurmurSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = MurmurSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.path, "/tts");
        assert_eq!(settings.limits.max_connections, 50);
        assert_eq!(settings.timeouts.idle_timeout_ms, 30_000);
        assert_eq!(settings.timeouts.max_connection_ms, 600_000);
        assert_eq!(settings.timeouts.sweep_interval_ms, 10_000);
        assert_eq!(settings.upstream.sentence_terminator, "。");
        assert_eq!(settings.upstream.sample_rate, 24_000);
    }
}
