//! Server, admission, timeout and logging settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// WebSocket endpoint path.
    pub path: String,
    /// Outbound frames buffered per client before senders wait.
    pub send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/tts".to_string(),
            send_queue: 256,
        }
    }
}

/// Admission control.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Maximum simultaneous client connections.
    pub max_connections: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self { max_connections: 50 }
    }
}

/// Eviction thresholds for the timeout sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    /// Evict after this long without inbound or outbound traffic.
    pub idle_timeout_ms: u64,
    /// Evict after this long regardless of activity.
    pub max_connection_ms: u64,
    /// How often the sweep runs.
    pub sweep_interval_ms: u64,
}

impl TimeoutSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_connection(&self) -> Duration {
        Duration::from_millis(self.max_connection_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            max_connection_ms: 600_000,
            sweep_interval_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_durations() {
        let t = TimeoutSettings::default();
        assert_eq!(t.idle_timeout(), Duration::from_secs(30));
        assert_eq!(t.max_connection(), Duration::from_secs(600));
        assert_eq!(t.sweep_interval(), Duration::from_secs(10));
    }

    #[test]
    fn server_settings_serialize_camel_case() {
        let json = serde_json::to_value(ServerSettings::default()).unwrap();
        assert_eq!(json["sendQueue"], 256);
        assert_eq!(json["path"], "/tts");
    }
}
