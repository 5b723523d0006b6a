use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// In-memory counter. Monotonically increasing.
#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide relay counters, shared by the gateway and the sweep.
#[derive(Default)]
pub struct RelayMetrics {
    connections_accepted: Counter,
    connections_rejected: Counter,
    connections_evicted: Counter,
    auth_failures: Counter,
    requests_completed: Counter,
    requests_failed: Counter,
    audio_frames_sent: Counter,
    audio_bytes_sent: Counter,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.increment(1);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.increment(1);
    }

    pub fn connection_evicted(&self) {
        self.connections_evicted.increment(1);
    }

    pub fn auth_failed(&self) {
        self.auth_failures.increment(1);
    }

    pub fn request_completed(&self) {
        self.requests_completed.increment(1);
    }

    pub fn request_failed(&self) {
        self.requests_failed.increment(1);
    }

    pub fn audio_frame_sent(&self, payload_len: usize) {
        self.audio_frames_sent.increment(1);
        self.audio_bytes_sent.increment(payload_len as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.get(),
            connections_rejected: self.connections_rejected.get(),
            connections_evicted: self.connections_evicted.get(),
            auth_failures: self.auth_failures.get(),
            requests_completed: self.requests_completed.get(),
            requests_failed: self.requests_failed.get(),
            audio_frames_sent: self.audio_frames_sent.get(),
            audio_bytes_sent: self.audio_bytes_sent.get(),
        }
    }
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_evicted: u64,
    pub auth_failures: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub audio_frames_sent: u64,
    pub audio_bytes_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = RelayMetrics::new();
        metrics.connection_accepted();
        metrics.connection_accepted();
        metrics.connection_rejected();
        metrics.audio_frame_sent(16_384);
        metrics.audio_frame_sent(7_232);

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_accepted, 2);
        assert_eq!(snap.connections_rejected, 1);
        assert_eq!(snap.audio_frames_sent, 2);
        assert_eq!(snap.audio_bytes_sent, 23_616);
        assert_eq!(snap.requests_failed, 0);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(RelayMetrics::new().snapshot()).unwrap();
        assert_eq!(json["connectionsAccepted"], 0);
        assert_eq!(json["audioBytesSent"], 0);
    }
}
