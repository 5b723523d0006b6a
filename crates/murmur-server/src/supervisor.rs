//! Periodic eviction of idle and over-age connections.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use murmur_core::RelayError;
use murmur_settings::TimeoutSettings;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::ClientConnection;
use crate::gateway::Gateway;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub idle: Duration,
    pub max_age: Duration,
    pub interval: Duration,
}

impl From<&TimeoutSettings> for TimeoutPolicy {
    fn from(settings: &TimeoutSettings) -> Self {
        Self {
            idle: settings.idle_timeout(),
            max_age: settings.max_connection(),
            interval: settings.sweep_interval(),
        }
    }
}

/// Which threshold a connection crossed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiry {
    Idle(Duration),
    MaxAge(Duration),
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle(d) => write!(f, "idle for {}s", d.as_secs()),
            Self::MaxAge(d) => write!(f, "open for {}s, over the lifetime limit", d.as_secs()),
        }
    }
}

impl TimeoutPolicy {
    /// A connection with a request in flight is not idle; lifetime still applies.
    pub fn check(&self, conn: &ClientConnection, now: Instant) -> Option<Expiry> {
        let age = now.saturating_duration_since(conn.created_at());
        if age > self.max_age {
            return Some(Expiry::MaxAge(age));
        }
        if conn.is_busy() {
            return None;
        }
        let idle = now.saturating_duration_since(conn.last_activity());
        (idle > self.idle).then_some(Expiry::Idle(idle))
    }
}

/// Evict every expired connection. Returns how many were evicted.
pub fn sweep(gateway: &Gateway, policy: &TimeoutPolicy, now: Instant) -> usize {
    let mut evicted = 0;
    for conn in gateway.registry().snapshot() {
        let Some(expiry) = policy.check(&conn, now) else {
            continue;
        };
        let err = RelayError::TimeoutEviction(expiry.to_string());
        if gateway.evict(&conn.id, &err) {
            evicted += 1;
        }
    }
    evicted
}

/// Run [`sweep`] every `policy.interval` until `cancel` fires.
pub fn spawn_supervisor(
    gateway: Arc<Gateway>,
    policy: TimeoutPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = sweep(&gateway, &policy, Instant::now());
                    if evicted > 0 {
                        info!(evicted, remaining = gateway.registry().len(), "timeout sweep");
                    }
                }
            }
        }
        debug!("timeout supervisor stopped");
    })
}
