use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

/// Process-wide cap on simultaneous client connections.
///
/// One instance per process. Scaling past one process needs an external
/// shared counter; two controllers never coordinate with each other.
pub struct AdmissionController {
    in_use: AtomicUsize,
    max: usize,
}

impl AdmissionController {
    pub fn new(max: usize) -> Self {
        Self {
            in_use: AtomicUsize::new(0),
            max,
        }
    }

    /// Take a slot if one is free. A refused call changes nothing.
    pub fn acquire(&self) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give a slot back. Never goes below zero.
    pub fn release(&self) {
        let released = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            warn!("admission release with no slots in use");
        }
    }

    pub fn count(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
