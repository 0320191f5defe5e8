//! Engine counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters recorded by the engine as requests pass through it
#[derive(Debug, Default)]
pub struct EngineMetrics {
    requests: AtomicU64,
    aborted: AtomicU64,
    escaped: AtomicU64,
    reused: AtomicU64,
    allocated: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_started(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "requests", "Metric incremented");
    }

    pub fn request_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "aborted", "Metric incremented");
    }

    pub fn context_escaped(&self) {
        self.escaped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "escaped", "Metric incremented");
    }

    /// Records where an acquired context came from.
    pub fn context_acquired(&self, reused: bool) {
        if reused {
            self.reused.fetch_add(1, Ordering::Relaxed);
        } else {
            self.allocated.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(reused, "Context acquired");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            escaped: self.escaped.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub aborted: u64,
    pub escaped: u64,
    pub reused: u64,
    pub allocated: u64,
}
