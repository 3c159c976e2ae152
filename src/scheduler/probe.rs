//! "Has the user been active recently?" probes for the grace-period gate.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Reports when the user last interacted with the daemon.
pub trait InteractionProbe: Send + Sync {
    fn last_interaction(&self) -> Option<DateTime<Utc>>;
}

impl<F> InteractionProbe for F
where
    F: Fn() -> Option<DateTime<Utc>> + Send + Sync,
{
    fn last_interaction(&self) -> Option<DateTime<Utc>> {
        self()
    }
}

const NEVER: i64 = i64::MIN;

/// Probe updated by the chat layer whenever a user message arrives.
#[derive(Debug)]
pub struct InteractionTracker {
    last_ms: AtomicI64,
}

impl Default for InteractionTracker {
    fn default() -> Self {
        Self {
            last_ms: AtomicI64::new(NEVER),
        }
    }
}

impl InteractionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an interaction happening now.
    pub fn record(&self) {
        self.record_at(Utc::now());
    }

    pub fn record_at(&self, at: DateTime<Utc>) {
        self.last_ms.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl InteractionProbe for InteractionTracker {
    fn last_interaction(&self) -> Option<DateTime<Utc>> {
        match self.last_ms.load(Ordering::SeqCst) {
            NEVER => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}
