//! Timing of store operations.
//!
//! Stores receive an [`Instrumentation`] handle at construction and wrap each
//! query in [`StoreTimer::time`]. The returned [`TimerGuard`] reports the
//! elapsed time to the configured [`TimingSink`] when it goes out of scope.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Destination for finished timings.
pub trait TimingSink: Send + Sync {
    fn record(&self, store: &'static str, action: &'static str, elapsed: Duration);
}

/// Default sink: one `tracing` event per timed action.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TimingSink for TracingSink {
    fn record(&self, store: &'static str, action: &'static str, elapsed: Duration) {
        tracing::trace!(
            store,
            action,
            elapsed_us = elapsed.as_micros() as u64,
            "db timing"
        );
    }
}

/// Sink that keeps every timing in memory. Useful for asserting that a code
/// path was timed.
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<(&'static str, &'static str)>>,
}

impl RecordingSink {
    pub fn entries(&self) -> Vec<(&'static str, &'static str)> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TimingSink for RecordingSink {
    fn record(&self, store: &'static str, action: &'static str, _elapsed: Duration) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push((store, action)),
            Err(poisoned) => poisoned.into_inner().push((store, action)),
        }
    }
}

#[derive(Clone)]
pub struct Instrumentation {
    sink: Arc<dyn TimingSink>,
}

impl fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentation").finish_non_exhaustive()
    }
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl Instrumentation {
    pub fn new(sink: Arc<dyn TimingSink>) -> Self {
        Self { sink }
    }

    /// Timer bound to one store name.
    pub fn for_store(&self, store: &'static str) -> StoreTimer {
        StoreTimer {
            store,
            sink: self.sink.clone(),
        }
    }
}

#[derive(Clone)]
pub struct StoreTimer {
    store: &'static str,
    sink: Arc<dyn TimingSink>,
}

impl fmt::Debug for StoreTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreTimer")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl StoreTimer {
    /// Start timing `action`. The timing is recorded when the guard drops.
    #[must_use = "the timing is recorded when the guard is dropped"]
    pub fn time(&self, action: &'static str) -> TimerGuard {
        TimerGuard {
            store: self.store,
            action,
            started: Instant::now(),
            sink: self.sink.clone(),
        }
    }
}

pub struct TimerGuard {
    store: &'static str,
    action: &'static str,
    started: Instant,
    sink: Arc<dyn TimingSink>,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.sink
            .record(self.store, self.action, self.started.elapsed());
    }
}
