//! Global atomic counters for harness runs.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    jobs_dispatched: AtomicU64,
    compiles_failed: AtomicU64,
    compiles_timed_out: AtomicU64,
    executions_failed: AtomicU64,
    executions_timed_out: AtomicU64,
    jobs_skipped: AtomicU64,
    jobs_cancelled: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_dispatched: AtomicU64::new(0),
            compiles_failed: AtomicU64::new(0),
            compiles_timed_out: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            executions_timed_out: AtomicU64::new(0),
            jobs_skipped: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
        }
    }

    /// A job left the queue and reached a backend.
    pub fn inc_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_dispatched", "counter incremented");
    }

    pub fn inc_compile_failed(&self) {
        self.compiles_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "compiles_failed", "counter incremented");
    }

    pub fn inc_compile_timed_out(&self) {
        self.compiles_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "compiles_timed_out", "counter incremented");
    }

    pub fn inc_execution_failed(&self) {
        self.executions_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_failed", "counter incremented");
    }

    pub fn inc_execution_timed_out(&self) {
        self.executions_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_timed_out", "counter incremented");
    }

    pub fn inc_skipped(&self) {
        self.jobs_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_skipped", "counter incremented");
    }

    pub fn inc_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_cancelled", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            jobs_dispatched = self.jobs_dispatched(),
            compiles_failed = self.compiles_failed(),
            compiles_timed_out = self.compiles_timed_out(),
            executions_failed = self.executions_failed(),
            executions_timed_out = self.executions_timed_out(),
            jobs_skipped = self.jobs_skipped(),
            jobs_cancelled = self.jobs_cancelled(),
        );
    }

    pub fn jobs_dispatched(&self) -> u64 {
        self.jobs_dispatched.load(Ordering::Relaxed)
    }

    pub fn compiles_failed(&self) -> u64 {
        self.compiles_failed.load(Ordering::Relaxed)
    }

    pub fn compiles_timed_out(&self) -> u64 {
        self.compiles_timed_out.load(Ordering::Relaxed)
    }

    pub fn executions_failed(&self) -> u64 {
        self.executions_failed.load(Ordering::Relaxed)
    }

    pub fn executions_timed_out(&self) -> u64 {
        self.executions_timed_out.load(Ordering::Relaxed)
    }

    pub fn jobs_skipped(&self) -> u64 {
        self.jobs_skipped.load(Ordering::Relaxed)
    }

    pub fn jobs_cancelled(&self) -> u64 {
        self.jobs_cancelled.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.jobs_dispatched,
            &self.compiles_failed,
            &self.compiles_timed_out,
            &self.executions_failed,
            &self.executions_timed_out,
            &self.jobs_skipped,
            &self.jobs_cancelled,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
