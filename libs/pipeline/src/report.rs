//! Read counters and the report surface over them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-worker poll counters: single writer (the worker thread), many
/// readers. Stores are release-ordered, loads acquire, so observers see
/// monotone, eventually consistent values without torn reads.
#[derive(Debug, Default)]
pub struct ReadCounters {
    successful: AtomicU64,
    failed: AtomicU64,
}

impl ReadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an iteration that produced work. Single-writer only.
    #[inline]
    pub fn record_success(&self) {
        self.successful
            .store(self.successful.load(Ordering::Relaxed) + 1, Ordering::Release);
    }

    /// Record an iteration that produced nothing. Single-writer only.
    #[inline]
    pub fn record_failure(&self) {
        self.failed
            .store(self.failed.load(Ordering::Relaxed) + 1, Ordering::Release);
    }

    pub fn successful_reads(&self) -> u64 {
        self.successful.load(Ordering::Acquire)
    }

    pub fn failed_reads(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    /// `failed / (failed + successful)`, or zero before the first poll.
    pub fn failure_ratio(&self) -> f64 {
        let successful = self.successful_reads();
        let failed = self.failed_reads();
        let total = successful + failed;
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }
}

/// A read-rate report over one inbound/outbound pair of workers.
pub trait RateReport: Send + Sync {
    /// `(successful_reads, failed_reads)` of the inbound worker.
    fn inbound(&self) -> (u64, u64);

    /// `(successful_reads, failed_reads)` of the outbound worker.
    fn outbound(&self) -> (u64, u64);
}

/// Pairs the ingress consumer's counters with one egress producer's
/// counters; recorded per endpoint registration.
#[derive(Debug, Clone)]
pub struct ServiceReport {
    ingress: Arc<ReadCounters>,
    egress: Arc<ReadCounters>,
}

impl ServiceReport {
    pub fn new(ingress: Arc<ReadCounters>, egress: Arc<ReadCounters>) -> Self {
        Self { ingress, egress }
    }
}

impl RateReport for ServiceReport {
    fn inbound(&self) -> (u64, u64) {
        (self.ingress.successful_reads(), self.ingress.failed_reads())
    }

    fn outbound(&self) -> (u64, u64) {
        (self.egress.successful_reads(), self.egress.failed_reads())
    }
}
