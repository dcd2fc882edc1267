//! Campaign counters and the outcome of a single batch.

use volley_common::Domain;

use crate::classify::{DeliveryOutcome, Exhaustion};

/// Cumulative delivery counters.
///
/// `failed` is always the sum of the five breakdown counters, and
/// `attempted == sent + failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub attempted: u64,
    pub sent: u64,
    pub failed: u64,
    pub rejected: u64,
    pub over_quota: u64,
    pub insufficient_storage: u64,
    pub transient: u64,
    pub unroutable: u64,
}

impl DispatchStats {
    /// Count one recipient's outcome.
    pub const fn record(&mut self, outcome: DeliveryOutcome) {
        self.attempted += 1;
        match outcome {
            DeliveryOutcome::Accepted => {
                self.sent += 1;
                return;
            }
            DeliveryOutcome::Rejected => self.rejected += 1,
            DeliveryOutcome::ResourceExhausted(Exhaustion::OverQuota) => self.over_quota += 1,
            DeliveryOutcome::ResourceExhausted(Exhaustion::InsufficientStorage) => {
                self.insufficient_storage += 1;
            }
            DeliveryOutcome::TransientError => self.transient += 1,
        }
        self.failed += 1;
    }

    /// Count `count` recipients whose domain could not be resolved.
    pub const fn record_unroutable(&mut self, count: u64) {
        self.attempted += count;
        self.failed += count;
        self.unroutable += count;
    }

    pub const fn merge(&mut self, other: &Self) {
        self.attempted += other.attempted;
        self.sent += other.sent;
        self.failed += other.failed;
        self.rejected += other.rejected;
        self.over_quota += other.over_quota;
        self.insufficient_storage += other.insufficient_storage;
        self.transient += other.transient;
        self.unroutable += other.unroutable;
    }
}

/// What happened to one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub index: usize,
    pub domain: Domain,
    pub stats: DispatchStats,
    /// Set when the batch was abandoned as a whole (no route, no connection,
    /// or the session broke mid-batch).
    pub aborted: Option<String>,
}

impl BatchReport {
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }
}
