//! The single piece of shared, mutable dispatch state.

use std::path::PathBuf;

use chrono::Utc;
use volley_common::{internal, tracing};

use super::{checkpoint::ProgressCheckpoint, stats::BatchReport};

/// Counters, completion tracking and checkpoint persistence.
///
/// Lives behind one `tokio::sync::Mutex`; recording a batch and writing the
/// checkpoint happen under the same guard so successive checkpoints never
/// go backwards.
#[derive(Debug)]
pub struct Ledger {
    progress: ProgressCheckpoint,
    path: Option<PathBuf>,
}

impl Ledger {
    pub const fn new(progress: ProgressCheckpoint, path: Option<PathBuf>) -> Self {
        Self { progress, path }
    }

    pub const fn progress(&self) -> &ProgressCheckpoint {
        &self.progress
    }

    /// Fold a finished batch into the totals and persist.
    pub async fn record(&mut self, report: &BatchReport) {
        self.progress.stats.merge(&report.stats);
        if report.is_aborted() {
            self.progress.failed_batches.insert(report.index);
        }
        self.progress.mark_complete(report.index);

        internal!(
            level = DEBUG,
            batch = report.index + 1,
            watermark = self.progress.completed_batch_index,
            "Recorded batch"
        );

        self.persist().await;
    }

    /// Write the current state, if durability is still enabled.
    ///
    /// The first write failure is logged and disables further writes; the
    /// run itself carries on.
    pub async fn persist(&mut self) {
        let Some(path) = &self.path else {
            return;
        };

        self.progress.last_updated = Utc::now();
        if let Err(e) = self.progress.save(path).await {
            tracing::error!(
                path = %path.display(),
                "Unable to write progress checkpoint, continuing without one: {e}"
            );
            self.path = None;
        }
    }
}
