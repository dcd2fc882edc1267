//! Durable campaign progress.
//!
//! The checkpoint is a flat `key=value` file, one pair per line:
//!
//! ```text
//! completed_batch_index=3
//! total_batches=10
//! sent_count=598
//! failed_count=2
//! attempted_count=600
//! rejected_count=1
//! over_quota_count=1
//! insufficient_storage_count=0
//! transient_count=0
//! unroutable_count=0
//! completed_ahead=5,6
//! failed_batches=
//! last_updated=2025-01-01T12:00:00+00:00
//! ```
//!
//! `completed_batch_index` is the watermark: batches `1..=completed_batch_index`
//! are all finished. Batch numbers in `completed_ahead` and `failed_batches`
//! are 1-based, as shown in the logs.
//!
//! Writes go to a `.tmp` sibling first and are renamed into place, so a crash
//! never leaves a half-written checkpoint behind.

use std::{
    collections::BTreeSet,
    fmt::Write as _,
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tokio::fs;

use crate::{dispatch::stats::DispatchStats, error::CheckpointError};

/// A snapshot of dispatch progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressCheckpoint {
    /// Number of leading batches that are all complete.
    pub completed_batch_index: usize,
    pub total_batches: usize,
    pub stats: DispatchStats,
    /// 0-based indices of batches finished beyond the watermark.
    pub completed_ahead: BTreeSet<usize>,
    /// 0-based indices of batches that were abandoned as a whole.
    pub failed_batches: BTreeSet<usize>,
    pub last_updated: DateTime<Utc>,
}

impl ProgressCheckpoint {
    #[must_use]
    pub fn new(total_batches: usize) -> Self {
        Self {
            completed_batch_index: 0,
            total_batches,
            stats: DispatchStats::default(),
            completed_ahead: BTreeSet::new(),
            failed_batches: BTreeSet::new(),
            last_updated: Utc::now(),
        }
    }

    /// Whether the batch at `index` needs no further work.
    #[must_use]
    pub fn is_complete(&self, index: usize) -> bool {
        index < self.completed_batch_index || self.completed_ahead.contains(&index)
    }

    /// Mark `index` complete and advance the watermark over any now
    /// contiguous run of completed batches.
    pub fn mark_complete(&mut self, index: usize) {
        if index < self.completed_batch_index {
            return;
        }
        self.completed_ahead.insert(index);
        while self.completed_ahead.remove(&self.completed_batch_index) {
            self.completed_batch_index += 1;
        }
    }

    /// Whether every batch of the plan is complete.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.completed_batch_index >= self.total_batches
    }

    #[must_use]
    pub fn render(&self) -> String {
        fn numbers(set: &BTreeSet<usize>) -> String {
            set.iter()
                .map(|index| (index + 1).to_string())
                .collect::<Vec<_>>()
                .join(",")
        }

        let stats = &self.stats;
        let mut out = String::with_capacity(384);
        // Writing into a String cannot fail.
        let _ = writeln!(out, "completed_batch_index={}", self.completed_batch_index);
        let _ = writeln!(out, "total_batches={}", self.total_batches);
        let _ = writeln!(out, "sent_count={}", stats.sent);
        let _ = writeln!(out, "failed_count={}", stats.failed);
        let _ = writeln!(out, "attempted_count={}", stats.attempted);
        let _ = writeln!(out, "rejected_count={}", stats.rejected);
        let _ = writeln!(out, "over_quota_count={}", stats.over_quota);
        let _ = writeln!(
            out,
            "insufficient_storage_count={}",
            stats.insufficient_storage
        );
        let _ = writeln!(out, "transient_count={}", stats.transient);
        let _ = writeln!(out, "unroutable_count={}", stats.unroutable);
        let _ = writeln!(out, "completed_ahead={}", numbers(&self.completed_ahead));
        let _ = writeln!(out, "failed_batches={}", numbers(&self.failed_batches));
        let _ = writeln!(out, "last_updated={}", self.last_updated.to_rfc3339());
        out
    }

    /// Parse a rendered checkpoint. Unknown keys, blank lines and `#`
    /// comments are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Parse`] for a malformed line or value, and
    /// [`CheckpointError::MissingField`] if the watermark or plan size is absent.
    pub fn parse(text: &str) -> Result<Self, CheckpointError> {
        let mut watermark = None;
        let mut total = None;
        let mut checkpoint = Self::new(0);

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let malformed = |reason: String| CheckpointError::Parse {
                line: number + 1,
                reason,
            };

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| malformed(format!("expected key=value, got `{line}`")))?;
            let (key, value) = (key.trim(), value.trim());

            let count = || {
                value
                    .parse::<u64>()
                    .map_err(|e| malformed(format!("{key}: {e}")))
            };
            let index = || {
                value
                    .parse::<usize>()
                    .map_err(|e| malformed(format!("{key}: {e}")))
            };
            let numbers = || -> Result<BTreeSet<usize>, CheckpointError> {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(|n| match n.parse::<usize>() {
                        Ok(n) if n > 0 => Ok(n - 1),
                        Ok(_) => Err(malformed(format!("{key}: batch numbers start at 1"))),
                        Err(e) => Err(malformed(format!("{key}: {e}"))),
                    })
                    .collect()
            };

            match key {
                "completed_batch_index" => watermark = Some(index()?),
                "total_batches" => total = Some(index()?),
                "sent_count" => checkpoint.stats.sent = count()?,
                "failed_count" => checkpoint.stats.failed = count()?,
                "attempted_count" => checkpoint.stats.attempted = count()?,
                "rejected_count" => checkpoint.stats.rejected = count()?,
                "over_quota_count" => checkpoint.stats.over_quota = count()?,
                "insufficient_storage_count" => checkpoint.stats.insufficient_storage = count()?,
                "transient_count" => checkpoint.stats.transient = count()?,
                "unroutable_count" => checkpoint.stats.unroutable = count()?,
                "completed_ahead" => checkpoint.completed_ahead = numbers()?,
                "failed_batches" => checkpoint.failed_batches = numbers()?,
                "last_updated" => {
                    checkpoint.last_updated = DateTime::parse_from_rfc3339(value)
                        .map_err(|e| malformed(format!("{key}: {e}")))?
                        .with_timezone(&Utc);
                }
                _ => {}
            }
        }

        checkpoint.completed_batch_index =
            watermark.ok_or(CheckpointError::MissingField("completed_batch_index"))?;
        checkpoint.total_batches = total.ok_or(CheckpointError::MissingField("total_batches"))?;

        if checkpoint.completed_batch_index > checkpoint.total_batches {
            return Err(CheckpointError::Parse {
                line: 0,
                reason: format!(
                    "watermark {} is beyond the plan's {} batches",
                    checkpoint.completed_batch_index, checkpoint.total_batches
                ),
            });
        }

        Ok(checkpoint)
    }

    /// Read the checkpoint at `path`. A missing file is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Option<Self>, CheckpointError> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the checkpoint at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be written or renamed.
    pub async fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let temp = temp_path(path);
        fs::write(&temp, self.render()).await?;
        fs::rename(&temp, path).await?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
