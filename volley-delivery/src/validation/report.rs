//! Validation results: per-category buckets, the dashboard and result files.

use std::{
    fmt::{self, Display, Write as _},
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tokio::fs;

/// Where a validated address ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Valid,
    InvalidDomain,
    InvalidEndpoint,
    OverQuota,
    InsufficientStorage,
    OtherError,
}

impl Category {
    pub const ALL: [Self; 6] = [
        Self::Valid,
        Self::InvalidDomain,
        Self::InvalidEndpoint,
        Self::OverQuota,
        Self::InsufficientStorage,
        Self::OtherError,
    ];

    /// Stable name used in file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::InvalidDomain => "invalid_domain",
            Self::InvalidEndpoint => "invalid_endpoint",
            Self::OverQuota => "over_quota",
            Self::InsufficientStorage => "insufficient_storage",
            Self::OtherError => "other_error",
        }
    }

    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Valid => "Valid addresses",
            Self::InvalidDomain => "Invalid domain",
            Self::InvalidEndpoint => "Invalid endpoint",
            Self::OverQuota => "Over quota",
            Self::InsufficientStorage => "Insufficient storage",
            Self::OtherError => "Other errors",
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The verdict for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    pub address: String,
    pub category: Category,
    /// Why the address was not valid, if it was not.
    pub detail: Option<String>,
}

impl VerificationRecord {
    #[must_use]
    pub fn valid(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            category: Category::Valid,
            detail: None,
        }
    }

    #[must_use]
    pub fn failed(address: impl Into<String>, category: Category, detail: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            category,
            detail: Some(detail.into()),
        }
    }
}

/// Records grouped by category, in the order they were filed.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    buckets: [Vec<VerificationRecord>; 6],
}

impl ValidationReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: VerificationRecord) {
        self.buckets[record.category.slot()].push(record);
    }

    #[must_use]
    pub fn records(&self, category: Category) -> &[VerificationRecord] {
        &self.buckets[category.slot()]
    }

    #[must_use]
    pub fn count(&self, category: Category) -> usize {
        self.buckets[category.slot()].len()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Percentage of valid addresses, 0 when nothing was checked.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            #[allow(clippy::cast_precision_loss)]
            total => self.count(Category::Valid) as f64 / total as f64 * 100.0,
        }
    }

    /// Human-readable totals.
    #[must_use]
    pub fn dashboard(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=========== Validation results ===========");
        let _ = writeln!(out, "{:<24}{}", "Total checked:", self.total());
        for category in Category::ALL {
            let _ = writeln!(
                out,
                "{:<24}{}",
                format!("{}:", category.title()),
                self.count(category)
            );
        }
        let _ = writeln!(out, "{:<24}{:.2}%", "Success rate:", self.success_rate());
        out
    }

    /// Write one file per category plus a summary into `dir`.
    ///
    /// Every category gets a file, empty or not, so downstream tooling can
    /// rely on their presence.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or any file cannot be written.
    pub async fn write_files(&self, dir: &Path, at: DateTime<Utc>) -> io::Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).await?;

        let stamp = at.format("%Y%m%d_%H%M%S");
        let generated = at.format("%Y-%m-%d %H:%M:%S UTC");
        let mut written = Vec::with_capacity(Category::ALL.len() + 1);

        for category in Category::ALL {
            let records = self.records(category);
            let mut contents = format!(
                "# {}\n# Generated: {generated}\n# Count: {}\n",
                category.title(),
                records.len()
            );
            for record in records {
                contents.push_str(&record.address);
                contents.push('\n');
            }

            let path = dir.join(format!("{category}_{stamp}.txt"));
            fs::write(&path, contents).await?;
            written.push(path);
        }

        let path = dir.join(format!("summary_{stamp}.txt"));
        fs::write(
            &path,
            format!("# Generated: {generated}\n{}", self.dashboard()),
        )
        .await?;
        written.push(path);

        Ok(written)
    }
}
