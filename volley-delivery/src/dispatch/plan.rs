//! Partitioning a recipient list into per-domain batches.

use std::ops::Range;

use ahash::AHashMap;
use volley_common::{Domain, Recipient};

/// A bounded group of recipients sharing one destination domain.
///
/// `index` is the batch's global position in the plan, starting at 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientBatch {
    pub index: usize,
    pub domain: Domain,
    pub recipients: Vec<Recipient>,
}

impl RecipientBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Position as shown to operators, starting at 1.
    #[must_use]
    pub const fn number(&self) -> usize {
        self.index + 1
    }
}

/// The full, ordered set of batches for a campaign.
///
/// Domains appear in the order they were first seen in the input, and the
/// recipients of a domain keep their input order. Batch indices are
/// contiguous per domain.
#[derive(Debug, Clone, Default)]
pub struct DispatchPlan {
    batches: Vec<RecipientBatch>,
    groups: Vec<(Domain, Range<usize>)>,
    batch_size: usize,
    total_recipients: usize,
}

impl DispatchPlan {
    /// Partition `recipients` into batches of at most `batch_size`.
    ///
    /// A `batch_size` of 0 is treated as 1.
    #[must_use]
    pub fn new(recipients: impl IntoIterator<Item = Recipient>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);

        let mut positions: AHashMap<Domain, usize> = AHashMap::new();
        let mut by_domain: Vec<(Domain, Vec<Recipient>)> = Vec::new();
        let mut total_recipients: usize = 0;

        for recipient in recipients {
            total_recipients += 1;
            let slot = *positions
                .entry(recipient.domain().clone())
                .or_insert_with(|| {
                    by_domain.push((recipient.domain().clone(), Vec::new()));
                    by_domain.len() - 1
                });
            by_domain[slot].1.push(recipient);
        }

        let mut batches = Vec::with_capacity(total_recipients.div_ceil(batch_size));
        let mut groups = Vec::with_capacity(by_domain.len());

        for (domain, recipients) in by_domain {
            let start = batches.len();
            let mut recipients = recipients.into_iter().peekable();

            while recipients.peek().is_some() {
                batches.push(RecipientBatch {
                    index: batches.len(),
                    domain: domain.clone(),
                    recipients: recipients.by_ref().take(batch_size).collect(),
                });
            }

            groups.push((domain, start..batches.len()));
        }

        Self {
            batches,
            groups,
            batch_size,
            total_recipients,
        }
    }

    #[must_use]
    pub fn batches(&self) -> &[RecipientBatch] {
        &self.batches
    }

    /// Each domain with its batches, in first-seen order.
    pub fn domains(&self) -> impl Iterator<Item = (&Domain, &[RecipientBatch])> {
        self.groups
            .iter()
            .map(|(domain, range)| (domain, &self.batches[range.clone()]))
    }

    #[must_use]
    pub fn total_batches(&self) -> usize {
        self.batches.len()
    }

    #[must_use]
    pub const fn total_recipients(&self) -> usize {
        self.total_recipients
    }

    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }
}
