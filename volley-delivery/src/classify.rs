//! Mapping SMTP replies onto delivery outcomes.
//!
//! One function serves both dispatch and validation. The numeric code is
//! inspected first, whichever channel the reply arrived on, so a 2xx that
//! surfaced as a client error is still an acceptance.

use volley_smtp::{ClientError, Response};

/// Why a mailbox could not take the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exhaustion {
    /// The recipient's mailbox is over its quota.
    OverQuota,
    /// The receiving system is out of storage.
    InsufficientStorage,
}

/// The closed set of outcomes for one recipient reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    Accepted,
    Rejected,
    ResourceExhausted(Exhaustion),
    /// No reply code at all: I/O failure, timeout or a dropped connection.
    TransientError,
}

impl DeliveryOutcome {
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Classify a reply code and its text.
///
/// Total: every input maps to exactly one outcome.
#[must_use]
pub fn classify(code: Option<u16>, detail: &str) -> DeliveryOutcome {
    let Some(code) = code else {
        return DeliveryOutcome::TransientError;
    };

    if (200..300).contains(&code) {
        return DeliveryOutcome::Accepted;
    }

    let detail = detail.to_ascii_lowercase();

    if code == 552 || detail.contains("quota") {
        DeliveryOutcome::ResourceExhausted(Exhaustion::OverQuota)
    } else if code == 452
        || ["insufficient", "storage", "disk"]
            .iter()
            .any(|needle| detail.contains(needle))
    {
        DeliveryOutcome::ResourceExhausted(Exhaustion::InsufficientStorage)
    } else {
        DeliveryOutcome::Rejected
    }
}

/// Classify the result of a client call, reply or error alike.
#[must_use]
pub fn classify_reply(reply: &Result<Response, ClientError>) -> DeliveryOutcome {
    match reply {
        Ok(response) => classify(Some(response.code), &response.message()),
        Err(err) => classify(err.code(), &err.detail()),
    }
}
