//! Recipient addresses and newline-delimited recipient lists
//!
//! Parsing is deliberately permissive about the local part (the receiving
//! server has the final say) and strict about the domain, because the
//! domain is what every later routing decision hangs off.

use std::fmt::{self, Display};

use thiserror::Error;

use crate::Domain;

/// Reasons an address is filtered out before dispatch or validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecipientError {
    #[error("address is empty")]
    Empty,

    #[error("address has no '@' separator")]
    MissingAtSign,

    #[error("address has an empty local part")]
    EmptyLocalPart,

    #[error("address has no domain")]
    MissingDomain,

    #[error("invalid domain '{0}'")]
    InvalidDomain(String),
}

/// A single syntactically plausible recipient address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Recipient {
    address: String,
    domain: Domain,
}

impl Recipient {
    /// Parse one address.
    ///
    /// Accepts a bare `local@domain` or a display form `Name <local@domain>`.
    /// The domain must contain at least one dot and no empty labels.
    ///
    /// # Errors
    ///
    /// Returns a [`RecipientError`] describing the first problem found.
    pub fn parse(input: &str) -> Result<Self, RecipientError> {
        let mut address = input.trim();
        if let (Some(open), Some(close)) = (address.rfind('<'), address.rfind('>'))
            && open < close
        {
            address = address[open + 1..close].trim();
        }

        if address.is_empty() {
            return Err(RecipientError::Empty);
        }

        let (local, domain) = address
            .rsplit_once('@')
            .ok_or(RecipientError::MissingAtSign)?;

        if local.is_empty() {
            return Err(RecipientError::EmptyLocalPart);
        }
        if domain.is_empty() {
            return Err(RecipientError::MissingDomain);
        }
        if !domain.contains('.')
            || domain.split('.').any(str::is_empty)
            || domain.chars().any(|c| c.is_whitespace() || c == '@')
        {
            return Err(RecipientError::InvalidDomain(domain.to_string()));
        }

        Ok(Self {
            address: address.to_string(),
            domain: Domain::new(domain),
        })
    }

    /// The address as it appeared in the input (minus any display name).
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }
}

impl Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// A parsed recipient list, with malformed lines set aside.
#[derive(Debug, Clone, Default)]
pub struct RecipientList {
    recipients: Vec<Recipient>,
    malformed: Vec<(String, RecipientError)>,
}

impl RecipientList {
    /// Parse newline-delimited addresses. Blank lines are ignored and
    /// malformed lines are collected rather than treated as fatal.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let mut list = Self::default();

        for line in input.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match Recipient::parse(line) {
                Ok(recipient) => list.recipients.push(recipient),
                Err(err) => list.malformed.push((line.to_string(), err)),
            }
        }

        list
    }

    #[must_use]
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    #[must_use]
    pub fn into_recipients(self) -> Vec<Recipient> {
        self.recipients
    }

    /// Lines that were not usable addresses, with the reason.
    #[must_use]
    pub fn malformed(&self) -> &[(String, RecipientError)] {
        &self.malformed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

impl FromIterator<Recipient> for RecipientList {
    fn from_iter<T: IntoIterator<Item = Recipient>>(iter: T) -> Self {
        Self {
            recipients: iter.into_iter().collect(),
            malformed: Vec::new(),
        }
    }
}
