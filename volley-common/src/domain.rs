//! Domain newtype for type safety
//!
//! Wraps domain strings so recipient domains, endpoint hostnames and
//! arbitrary strings cannot be mixed up. Domains are stored lowercased,
//! which makes grouping recipients by destination case-insensitive.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A lowercased domain name
///
/// # Examples
///
/// ```
/// use volley_common::Domain;
///
/// let domain = Domain::new("Example.COM");
/// assert_eq!(domain.as_str(), "example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    /// Create a new `Domain`, lowercasing it and stripping a trailing root dot
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        let s = s.as_ref().trim().trim_end_matches('.');
        Self(Arc::from(s.to_ascii_lowercase()))
    }

    /// Get the domain as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
