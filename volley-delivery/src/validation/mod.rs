//! Recipient validation.
//!
//! Each address walks a fixed sequence of checks and stops at the first one
//! it fails:
//!
//! 1. **Format**: the address must parse
//! 2. **Domain**: the domain has address records, or failing that MX records
//! 3. **Endpoint**: the domain has exactly one MX, and it is the expected host
//! 4. **Probe**: `MAIL FROM` then `RCPT TO` against that host, without DATA
//!
//! No DNS traffic is generated for malformed addresses, and no connection is
//! made unless the first three checks pass.

mod report;

use std::{path::PathBuf, sync::Arc};

use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use volley_common::{Domain, Recipient, tracing};

pub use self::report::{Category, ValidationReport, VerificationRecord};
use crate::{
    DeliveryEndpoint, Resolve, ResolveError,
    classify::{DeliveryOutcome, Exhaustion, classify_reply},
    connection::ConnectionManager,
};

const fn default_concurrency() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Sender used for the probe's `MAIL FROM`. Empty means the null
    /// reverse-path `<>`.
    #[serde(default)]
    pub mail_from: String,

    /// The only MX host accepted for a domain
    ///
    /// A domain must always publish exactly one MX. When this is unset, the
    /// host name of that MX is not checked.
    #[serde(default)]
    pub expected_endpoint: Option<String>,

    /// Addresses probed at once; results are still filed in input order
    /// (default: 1)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Directory for result files (default: `results`)
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mail_from: String::new(),
            expected_endpoint: None,
            concurrency: default_concurrency(),
            output_dir: default_output_dir(),
        }
    }
}

fn normalise_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Runs addresses through the validation checks.
#[derive(Clone)]
pub struct Validator {
    lookup: Arc<dyn Resolve>,
    connections: ConnectionManager,
    config: Arc<ValidationConfig>,
    expected: Option<String>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Validator {
    #[must_use]
    pub fn new(
        lookup: Arc<dyn Resolve>,
        connections: ConnectionManager,
        config: ValidationConfig,
    ) -> Self {
        let expected = config.expected_endpoint.as_deref().map(normalise_host);
        Self {
            lookup,
            connections,
            config: Arc::new(config),
            expected,
        }
    }

    /// Validate every address, filing results in input order.
    pub async fn validate_all<I>(&self, addresses: I) -> ValidationReport
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut results = stream::iter(addresses)
            .map(|address| async move { self.validate(address.as_ref()).await })
            .buffered(self.config.concurrency.max(1));

        let mut report = ValidationReport::new();
        while let Some(record) = results.next().await {
            tracing::info!(
                address = %record.address,
                category = %record.category,
                detail = record.detail.as_deref().unwrap_or(""),
                "Validated"
            );
            report.add(record);
        }
        report
    }

    /// Validate a single address.
    pub async fn validate(&self, address: &str) -> VerificationRecord {
        let address = address.trim();

        let recipient = match Recipient::parse(address) {
            Ok(recipient) => recipient,
            Err(e) => {
                tracing::debug!(address, "Malformed address: {e}");
                return VerificationRecord::failed(
                    address,
                    Category::OtherError,
                    "invalid email format",
                );
            }
        };

        if let Err(detail) = self.check_domain(recipient.domain()).await {
            return VerificationRecord::failed(address, Category::InvalidDomain, detail);
        }

        let endpoints = match self.check_endpoint(recipient.domain()).await {
            Ok(endpoints) => endpoints,
            Err(detail) => {
                return VerificationRecord::failed(address, Category::InvalidEndpoint, detail);
            }
        };

        self.probe(&recipient, &endpoints).await
    }

    /// The domain must exist: address records, or failing that MX records.
    async fn check_domain(&self, domain: &Domain) -> Result<(), String> {
        match self.lookup.has_address_records(domain).await {
            Ok(true) => return Ok(()),
            Err(err @ ResolveError::DomainNotFound(_)) => return Err(err.to_string()),
            Ok(false) => {}
            Err(err) => tracing::debug!(%domain, "Address lookup failed, trying MX: {err}"),
        }

        match self.lookup.mail_exchangers(domain).await {
            Ok(endpoints) if !endpoints.is_empty() => Ok(()),
            Ok(_) => Err(ResolveError::NoEndpointRecords(domain.to_string()).to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Exactly one MX, and it is the expected host.
    async fn check_endpoint(&self, domain: &Domain) -> Result<Vec<DeliveryEndpoint>, String> {
        let endpoints = self
            .lookup
            .mail_exchangers(domain)
            .await
            .map_err(|err| err.to_string())?;

        match (endpoints.as_slice(), &self.expected) {
            ([only], Some(expected)) if normalise_host(&only.hostname) != *expected => Err(format!(
                "MX is {}, expected {expected}",
                normalise_host(&only.hostname)
            )),
            ([_], _) => Ok(endpoints),
            ([], _) => Err(format!("No MX records found for domain: {domain}")),
            (many, _) => Err(format!("expected exactly one MX, found {}", many.len())),
        }
    }

    /// `MAIL FROM` then `RCPT TO`; the connection is always closed.
    async fn probe(&self, recipient: &Recipient, endpoints: &[DeliveryEndpoint]) -> VerificationRecord {
        let address = recipient.address();

        let mut connection = match self
            .connections
            .connect_any(recipient.domain().as_str(), endpoints)
            .await
        {
            Ok(connection) => connection,
            Err(unavailable) => {
                return VerificationRecord::failed(
                    address,
                    Category::OtherError,
                    unavailable.to_string(),
                );
            }
        };

        let mail = connection.mail_from(&self.config.mail_from).await;
        let record = if classify_reply(&mail).is_accepted() {
            let rcpt = connection.rcpt_to(address).await;
            let detail = || match &rcpt {
                Ok(reply) => format!("{} {}", reply.code, reply.message()),
                Err(err) => err.to_string(),
            };

            match classify_reply(&rcpt) {
                DeliveryOutcome::Accepted => VerificationRecord::valid(address),
                DeliveryOutcome::ResourceExhausted(Exhaustion::OverQuota) => {
                    VerificationRecord::failed(address, Category::OverQuota, detail())
                }
                DeliveryOutcome::ResourceExhausted(Exhaustion::InsufficientStorage) => {
                    VerificationRecord::failed(address, Category::InsufficientStorage, detail())
                }
                DeliveryOutcome::Rejected | DeliveryOutcome::TransientError => {
                    VerificationRecord::failed(address, Category::OtherError, detail())
                }
            }
        } else {
            // A refused sender says nothing about the mailbox.
            let detail = match &mail {
                Ok(reply) => format!("MAIL FROM refused: {} {}", reply.code, reply.message()),
                Err(err) => format!("MAIL FROM failed: {err}"),
            };
            VerificationRecord::failed(address, Category::OtherError, detail)
        };

        connection.close().await;
        record
    }
}
