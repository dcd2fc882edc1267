//! Shared configuration types

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// SMTP operation timeout configuration
///
/// Every network wait in a delivery or probe is bounded by one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// Timeout for establishing the TCP connection, per attempted address
    ///
    /// Default: 30 seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Timeout for the greeting and EHLO/HELO
    ///
    /// Default: 30 seconds
    #[serde(default = "default_ehlo_timeout")]
    pub ehlo_secs: u64,

    /// Timeout for STARTTLS and the TLS handshake
    ///
    /// Default: 30 seconds
    #[serde(default = "default_starttls_timeout")]
    pub starttls_secs: u64,

    /// Timeout for MAIL FROM
    ///
    /// Default: 30 seconds
    #[serde(default = "default_mail_from_timeout")]
    pub mail_from_secs: u64,

    /// Timeout for each RCPT TO
    ///
    /// Default: 30 seconds
    #[serde(default = "default_rcpt_to_timeout")]
    pub rcpt_to_secs: u64,

    /// Timeout for DATA and the message transfer
    ///
    /// Default: 120 seconds
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// Timeout for QUIT
    ///
    /// Default: 10 seconds
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            ehlo_secs: default_ehlo_timeout(),
            starttls_secs: default_starttls_timeout(),
            mail_from_secs: default_mail_from_timeout(),
            rcpt_to_secs: default_rcpt_to_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

impl SmtpTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_ehlo_timeout() -> u64 {
    30
}

const fn default_starttls_timeout() -> u64 {
    30
}

const fn default_mail_from_timeout() -> u64 {
    30
}

const fn default_rcpt_to_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

/// Where mail for a domain goes when DNS should not decide
///
/// ```ron
/// routing: (
///     smarthost: Some("relay.example.net:587"),
///     routes: {
///         "test.example.com": "localhost:1025",
///     },
/// )
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Send every domain through this relay instead of its MX hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smarthost: Option<String>,

    /// Per-domain `host[:port]` overrides, consulted before the smarthost
    #[serde(default)]
    pub routes: HashMap<String, String>,

    /// Treat a domain with address records but no MX as its own endpoint
    /// (RFC 5321 section 5.1). Off by default.
    #[serde(default)]
    pub implicit_mx: bool,
}

impl RoutingConfig {
    /// The override for `domain`, if any
    #[must_use]
    pub fn route_for(&self, domain: &str) -> Option<&str> {
        self.routes
            .get(domain)
            .or(self.smarthost.as_ref())
            .map(String::as_str)
    }
}
