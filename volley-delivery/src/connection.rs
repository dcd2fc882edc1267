//! SMTP session establishment with address-family fallback.
//!
//! The [`ConnectionManager`] turns a [`DeliveryEndpoint`] into an open,
//! greeted [`Connection`]. Every socket address of the endpoint is tried, in
//! the configured family order, until one completes the greeting and
//! EHLO/HELO exchange. STARTTLS follows the configured [`TlsPolicy`]; when an
//! opportunistic upgrade fails the same address is retried in plaintext
//! (RFC 3207 section 4.1).
//!
//! Connections are owned by a single task and never pooled.

use std::{
    fmt::{self, Display},
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, lookup_host};
use volley_common::tracing;
use volley_smtp::{ClientError, Response, SmtpClient};

use crate::{DeliveryEndpoint, error::ConnectionUnavailable, types::SmtpTimeouts};

type ClientResult<T> = Result<T, ClientError>;

/// IP address family of a socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    #[must_use]
    pub const fn of(address: &SocketAddr) -> Self {
        match address {
            SocketAddr::V4(_) => Self::Ipv4,
            SocketAddr::V6(_) => Self::Ipv6,
        }
    }
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ipv4 => "IPv4",
            Self::Ipv6 => "IPv6",
        })
    }
}

/// When to upgrade a session with STARTTLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsPolicy {
    /// Never attempt STARTTLS.
    #[default]
    Disabled,
    /// Upgrade when advertised; fall back to plaintext if the upgrade fails.
    Opportunistic,
    /// Fail the attempt unless the upgrade succeeds.
    Required,
}

/// How connections are opened and announced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Name announced in EHLO/HELO
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// Address families to try, in order. A single entry forces that family.
    #[serde(default = "default_address_families")]
    pub address_families: Vec<AddressFamily>,

    #[serde(default)]
    pub tls: TlsPolicy,

    /// Accept any certificate after STARTTLS. For testing only.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

fn default_address_families() -> Vec<AddressFamily> {
    vec![AddressFamily::Ipv4, AddressFamily::Ipv6]
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            helo_name: default_helo_name(),
            address_families: default_address_families(),
            tls: TlsPolicy::default(),
            accept_invalid_certs: false,
            timeouts: SmtpTimeouts::default(),
        }
    }
}

/// One failed try at one socket address (or at resolving the host at all).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub endpoint: DeliveryEndpoint,
    /// `None` when the endpoint host could not be resolved to addresses.
    pub address: Option<SocketAddr>,
    pub family: Option<AddressFamily>,
    pub reason: String,
}

impl Display for ConnectAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.address, self.family) {
            (Some(address), Some(family)) => write!(
                f,
                "{} via {address} ({family}): {}",
                self.endpoint, self.reason
            ),
            _ => write!(f, "{}: {}", self.endpoint, self.reason),
        }
    }
}

enum AttemptError {
    Failed(String),
    /// Opportunistic STARTTLS failed; the address may be retried in plaintext.
    RetryWithoutTls(String),
}

impl From<ClientError> for AttemptError {
    fn from(err: ClientError) -> Self {
        Self::Failed(err.to_string())
    }
}

async fn timed<T>(
    command: &'static str,
    secs: u64,
    fut: impl Future<Output = ClientResult<T>>,
) -> ClientResult<T> {
    let limit = Duration::from_secs(secs);
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ClientError::Timeout {
            command,
            elapsed: limit,
        })?
}

/// An open SMTP session, greeted and announced.
pub struct Connection {
    client: SmtpClient,
    endpoint: DeliveryEndpoint,
    address: SocketAddr,
    timeouts: SmtpTimeouts,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("address", &self.address)
            .field("tls", &self.client.is_tls())
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub const fn endpoint(&self) -> &DeliveryEndpoint {
        &self.endpoint
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.client.is_tls()
    }

    /// # Errors
    ///
    /// Returns an error if the command could not be sent or answered in time.
    pub async fn mail_from(&mut self, sender: &str) -> ClientResult<Response> {
        timed(
            "MAIL FROM",
            self.timeouts.mail_from_secs,
            self.client.mail_from(sender),
        )
        .await
    }

    /// # Errors
    ///
    /// Returns an error if the command could not be sent or answered in time.
    pub async fn rcpt_to(&mut self, recipient: &str) -> ClientResult<Response> {
        timed(
            "RCPT TO",
            self.timeouts.rcpt_to_secs,
            self.client.rcpt_to(recipient),
        )
        .await
    }

    /// Send DATA, transfer `payload` and return the final reply.
    ///
    /// # Errors
    ///
    /// Anything other than a `354` go-ahead in answer to DATA is returned as
    /// [`ClientError::SmtpError`] without sending the payload.
    pub async fn data(&mut self, payload: &[u8]) -> ClientResult<Response> {
        let data_secs = self.timeouts.data_secs;
        let go_ahead = timed("DATA", data_secs, self.client.data()).await?;

        if !go_ahead.is_intermediate() {
            return Err(go_ahead.into_error());
        }

        timed("DATA", data_secs, self.client.send_data(payload)).await
    }

    /// # Errors
    ///
    /// Returns an error if the command could not be sent or answered in time.
    pub async fn rset(&mut self) -> ClientResult<Response> {
        timed("RSET", self.timeouts.mail_from_secs, self.client.rset()).await
    }

    /// # Errors
    ///
    /// Returns an error if the command could not be sent or answered in time.
    pub async fn noop(&mut self) -> ClientResult<Response> {
        timed("NOOP", self.timeouts.ehlo_secs, self.client.noop()).await
    }

    /// Say QUIT and drop the socket. Never fails.
    pub async fn close(mut self) {
        if let Err(e) = timed("QUIT", self.timeouts.quit_secs, self.client.quit()).await {
            tracing::debug!(endpoint = %self.endpoint, "QUIT failed: {e}");
        }
    }
}

/// Opens [`Connection`]s according to a [`ConnectionConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    config: Arc<ConnectionConfig>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        if config.accept_invalid_certs {
            tracing::warn!(
                "SECURITY WARNING: TLS certificate validation is disabled for outbound connections"
            );
        }

        Self {
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connect to a single endpoint.
    ///
    /// # Errors
    ///
    /// Returns every failed attempt if no address produced a session.
    pub async fn connect(
        &self,
        endpoint: &DeliveryEndpoint,
    ) -> Result<Connection, ConnectionUnavailable> {
        self.connect_any(&endpoint.to_string(), std::slice::from_ref(endpoint))
            .await
    }

    /// Walk `endpoints` in order and return the first session established.
    ///
    /// # Errors
    ///
    /// Returns the attempts made against every endpoint if none succeeded.
    pub async fn connect_any(
        &self,
        target: &str,
        endpoints: &[DeliveryEndpoint],
    ) -> Result<Connection, ConnectionUnavailable> {
        let mut attempts = Vec::new();

        for endpoint in endpoints {
            if let Some(connection) = self.connect_endpoint(endpoint, &mut attempts).await {
                return Ok(connection);
            }
        }

        tracing::warn!(
            target_domain = target,
            attempts = attempts.len(),
            "Unable to connect to any endpoint"
        );
        Err(ConnectionUnavailable {
            target: target.to_string(),
            attempts,
        })
    }

    async fn connect_endpoint(
        &self,
        endpoint: &DeliveryEndpoint,
        attempts: &mut Vec<ConnectAttempt>,
    ) -> Option<Connection> {
        let connect_timeout = self.config.timeouts.connect();
        let failed = |reason: String| ConnectAttempt {
            endpoint: endpoint.clone(),
            address: None,
            family: None,
            reason,
        };

        let addresses: Vec<SocketAddr> = match tokio::time::timeout(
            connect_timeout,
            lookup_host((endpoint.hostname.as_str(), endpoint.port)),
        )
        .await
        {
            Ok(Ok(addresses)) => addresses.collect(),
            Ok(Err(e)) => {
                attempts.push(failed(format!("address lookup failed: {e}")));
                return None;
            }
            Err(_) => {
                attempts.push(failed(format!(
                    "address lookup timed out after {connect_timeout:?}"
                )));
                return None;
            }
        };

        let before = attempts.len();
        for family in &self.config.address_families {
            for address in addresses
                .iter()
                .copied()
                .filter(|a| AddressFamily::of(a) == *family)
            {
                match self.attempt(endpoint, address, self.config.tls).await {
                    Ok(connection) => return Some(connection),
                    Err(AttemptError::Failed(reason)) => {
                        attempts.push(Self::attempt_failed(endpoint, address, reason));
                    }
                    Err(AttemptError::RetryWithoutTls(reason)) => {
                        tracing::info!(
                            %endpoint,
                            %address,
                            error = %reason,
                            "STARTTLS failed, reconnecting without TLS per RFC 3207 Section 4.1"
                        );
                        match self.attempt(endpoint, address, TlsPolicy::Disabled).await {
                            Ok(connection) => return Some(connection),
                            Err(AttemptError::Failed(reason) | AttemptError::RetryWithoutTls(reason)) => {
                                attempts.push(Self::attempt_failed(endpoint, address, reason));
                            }
                        }
                    }
                }
            }
        }

        if attempts.len() == before {
            attempts.push(failed(format!(
                "no addresses in the configured families ({})",
                self.config
                    .address_families
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        None
    }

    fn attempt_failed(
        endpoint: &DeliveryEndpoint,
        address: SocketAddr,
        reason: String,
    ) -> ConnectAttempt {
        tracing::debug!(%endpoint, %address, "Connection attempt failed: {reason}");
        ConnectAttempt {
            endpoint: endpoint.clone(),
            address: Some(address),
            family: Some(AddressFamily::of(&address)),
            reason,
        }
    }

    async fn attempt(
        &self,
        endpoint: &DeliveryEndpoint,
        address: SocketAddr,
        tls: TlsPolicy,
    ) -> Result<Connection, AttemptError> {
        let timeouts = &self.config.timeouts;
        let connect_timeout = timeouts.connect();

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                AttemptError::Failed(format!("connect timed out after {connect_timeout:?}"))
            })?
            .map_err(|e| AttemptError::Failed(format!("connect failed: {e}")))?;

        let mut client = SmtpClient::from_stream(stream, endpoint.hostname.clone())
            .accept_invalid_certs(self.config.accept_invalid_certs);

        let greeting = timed("greeting", timeouts.ehlo_secs, client.read_greeting()).await?;
        if !greeting.is_success() {
            return Err(AttemptError::Failed(format!(
                "greeting refused: {} {}",
                greeting.code,
                greeting.message()
            )));
        }

        let extensions = self.announce(&mut client).await?;

        if tls != TlsPolicy::Disabled {
            let advertised = extensions
                .as_ref()
                .is_some_and(|ehlo| ehlo.advertises("STARTTLS"));

            if advertised {
                self.upgrade(&mut client, tls).await?;
            } else if tls == TlsPolicy::Required {
                return Err(AttemptError::Failed(
                    "TLS required but STARTTLS is not advertised".to_string(),
                ));
            }
        }

        tracing::debug!(%endpoint, %address, tls = client.is_tls(), "Connected");

        Ok(Connection {
            client,
            endpoint: endpoint.clone(),
            address,
            timeouts: timeouts.clone(),
        })
    }

    /// EHLO, falling back to HELO. Returns the EHLO reply when EHLO worked.
    async fn announce(&self, client: &mut SmtpClient) -> Result<Option<Response>, AttemptError> {
        let helo_name = &self.config.helo_name;
        let ehlo_secs = self.config.timeouts.ehlo_secs;

        let ehlo = timed("EHLO", ehlo_secs, client.ehlo(helo_name)).await?;
        if ehlo.is_success() {
            return Ok(Some(ehlo));
        }

        let helo = timed("HELO", ehlo_secs, client.helo(helo_name)).await?;
        if helo.is_success() {
            Ok(None)
        } else {
            Err(AttemptError::Failed(format!(
                "EHLO and HELO refused: {} {}",
                helo.code,
                helo.message()
            )))
        }
    }

    async fn upgrade(&self, client: &mut SmtpClient, tls: TlsPolicy) -> Result<(), AttemptError> {
        let fail = |reason: String| {
            if tls == TlsPolicy::Required {
                AttemptError::Failed(reason)
            } else {
                AttemptError::RetryWithoutTls(reason)
            }
        };

        match timed("STARTTLS", self.config.timeouts.starttls_secs, client.starttls()).await {
            Ok(response) if response.is_success() => {}
            Ok(response) => {
                return Err(fail(format!(
                    "STARTTLS refused: {} {}",
                    response.code,
                    response.message()
                )));
            }
            Err(e) => return Err(fail(format!("STARTTLS failed: {e}"))),
        }

        // RFC 3207: the session state is reset by the handshake.
        let ehlo = timed("EHLO", self.config.timeouts.ehlo_secs, client.ehlo(&self.config.helo_name))
            .await?;
        if ehlo.is_success() {
            Ok(())
        } else {
            Err(AttemptError::Failed(format!(
                "EHLO after STARTTLS refused: {} {}",
                ehlo.code,
                ehlo.message()
            )))
        }
    }
}
