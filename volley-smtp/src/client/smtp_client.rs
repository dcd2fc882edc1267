//! Client side of an SMTP session, with optional STARTTLS.

use std::sync::Arc;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{
        self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};
use volley_common::{incoming, outgoing, tracing};

use super::{
    error::{ClientError, Result},
    response::Response,
};

const INITIAL_INBOX: usize = 4096;

/// Replies larger than this are treated as garbage.
const MAX_INBOX: usize = 1024 * 1024;

/// The session's byte stream, upgraded in place by STARTTLS.
enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(bytes).await?,
            Self::Tls(stream) => stream.write_all(bytes).await?,
        }
        Ok(())
    }

    /// Read whatever is available. A zero-length read means the peer hung up.
    async fn read_some(&mut self, into: &mut [u8]) -> Result<usize> {
        let read = match self {
            Self::Plain(stream) => stream.read(into).await?,
            Self::Tls(stream) => stream.read(into).await?,
        };
        if read == 0 {
            Err(ClientError::ConnectionClosed)
        } else {
            Ok(read)
        }
    }

    async fn into_tls(self, server_name: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::TlsError("session already uses TLS".to_string()));
        };

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::TlsError(format!("bad server name {server_name}: {e}")))?;

        TlsConnector::from(Arc::new(tls_config(accept_invalid_certs)))
            .connect(name, stream)
            .await
            .map(|tls| Self::Tls(Box::new(tls)))
            .map_err(|e| ClientError::TlsError(e.to_string()))
    }
}

/// Client TLS settings trusting the platform's root certificates.
fn tls_config(accept_invalid_certs: bool) -> ClientConfig {
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() {
        tracing::warn!(errors = ?native.errors, "Some native certificates failed to load");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "Loaded native root certificates");

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
    }

    config
}

/// Skips certificate verification entirely, for relays with self-signed
/// certificates.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        use SignatureScheme::{
            ECDSA_NISTP256_SHA256, ECDSA_NISTP384_SHA384, ED25519, RSA_PKCS1_SHA256,
            RSA_PSS_SHA256,
        };
        vec![
            RSA_PKCS1_SHA256,
            RSA_PSS_SHA256,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ED25519,
        ]
    }
}

/// Prepare a message body for the DATA phase.
///
/// Line endings are normalised to CRLF, lines starting with `.` are
/// dot-stuffed (RFC 5321 section 4.5.2), and the terminating `.` line is
/// appended.
#[must_use]
pub fn dot_stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 64 + 5);
    let mut at_line_start = true;
    let mut previous = 0u8;

    for &byte in payload {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
        previous = byte;
    }

    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// An SMTP client session over an already-connected stream.
///
/// Every command method sends one line and waits for the complete reply.
/// Non-2xx replies are returned as [`Response`]s, not errors; only I/O,
/// parse and TLS failures are `Err`.
pub struct SmtpClient {
    transport: Option<Transport>,
    inbox: Vec<u8>,
    filled: usize,
    server_name: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Wrap a connected stream. `server_name` is verified against the
    /// certificate presented after STARTTLS.
    #[must_use]
    pub fn from_stream(stream: TcpStream, server_name: impl Into<String>) -> Self {
        Self {
            transport: Some(Transport::Plain(stream)),
            inbox: vec![0; INITIAL_INBOX],
            filled: 0,
            server_name: server_name.into(),
            accept_invalid_certs: false,
        }
    }

    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.transport, Some(Transport::Tls(_)))
    }

    fn transport(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    /// Reads the server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is malformed.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends `line` followed by CRLF and reads the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, line: &str) -> Result<Response> {
        outgoing!("{line}");
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");

        self.transport()?.write_all(&bytes).await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn ehlo(&mut self, client_name: &str) -> Result<Response> {
        self.command(&format!("EHLO {client_name}")).await
    }

    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn helo(&mut self, client_name: &str) -> Result<Response> {
        self.command(&format!("HELO {client_name}")).await
    }

    /// An empty `from` sends the null reverse-path `<>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message body after a `354` and reads the final reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn send_data(&mut self, payload: &[u8]) -> Result<Response> {
        let stuffed = dot_stuff(payload);
        outgoing!("<{} bytes of message data>", stuffed.len());

        self.transport()?.write_all(&stuffed).await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await
    }

    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Sends STARTTLS and, on a 2xx reply, performs the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the command or the TLS handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        if !response.is_success() {
            return Ok(response);
        }

        let plain = self.transport.take().ok_or(ClientError::ConnectionClosed)?;
        self.transport = Some(
            plain
                .into_tls(&self.server_name, self.accept_invalid_certs)
                .await?,
        );
        // Bytes read before the handshake belong to the plaintext session.
        self.filled = 0;

        Ok(response)
    }

    /// Reads until one complete (possibly multiline) reply is buffered.
    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, used)) = Response::parse_response(&self.inbox[..self.filled])? {
                self.inbox.copy_within(used..self.filled, 0);
                self.filled -= used;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.filled == self.inbox.len() {
                if self.inbox.len() >= MAX_INBOX {
                    return Err(ClientError::ParseError(format!(
                        "reply longer than {MAX_INBOX} bytes"
                    )));
                }
                self.inbox.resize((self.inbox.len() * 2).min(MAX_INBOX), 0);
            }

            let Self {
                transport, inbox, filled, ..
            } = self;
            let transport = transport.as_mut().ok_or(ClientError::ConnectionClosed)?;
            *filled += transport.read_some(&mut inbox[*filled..]).await?;
        }
    }
}
