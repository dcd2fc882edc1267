//! Error types for the SMTP client.

use std::{io, time::Duration};

use thiserror::Error;

/// Errors that can occur when talking to an SMTP server.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered with a status code the caller treats as failure.
    ///
    /// The code is kept so that callers can still classify the reply; some
    /// servers answer with a 2xx code where a 3xx was expected.
    #[error("SMTP error: {code} - {message}")]
    SmtpError { code: u16, message: String },

    /// TLS/SSL error occurred.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// The server did not answer in time.
    #[error("{command} timed out after {elapsed:?}")]
    Timeout {
        command: &'static str,
        elapsed: Duration,
    },

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// The SMTP status code carried by this error, if the server sent one.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::SmtpError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The server's reply text, or the error's own description.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::SmtpError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
