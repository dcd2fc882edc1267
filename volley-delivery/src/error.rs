//! Typed error handling for dispatch and validation.
//!
//! Per-recipient outcomes (rejections, quota exhaustion) are not errors; they
//! are classified and counted. The types here cover the failures that abandon
//! a whole batch, a domain, or the run itself.

use std::{
    fmt::{self, Display},
    io,
};

use thiserror::Error;
use volley_smtp::ClientError;

use crate::{ResolveError, connection::ConnectAttempt};

/// Every address of every candidate endpoint was tried and none produced a
/// usable session.
#[derive(Debug, Clone)]
pub struct ConnectionUnavailable {
    /// The domain or endpoint that was being connected to.
    pub target: String,
    pub attempts: Vec<ConnectAttempt>,
}

impl Display for ConnectionUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "No usable connection to {} after {} attempt(s)",
            self.target,
            self.attempts.len()
        )?;
        match self.attempts.last() {
            Some(last) => write!(f, ", last: {last}"),
            None => Ok(()),
        }
    }
}

impl std::error::Error for ConnectionUnavailable {}

/// Reading or writing the progress checkpoint failed.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed checkpoint line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Checkpoint is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Errors that stop a dispatch run (or a single configuration check).
///
/// Only raised before work starts; once batches are flowing every failure
/// is counted instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The checkpoint was written for a different recipient list or batch size.
    #[error(
        "Checkpoint covers {checkpoint} batches but the current plan has {plan}; \
         the recipient list or batch size changed"
    )]
    PlanMismatch { checkpoint: usize, plan: usize },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Connection(#[from] ConnectionUnavailable),

    #[error("SMTP error: {0}")]
    Smtp(#[from] ClientError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}
