//! Batch workers.
//!
//! Each worker pulls a batch from the shared queue, opens one connection to
//! the batch's domain, runs the SMTP transaction(s), closes the connection
//! and reports to the ledger. A worker exits when the queue is closed and
//! drained, or before pulling new work once shutdown has been requested.

use std::{
    fmt::{self, Display},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use volley_common::{Recipient, internal, tracing};
use volley_smtp::{ClientError, Response};

use super::{
    RecipientBatch,
    ledger::Ledger,
    stats::{BatchReport, DispatchStats},
};
use crate::{
    DeliveryEndpoint,
    classify::{DeliveryOutcome, classify, classify_reply},
    connection::{Connection, ConnectionManager},
};

/// How a batch is turned into SMTP transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadStrategy {
    /// One transaction per batch: MAIL, a RCPT per recipient, one DATA.
    #[default]
    PerBatch,
    /// One complete transaction per recipient over the batch's connection.
    PerRecipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    ConnectionEstablishing,
    Sending,
    Reporting,
}

impl Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::ConnectionEstablishing => "connecting",
            Self::Sending => "sending",
            Self::Reporting => "reporting",
        })
    }
}

/// A routable batch with everything a worker needs to deliver it.
pub struct WorkItem {
    pub batch: RecipientBatch,
    pub endpoints: Arc<[DeliveryEndpoint]>,
    /// Bounds concurrent connections to the batch's domain.
    pub permits: Arc<Semaphore>,
}

pub struct Worker {
    pub id: usize,
    pub total_batches: usize,
    pub sender: Arc<str>,
    pub payload: Arc<[u8]>,
    pub strategy: PayloadStrategy,
    pub connections: ConnectionManager,
    pub ledger: Arc<Mutex<Ledger>>,
    pub stopping: Arc<AtomicBool>,
}

/// Why the rest of a batch could not be attempted.
type Abort = String;

impl Worker {
    fn transition(&self, state: WorkerState) {
        internal!(worker = self.id, %state, "Worker state");
    }

    pub async fn run(self, queue: async_channel::Receiver<WorkItem>) {
        self.transition(WorkerState::Idle);

        while !self.stopping.load(Ordering::SeqCst) {
            let Ok(item) = queue.recv().await else {
                break;
            };

            // Shutdown may have arrived while we were waiting.
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let report = self.deliver(item).await;

            self.transition(WorkerState::Reporting);
            tracing::info!(
                batch = report.index + 1,
                total = self.total_batches,
                domain = %report.domain,
                sent = report.stats.sent,
                failed = report.stats.failed,
                "Batch {}/{} complete",
                report.index + 1,
                self.total_batches
            );
            self.ledger.lock().await.record(&report).await;
            self.transition(WorkerState::Idle);
        }

        internal!(worker = self.id, "Worker finished");
    }

    async fn deliver(&self, item: WorkItem) -> BatchReport {
        let WorkItem {
            batch,
            endpoints,
            permits,
        } = item;
        let mut stats = DispatchStats::default();

        self.transition(WorkerState::ConnectionEstablishing);
        let Ok(_permit) = permits.acquire().await else {
            return Self::abort(batch, stats, "domain connection limit closed".to_string());
        };

        let mut connection = match self
            .connections
            .connect_any(batch.domain.as_str(), &endpoints)
            .await
        {
            Ok(connection) => connection,
            Err(unavailable) => {
                tracing::warn!(batch = batch.number(), "{unavailable}");
                return Self::abort(batch, stats, unavailable.to_string());
            }
        };

        self.transition(WorkerState::Sending);
        let aborted = match self.strategy {
            PayloadStrategy::PerBatch => {
                self.per_batch(&mut connection, &batch.recipients, &mut stats)
                    .await
            }
            PayloadStrategy::PerRecipient => {
                self.per_recipient(&mut connection, &batch.recipients, &mut stats)
                    .await
            }
        };
        connection.close().await;

        if let Some(reason) = &aborted {
            tracing::warn!(
                batch = batch.number(),
                domain = %batch.domain,
                "Batch cut short: {reason}"
            );
        }

        BatchReport {
            index: batch.index,
            domain: batch.domain,
            stats,
            aborted,
        }
    }

    /// The whole batch failed before any recipient was attempted.
    fn abort(batch: RecipientBatch, mut stats: DispatchStats, reason: Abort) -> BatchReport {
        for _ in &batch.recipients {
            stats.record(DeliveryOutcome::TransientError);
        }
        BatchReport {
            index: batch.index,
            domain: batch.domain,
            stats,
            aborted: Some(reason),
        }
    }

    async fn per_batch(
        &self,
        connection: &mut Connection,
        recipients: &[Recipient],
        stats: &mut DispatchStats,
    ) -> Option<Abort> {
        let mail = connection.mail_from(&self.sender).await;
        let outcome = classify_reply(&mail);
        if !outcome.is_accepted() {
            record_all(stats, recipients.len(), outcome);
            return broken(&mail);
        }

        let mut accepted = 0;
        for (position, recipient) in recipients.iter().enumerate() {
            let reply = connection.rcpt_to(recipient.address()).await;
            let outcome = classify_reply(&reply);

            if outcome.is_accepted() {
                accepted += 1;
                continue;
            }

            if let Some(reason) = broken(&reply) {
                // Neither the accepted ones nor the rest will be delivered.
                record_all(
                    stats,
                    accepted + recipients.len() - position,
                    DeliveryOutcome::TransientError,
                );
                return Some(reason);
            }

            tracing::debug!(recipient = recipient.address(), ?outcome, "Recipient refused");
            stats.record(outcome);
        }

        if accepted == 0 {
            // Nothing to send; leave the session clean before QUIT.
            let _ = connection.rset().await;
            return None;
        }

        let data = connection.data(&self.payload).await;
        record_all(stats, accepted, data_outcome(&data));
        broken(&data)
    }

    async fn per_recipient(
        &self,
        connection: &mut Connection,
        recipients: &[Recipient],
        stats: &mut DispatchStats,
    ) -> Option<Abort> {
        for (position, recipient) in recipients.iter().enumerate() {
            let remaining = recipients.len() - position;

            let mail = connection.mail_from(&self.sender).await;
            if let Some(reason) = broken(&mail) {
                record_all(stats, remaining, DeliveryOutcome::TransientError);
                return Some(reason);
            }
            let outcome = classify_reply(&mail);
            if !outcome.is_accepted() {
                stats.record(outcome);
                let _ = connection.rset().await;
                continue;
            }

            let rcpt = connection.rcpt_to(recipient.address()).await;
            if let Some(reason) = broken(&rcpt) {
                record_all(stats, remaining, DeliveryOutcome::TransientError);
                return Some(reason);
            }
            let outcome = classify_reply(&rcpt);
            if !outcome.is_accepted() {
                tracing::debug!(recipient = recipient.address(), ?outcome, "Recipient refused");
                stats.record(outcome);
                let _ = connection.rset().await;
                continue;
            }

            let data = connection.data(&self.payload).await;
            stats.record(data_outcome(&data));
            if let Some(reason) = broken(&data) {
                record_all(stats, remaining - 1, DeliveryOutcome::TransientError);
                return Some(reason);
            }
            if !matches!(&data, Ok(reply) if reply.is_success()) {
                let _ = connection.rset().await;
            }
        }

        None
    }
}

fn record_all(stats: &mut DispatchStats, count: usize, outcome: DeliveryOutcome) {
    for _ in 0..count {
        stats.record(outcome);
    }
}

/// A reply without a status code means the session itself is gone.
fn broken(reply: &Result<Response, ClientError>) -> Option<Abort> {
    match reply {
        Err(err) if err.code().is_none() => Some(err.to_string()),
        _ => None,
    }
}

/// Outcome of the DATA phase for the recipients it covers.
///
/// A 2xx where `354` was required is a protocol violation, not an
/// acceptance.
fn data_outcome(reply: &Result<Response, ClientError>) -> DeliveryOutcome {
    match reply {
        Err(err) if err.code().is_some_and(|code| (200..300).contains(&code)) => {
            DeliveryOutcome::Rejected
        }
        Ok(response) => classify(Some(response.code), &response.message()),
        Err(err) => classify(err.code(), &err.detail()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::classify::Exhaustion;

    #[test]
    fn test_data_outcome() {
        let early_ok = Err(ClientError::SmtpError {
            code: 250,
            message: "OK".to_string(),
        });
        assert_eq!(data_outcome(&early_ok), DeliveryOutcome::Rejected);

        let queued = Ok(Response::new(250, vec!["queued".to_string()]));
        assert_eq!(data_outcome(&queued), DeliveryOutcome::Accepted);

        let full = Ok(Response::new(552, vec!["quota exceeded".to_string()]));
        assert_eq!(
            data_outcome(&full),
            DeliveryOutcome::ResourceExhausted(Exhaustion::OverQuota)
        );
    }

    #[test]
    fn test_broken_only_without_code() {
        let refused: Result<Response, ClientError> = Err(ClientError::SmtpError {
            code: 550,
            message: "no".to_string(),
        });
        assert_eq!(broken(&refused), None);

        let timeout: Result<Response, ClientError> = Err(ClientError::Timeout {
            command: "RCPT TO",
            elapsed: Duration::from_secs(1),
        });
        assert!(broken(&timeout).is_some());
    }
}
