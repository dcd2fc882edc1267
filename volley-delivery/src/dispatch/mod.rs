//! Batched, throttled and resumable campaign dispatch.
//!
//! The engine partitions recipients by domain (see [`DispatchPlan`]), then a
//! single feeder walks the domains in order: it resolves each domain once,
//! just before its batches are due, and releases batches into a bounded
//! queue at the pace set by the [`Throttle`]. A fixed pool of workers drains
//! the queue. Every finished batch is folded into the shared ledger and the
//! checkpoint is rewritten.
//!
//! ## Graceful Shutdown
//!
//! When a shutdown signal is received:
//! 1. The feeder stops releasing batches and the queue is closed
//! 2. Workers finish the batch in hand and stop pulling new ones
//! 3. A final checkpoint is written and the summary is marked interrupted
//!
//! Batches that were queued but never started are picked up by `--resume`.

mod checkpoint;
mod ledger;
mod plan;
mod stats;
mod throttle;
mod worker;

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{
    Mutex, Semaphore,
    broadcast::{self, error::RecvError},
};
use volley_common::{Domain, Recipient, Signal, internal, tracing};

pub use self::{
    checkpoint::ProgressCheckpoint,
    plan::{DispatchPlan, RecipientBatch},
    stats::{BatchReport, DispatchStats},
    throttle::Throttle,
    worker::PayloadStrategy,
};
use self::{
    ledger::Ledger,
    worker::{WorkItem, Worker},
};
use crate::{
    DeliveryEndpoint, EndpointResolver,
    connection::ConnectionManager,
    error::{CheckpointError, DispatchError},
};

const fn default_batch_size() -> usize {
    200
}

const fn default_workers() -> usize {
    150
}

const fn default_emails_per_hour() -> f64 {
    100.0
}

const fn default_min_batch_delay() -> u64 {
    60
}

const fn default_enable_throttling() -> bool {
    true
}

const fn default_wave_size() -> usize {
    1
}

#[allow(clippy::unnecessary_wraps)]
fn default_checkpoint_path() -> Option<PathBuf> {
    Some(PathBuf::from("backups/sending_progress.txt"))
}

/// Campaign dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Envelope sender for every transaction
    #[serde(default)]
    pub mail_from: String,

    /// Maximum recipients per batch (default: 200)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of concurrent workers (default: 150)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Concurrent connections allowed to a single domain
    ///
    /// Default: the number of workers, i.e. no extra limit
    #[serde(default)]
    pub max_connections_per_domain: Option<usize>,

    /// Target sending rate when throttling is enabled (default: 100)
    #[serde(default = "default_emails_per_hour")]
    pub emails_per_hour: f64,

    /// Minimum pause after each batch, in seconds (default: 60)
    #[serde(default = "default_min_batch_delay")]
    pub min_batch_delay_secs: u64,

    /// Pace batches to `emails_per_hour` (default: true)
    #[serde(default = "default_enable_throttling")]
    pub enable_throttling: bool,

    /// Batches released together before each pause (default: 1)
    #[serde(default = "default_wave_size")]
    pub wave_size: usize,

    /// Where progress is persisted. `None` disables checkpointing.
    ///
    /// Default: `backups/sending_progress.txt`
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: Option<PathBuf>,

    /// Continue from the checkpoint instead of starting over
    #[serde(default)]
    pub resume: bool,

    #[serde(default)]
    pub payload: PayloadStrategy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mail_from: String::new(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            max_connections_per_domain: None,
            emails_per_hour: default_emails_per_hour(),
            min_batch_delay_secs: default_min_batch_delay(),
            enable_throttling: default_enable_throttling(),
            wave_size: default_wave_size(),
            checkpoint_path: default_checkpoint_path(),
            resume: false,
            payload: PayloadStrategy::default(),
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub const fn throttle(&self) -> Throttle {
        Throttle {
            enabled: self.enable_throttling,
            emails_per_hour: self.emails_per_hour,
            min_batch_delay: Duration::from_secs(self.min_batch_delay_secs),
            wave_size: self.wave_size,
        }
    }

    fn workers(&self) -> usize {
        self.workers.max(1)
    }

    fn per_domain_limit(&self) -> usize {
        self.max_connections_per_domain
            .unwrap_or(self.workers)
            .clamp(1, Semaphore::MAX_PERMITS)
    }
}

/// Size and expected duration of a campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignEstimate {
    pub total_recipients: usize,
    pub total_batches: usize,
    pub batch_size: usize,
    pub emails_per_hour: f64,
    pub estimated_duration: Duration,
}

/// How a dispatch run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignSummary {
    pub stats: DispatchStats,
    pub duration: Duration,
    /// Achieved rate over this run, based on messages sent in it.
    pub emails_per_hour: f64,
    pub interrupted: bool,
    pub total_batches: usize,
    pub completed_batch_index: usize,
    /// 1-based numbers of batches abandoned as a whole.
    pub failed_batches: Vec<usize>,
}

/// Resolves only when a shutdown has been requested.
async fn requested(shutdown: &mut broadcast::Receiver<Signal>) {
    loop {
        match shutdown.recv().await {
            Ok(Signal::Shutdown) => return,
            Err(RecvError::Lagged(_)) => {}
            // Nobody can ask any more.
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Runs campaigns against a resolver and connection manager.
#[derive(Debug, Clone)]
pub struct DispatchEngine {
    config: Arc<DispatchConfig>,
    resolver: EndpointResolver,
    connections: ConnectionManager,
}

impl DispatchEngine {
    #[must_use]
    pub fn new(
        config: DispatchConfig,
        resolver: EndpointResolver,
        connections: ConnectionManager,
    ) -> Self {
        Self {
            config: Arc::new(config),
            resolver,
            connections,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Partition recipients with the configured batch size.
    #[must_use]
    pub fn plan(&self, recipients: impl IntoIterator<Item = Recipient>) -> DispatchPlan {
        DispatchPlan::new(recipients, self.config.batch_size)
    }

    /// How long the campaign should take at the configured rate.
    #[must_use]
    pub fn estimate(&self, plan: &DispatchPlan) -> CampaignEstimate {
        let emails_per_hour = self.config.emails_per_hour;

        #[allow(clippy::cast_precision_loss)]
        let hours = if emails_per_hour > 0.0 {
            plan.total_recipients() as f64 / emails_per_hour
        } else {
            0.0
        };

        CampaignEstimate {
            total_recipients: plan.total_recipients(),
            total_batches: plan.total_batches(),
            batch_size: plan.batch_size(),
            emails_per_hour,
            estimated_duration: Duration::try_from_secs_f64(hours * 3600.0)
                .unwrap_or(Duration::MAX),
        }
    }

    /// Resolve `domain`, connect, NOOP and QUIT.
    ///
    /// Returns the endpoint that answered.
    ///
    /// # Errors
    ///
    /// Returns the first failure: resolution, connection, or a refused NOOP.
    pub async fn check_endpoint(&self, domain: &Domain) -> Result<DeliveryEndpoint, DispatchError> {
        let endpoints = self.resolver.resolve(domain).await?;
        let mut connection = self
            .connections
            .connect_any(domain.as_str(), &endpoints)
            .await?;

        let noop = connection.noop().await;
        let endpoint = connection.endpoint().clone();
        connection.close().await;

        let noop = noop?;
        if noop.is_success() {
            internal!(level = INFO, %endpoint, "Endpoint for {domain} is reachable");
            Ok(endpoint)
        } else {
            Err(DispatchError::Smtp(noop.into_error()))
        }
    }

    /// Load the starting progress for `plan`.
    async fn starting_progress(
        &self,
        plan: &DispatchPlan,
    ) -> Result<ProgressCheckpoint, DispatchError> {
        let fresh = ProgressCheckpoint::new(plan.total_batches());

        if !self.config.resume {
            return Ok(fresh);
        }

        let Some(path) = &self.config.checkpoint_path else {
            tracing::warn!("Resume requested but checkpointing is disabled, starting fresh");
            return Ok(fresh);
        };

        match ProgressCheckpoint::load(path).await {
            Ok(Some(checkpoint)) if checkpoint.total_batches != plan.total_batches() => {
                Err(DispatchError::PlanMismatch {
                    checkpoint: checkpoint.total_batches,
                    plan: plan.total_batches(),
                })
            }
            Ok(Some(checkpoint)) => {
                internal!(
                    level = INFO,
                    "Resuming after batch {} of {} ({} sent, {} failed so far)",
                    checkpoint.completed_batch_index,
                    checkpoint.total_batches,
                    checkpoint.stats.sent,
                    checkpoint.stats.failed
                );
                Ok(checkpoint)
            }
            Ok(None) => {
                internal!(level = INFO, "No checkpoint at {}, starting fresh", path.display());
                Ok(fresh)
            }
            Err(err @ (CheckpointError::Parse { .. } | CheckpointError::MissingField(_))) => {
                tracing::warn!("Ignoring unreadable checkpoint {}: {err}", path.display());
                Ok(fresh)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Dispatch `payload` to every recipient in `plan`.
    ///
    /// Per-recipient and per-batch failures are counted, not returned.
    ///
    /// # Errors
    ///
    /// Only fails before any work starts: an invalid configuration, an
    /// unreadable checkpoint, or a checkpoint for a different plan.
    pub async fn run(
        &self,
        plan: &DispatchPlan,
        payload: Arc<[u8]>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<CampaignSummary, DispatchError> {
        if self.config.mail_from.trim().is_empty() {
            return Err(DispatchError::Configuration(
                "dispatch.mail_from must be set".to_string(),
            ));
        }

        let progress = self.starting_progress(plan).await?;
        let carried = progress.stats;
        let started = Instant::now();

        let ledger = Arc::new(Mutex::new(Ledger::new(
            progress.clone(),
            self.config.checkpoint_path.clone(),
        )));
        let stopping = Arc::new(AtomicBool::new(false));
        let workers = self.config.workers();
        let (queue, work) = async_channel::bounded::<WorkItem>(workers);

        internal!(
            level = INFO,
            "Dispatching {} recipients in {} batches with {workers} workers",
            plan.total_recipients(),
            plan.total_batches()
        );

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    total_batches: plan.total_batches(),
                    sender: Arc::from(self.config.mail_from.as_str()),
                    payload: Arc::clone(&payload),
                    strategy: self.config.payload,
                    connections: self.connections.clone(),
                    ledger: Arc::clone(&ledger),
                    stopping: Arc::clone(&stopping),
                };
                tokio::spawn(worker.run(work.clone()))
            })
            .collect();
        drop(work);

        let interrupted = tokio::select! {
            () = self.feed(plan, &progress, &queue, &ledger) => false,
            () = requested(&mut shutdown) => true,
        };
        queue.close();

        if interrupted {
            internal!(level = INFO, "Shutdown requested, waiting for in-flight batches");
            stopping.store(true, Ordering::SeqCst);
        }

        let mut joined = std::pin::pin!(join_all(handles));
        let (results, interrupted) = if interrupted {
            (joined.await, true)
        } else {
            tokio::select! {
                results = &mut joined => (results, false),
                () = requested(&mut shutdown) => {
                    internal!(level = INFO, "Shutdown requested, waiting for in-flight batches");
                    stopping.store(true, Ordering::SeqCst);
                    (joined.await, true)
                }
            }
        };
        for result in results {
            if let Err(e) = result {
                tracing::error!("Dispatch worker failed: {e}");
            }
        }

        let progress = {
            let mut ledger = ledger.lock().await;
            ledger.persist().await;
            ledger.progress().clone()
        };

        Ok(self.summarise(&progress, &carried, started.elapsed(), interrupted))
    }

    fn summarise(
        &self,
        progress: &ProgressCheckpoint,
        carried: &DispatchStats,
        duration: Duration,
        interrupted: bool,
    ) -> CampaignSummary {
        let sent_this_run = progress.stats.sent.saturating_sub(carried.sent);

        #[allow(clippy::cast_precision_loss)]
        let emails_per_hour = if duration.is_zero() {
            0.0
        } else {
            sent_this_run as f64 / (duration.as_secs_f64() / 3600.0)
        };

        let summary = CampaignSummary {
            stats: progress.stats,
            duration,
            emails_per_hour,
            interrupted,
            total_batches: progress.total_batches,
            completed_batch_index: progress.completed_batch_index,
            failed_batches: progress.failed_batches.iter().map(|i| i + 1).collect(),
        };

        internal!(
            level = INFO,
            sent = summary.stats.sent,
            failed = summary.stats.failed,
            attempted = summary.stats.attempted,
            interrupted,
            "Dispatch finished after {:.1}s ({:.1} emails/hour, batch {}/{})",
            duration.as_secs_f64(),
            emails_per_hour,
            summary.completed_batch_index,
            summary.total_batches
        );
        if !summary.failed_batches.is_empty() {
            tracing::warn!(
                "Batches {:?} were abandoned and are not retried automatically",
                summary.failed_batches
            );
        }

        summary
    }

    /// Release every outstanding batch, in plan order, at the throttled pace.
    async fn feed(
        &self,
        plan: &DispatchPlan,
        progress: &ProgressCheckpoint,
        queue: &async_channel::Sender<WorkItem>,
        ledger: &Mutex<Ledger>,
    ) {
        let throttle = self.config.throttle();
        let wave_size = throttle.wave_size();
        let wave_delay = throttle.wave_delay(plan.batch_size());
        let per_domain = self.config.per_domain_limit();

        let mut in_wave = 0;
        let mut owed = Duration::ZERO;

        for (domain, batches) in plan.domains() {
            let pending: Vec<&RecipientBatch> = batches
                .iter()
                .filter(|batch| !progress.is_complete(batch.index))
                .collect();
            if pending.is_empty() {
                continue;
            }

            // Each domain is one contiguous group, so this is its only lookup.
            let endpoints: Arc<[DeliveryEndpoint]> = match self.resolver.resolve(domain).await {
                Ok(endpoints) => endpoints.into(),
                Err(err) => {
                    tracing::warn!(
                        %domain,
                        batches = pending.len(),
                        "Unable to route domain, failing its batches: {err}"
                    );
                    let mut ledger = ledger.lock().await;
                    for batch in pending {
                        let mut stats = DispatchStats::default();
                        stats.record_unroutable(batch.len() as u64);
                        ledger
                            .record(&BatchReport {
                                index: batch.index,
                                domain: domain.clone(),
                                stats,
                                aborted: Some(err.to_string()),
                            })
                            .await;
                    }
                    continue;
                }
            };

            let permits = Arc::new(Semaphore::new(per_domain));

            for batch in pending {
                if !owed.is_zero() {
                    tracing::debug!("Throttling for {owed:?} before batch {}", batch.number());
                    tokio::time::sleep(owed).await;
                    owed = Duration::ZERO;
                }

                let item = WorkItem {
                    batch: batch.clone(),
                    endpoints: Arc::clone(&endpoints),
                    permits: Arc::clone(&permits),
                };
                if queue.send(item).await.is_err() {
                    return;
                }

                in_wave += 1;
                if in_wave == wave_size {
                    in_wave = 0;
                    owed = wave_delay;
                }
            }
        }
    }
}
