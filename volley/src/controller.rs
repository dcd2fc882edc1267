use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use tokio::sync::broadcast;
use volley_common::{Domain, RecipientList, Signal, internal, tracing};
use volley_delivery::{
    CampaignEstimate, CampaignSummary, ConnectionManager, DeliveryEndpoint, DispatchEngine,
    DnsResolver, EndpointResolver, Resolve, ValidationReport, Validator,
};

use crate::config::Config;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Wait for CTRL+C or SIGTERM, then broadcast [`Signal::Shutdown`].
///
/// A second CTRL+C returns straight away so the caller can exit without
/// waiting for in-flight batches.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    tokio::signal::ctrl_c().await?;
    internal!(level = WARN, "Forced shutdown");

    Ok(())
}

/// Everything a command needs: configuration, a resolver and connections.
pub struct Volley {
    config: Config,
    lookup: Arc<dyn Resolve>,
    connections: ConnectionManager,
}

impl std::fmt::Debug for Volley {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volley")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Volley {
    /// Build against the system DNS resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the system resolver configuration cannot be loaded.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let lookup = DnsResolver::with_dns_config(config.dns.clone())?;
        Ok(Self::with_resolver(config, Arc::new(lookup)))
    }

    pub fn with_resolver(config: Config, lookup: Arc<dyn Resolve>) -> Self {
        let connections = ConnectionManager::new(config.connection.clone());
        Self {
            config,
            lookup,
            connections,
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    fn engine(&self) -> DispatchEngine {
        DispatchEngine::new(
            self.config.dispatch.clone(),
            EndpointResolver::new(
                Arc::clone(&self.lookup),
                self.config.routing.clone(),
                self.config.dns.smtp_port,
            ),
            self.connections.clone(),
        )
    }

    fn validator(&self) -> Validator {
        Validator::new(
            Arc::clone(&self.lookup),
            self.connections.clone(),
            self.config.validation.clone(),
        )
    }

    /// Send `message` to everyone in `recipients`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read, the list holds no
    /// usable address, or the campaign cannot start.
    pub async fn send(
        &self,
        recipients: &Path,
        message: &Path,
        shutdown: broadcast::Receiver<Signal>,
    ) -> anyhow::Result<CampaignSummary> {
        let list = read_recipients(recipients).await?;
        let payload = tokio::fs::read(message)
            .await
            .with_context(|| format!("Failed to read message from {}", message.display()))?;

        if payload.is_empty() {
            anyhow::bail!("Message file {} is empty", message.display());
        }

        let engine = self.engine();
        let plan = engine.plan(list.into_recipients());
        let estimate = engine.estimate(&plan);
        internal!(
            level = INFO,
            "Campaign of {} recipients in {} batches, estimated {:.1}h",
            estimate.total_recipients,
            estimate.total_batches,
            estimate.estimated_duration.as_secs_f64() / 3600.0
        );

        Ok(engine.run(&plan, Arc::from(payload), shutdown).await?)
    }

    /// Validate every address in `input` and write the result files.
    ///
    /// # Errors
    ///
    /// Returns an error if the input cannot be read or the results cannot be
    /// written.
    pub async fn verify(&self, input: &Path) -> anyhow::Result<(ValidationReport, Vec<PathBuf>)> {
        let content = tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("Failed to read addresses from {}", input.display()))?;

        let addresses: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        internal!(level = INFO, "Validating {} addresses", addresses.len());

        let report = self.validator().validate_all(addresses).await;

        let dir = &self.config.validation.output_dir;
        let files = report
            .write_files(dir, chrono::Utc::now())
            .await
            .with_context(|| format!("Failed to write results to {}", dir.display()))?;

        Ok((report, files))
    }

    /// Size up a campaign without sending anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the recipient list cannot be read.
    pub async fn estimate(&self, recipients: &Path) -> anyhow::Result<CampaignEstimate> {
        let list = read_recipients(recipients).await?;
        let engine = self.engine();
        Ok(engine.estimate(&engine.plan(list.into_recipients())))
    }

    /// Make sure `domain` has a reachable endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain cannot be resolved or reached.
    pub async fn check(&self, domain: &str) -> anyhow::Result<DeliveryEndpoint> {
        Ok(self.engine().check_endpoint(&Domain::new(domain)).await?)
    }
}

async fn read_recipients(path: &Path) -> anyhow::Result<RecipientList> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read recipients from {}", path.display()))?;

    let list = RecipientList::parse(&content);
    for (line, err) in list.malformed() {
        tracing::debug!(line = %line, "Skipping malformed recipient: {err}");
    }
    if !list.malformed().is_empty() {
        tracing::warn!(
            "Skipped {} malformed recipient(s) in {}",
            list.malformed().len(),
            path.display()
        );
    }

    if list.is_empty() {
        anyhow::bail!("No valid recipients in {}", path.display());
    }

    Ok(list)
}
