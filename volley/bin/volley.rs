//! Command-line entry point for volley
//!
//! - `send` runs a campaign, resumable from its checkpoint
//! - `verify` sorts an address list into result files
//! - `estimate` sizes a campaign without sending
//! - `check` confirms a domain has a reachable endpoint

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use volley::{
    Config, Volley,
    controller::{SHUTDOWN_BROADCAST, shutdown},
};
use volley_common::logging;
use volley_delivery::Category;

/// Bulk SMTP dispatch and recipient validation
#[derive(Parser, Debug)]
#[command(name = "volley")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a message to every recipient in a list
    Send {
        /// Recipient list, one address per line
        #[arg(short, long)]
        recipients: PathBuf,

        /// Complete RFC 5322 message to send
        #[arg(short, long)]
        message: PathBuf,

        /// Continue from the last checkpoint
        #[arg(long)]
        resume: bool,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        workers: Option<usize>,

        #[arg(long)]
        emails_per_hour: Option<f64>,

        /// Send as fast as the workers allow
        #[arg(long)]
        no_throttle: bool,

        /// Where to persist progress
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Validate every address in a file
    Verify {
        /// Address list, one per line
        file: PathBuf,

        /// Directory for the result files
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The only MX host a domain may use
        #[arg(long)]
        expected_endpoint: Option<String>,

        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Estimate how long a campaign will take
    Estimate {
        #[arg(short, long)]
        recipients: PathBuf,
    },
    /// Check that a domain has a reachable endpoint
    Check {
        domain: String,
    },
}

impl Commands {
    /// Fold command-line overrides into the loaded configuration.
    fn apply(&self, config: &mut Config) {
        match self {
            Self::Send {
                resume,
                batch_size,
                workers,
                emails_per_hour,
                no_throttle,
                checkpoint,
                ..
            } => {
                let dispatch = &mut config.dispatch;
                dispatch.resume |= *resume;
                dispatch.enable_throttling &= !*no_throttle;
                if let Some(batch_size) = batch_size {
                    dispatch.batch_size = *batch_size;
                }
                if let Some(workers) = workers {
                    dispatch.workers = *workers;
                }
                if let Some(rate) = emails_per_hour {
                    dispatch.emails_per_hour = *rate;
                }
                if let Some(path) = checkpoint {
                    dispatch.checkpoint_path = Some(path.clone());
                }
            }
            Self::Verify {
                output,
                expected_endpoint,
                concurrency,
                ..
            } => {
                let validation = &mut config.validation;
                if let Some(output) = output {
                    validation.output_dir.clone_from(output);
                }
                if let Some(expected) = expected_endpoint {
                    validation.expected_endpoint = Some(expected.clone());
                }
                if let Some(concurrency) = concurrency {
                    validation.concurrency = *concurrency;
                }
            }
            Self::Estimate { .. } | Self::Check { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.command.apply(&mut config);

    logging::init();

    let volley = Volley::new(config)?;

    match cli.command {
        Commands::Send {
            recipients,
            message,
            ..
        } => {
            let receiver = SHUTDOWN_BROADCAST.subscribe();

            let summary = tokio::select! {
                summary = volley.send(&recipients, &message, receiver) => summary?,
                r = shutdown() => {
                    r?;
                    anyhow::bail!("Forced shutdown, progress after the last finished batch is kept");
                }
            };

            let stats = summary.stats;
            println!(
                "{} in {:.1}s: {} sent, {} failed of {} attempted ({:.1} emails/hour)",
                if summary.interrupted { "Interrupted" } else { "Finished" },
                summary.duration.as_secs_f64(),
                stats.sent,
                stats.failed,
                stats.attempted,
                summary.emails_per_hour
            );
            println!(
                "  rejected {}, over quota {}, insufficient storage {}, transient {}, unroutable {}",
                stats.rejected,
                stats.over_quota,
                stats.insufficient_storage,
                stats.transient,
                stats.unroutable
            );
            println!(
                "  batch {}/{} complete",
                summary.completed_batch_index, summary.total_batches
            );
            if !summary.failed_batches.is_empty() {
                println!("  abandoned batches: {:?}", summary.failed_batches);
            }
        }
        Commands::Verify { file, .. } => {
            let (report, files) = volley.verify(&file).await?;

            println!("{}", report.dashboard());
            for path in files {
                println!("  wrote {}", path.display());
            }
            if report.count(Category::Valid) == 0 && report.total() > 0 {
                println!("  no valid addresses found");
            }
        }
        Commands::Estimate { recipients } => {
            let estimate = volley.estimate(&recipients).await?;
            let hours = estimate.estimated_duration.as_secs_f64() / 3600.0;

            println!("Recipients:      {}", estimate.total_recipients);
            println!(
                "Batches:         {} (up to {} each)",
                estimate.total_batches, estimate.batch_size
            );
            println!("Rate:            {:.1} emails/hour", estimate.emails_per_hour);
            println!("Estimated time:  {hours:.2} hours ({:.1} days)", hours / 24.0);
        }
        Commands::Check { domain } => {
            let endpoint = volley.check(&domain).await?;
            println!("{domain}: {endpoint} is reachable");
        }
    }

    Ok(())
}
