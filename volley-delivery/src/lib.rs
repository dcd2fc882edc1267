//! Outbound delivery for bulk campaigns
//!
//! This crate provides:
//! - MX endpoint resolution with caching and per-domain route overrides
//! - SMTP connection establishment with address-family fallback
//! - Classification of SMTP replies into delivery outcomes
//! - A batched, throttled, resumable dispatch engine
//! - A sequential recipient validation pipeline

mod classify;
mod connection;
mod dispatch;
mod dns;
mod error;
mod types;
mod validation;

pub use classify::{DeliveryOutcome, Exhaustion, classify, classify_reply};
pub use connection::{
    AddressFamily, ConnectAttempt, Connection, ConnectionConfig, ConnectionManager, TlsPolicy,
};
pub use dispatch::{
    BatchReport, CampaignEstimate, CampaignSummary, DispatchConfig, DispatchEngine, DispatchPlan,
    DispatchStats, PayloadStrategy, ProgressCheckpoint, RecipientBatch, Throttle,
};
pub use dns::{DeliveryEndpoint, DnsConfig, DnsResolver, EndpointResolver, Resolve, ResolveError};
pub use error::{CheckpointError, ConnectionUnavailable, DispatchError};
pub use types::{RoutingConfig, SmtpTimeouts};
pub use validation::{
    Category, ValidationConfig, ValidationReport, Validator, VerificationRecord,
};
