//! Bulk SMTP dispatch and recipient validation
//!
//! The binary wires configuration into the engines from `volley-delivery`:
//! - [`config`] loads the RON configuration file
//! - [`controller`] runs campaigns, validation, estimates and endpoint checks

pub mod config;
pub mod controller;

pub use config::Config;
pub use controller::Volley;
