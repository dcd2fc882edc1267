pub mod domain;
pub mod logging;
pub mod recipient;

pub use domain::Domain;
pub use recipient::{Recipient, RecipientError, RecipientList};
pub use tracing;

/// Process-wide control signals, fanned out over a broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Finish in-flight work, stop pulling new work and persist progress.
    Shutdown,
}
