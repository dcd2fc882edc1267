//! SMTP client plumbing shared by dispatch and validation.
//!
//! Only the client half of RFC 5321 lives here: reading replies, issuing
//! commands, STARTTLS and transparent DATA transfer. Deciding what a reply
//! *means* is left to the callers.

pub mod client;

pub use client::{ClientError, Response, SmtpClient};
