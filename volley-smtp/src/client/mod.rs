//! SMTP client implementation.
//!
//! A connection is established by the caller (so address-family ordering
//! and connect timeouts stay under its control) and handed to
//! [`SmtpClient::from_stream`].
//!
//! ```no_run
//! use volley_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:2525").await?;
//! let mut client = SmtpClient::from_stream(stream, "mx.example.com");
//!
//! assert!(client.read_greeting().await?.is_success());
//! client.ehlo("sender.example.org").await?;
//! client.mail_from("news@example.org").await?;
//! client.rcpt_to("alice@example.com").await?;
//! client.data().await?;
//! client.send_data(b"Subject: hi\r\n\r\nHello\r\n").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, dot_stuff};
