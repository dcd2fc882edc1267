//! A scripted SMTP server on a loopback port.
//!
//! Every reply can be overridden through the builder, RCPT TO replies can
//! be set per address, and the server can hang up part way through a
//! session. Everything a client sends is recorded for assertions.
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> std::io::Result<()> {
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_response_for("full@example.com", 552, "mailbox quota exceeded")
//!     .build()
//!     .await?;
//!
//! // point a route or a StaticZone at server.port()
//! server.shutdown();
//! # Ok(())
//! # }
//! ```
#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{Mutex, watch},
    time::timeout,
};
use volley_common::tracing;

/// What a client sent, in arrival order across all connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content (after DATA), still dot-stuffed
    MessageContent(Vec<u8>),
    Rset,
    Noop,
    Quit,
    Other(String),
}

/// A single-line reply.
#[derive(Debug, Clone)]
struct Reply(u16, String);

impl Reply {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self(code, text.into())
    }

    fn render(&self) -> String {
        format!("{} {}\r\n", self.0, self.1)
    }
}

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    ehlo_code: u16,
    ehlo_lines: Vec<String>,
    helo: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    /// Keyed by lowercase address
    rcpt_for: HashMap<String, Reply>,
    data: Reply,
    data_end: Reply,
    quit: Reply,
    delay: Option<Duration>,
    hangup_after: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.test ESMTP ready"),
            ehlo_code: 250,
            ehlo_lines: vec!["mock.test".to_string(), "SIZE 10000000".to_string()],
            helo: Reply::new(250, "mock.test"),
            mail_from: Reply::new(250, "2.1.0 Sender OK"),
            rcpt_to: Reply::new(250, "2.1.5 Recipient OK"),
            rcpt_for: HashMap::new(),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "2.0.0 Queued"),
            quit: Reply::new(221, "2.0.0 Bye"),
            delay: None,
            hangup_after: None,
        }
    }
}

impl Script {
    fn ehlo(&self) -> String {
        let last = self.ehlo_lines.len().saturating_sub(1);
        self.ehlo_lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let separator = if i == last { ' ' } else { '-' };
                format!("{}{separator}{line}\r\n", self.ehlo_code)
            })
            .collect()
    }

    fn rcpt(&self, to: &str) -> &Reply {
        self.rcpt_for
            .get(&to.to_lowercase())
            .unwrap_or(&self.rcpt_to)
    }
}

/// Address inside `FROM:<a@b>` or `TO:<a@b>`.
fn path_of(argument: &str) -> String {
    argument
        .split_once(':')
        .map_or(argument, |(_, path)| path)
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

type Journal = Arc<Mutex<Vec<SmtpCommand>>>;

pub struct MockSmtpServer {
    addr: SocketAddr,
    journal: Journal,
    connections: Arc<AtomicUsize>,
    stop: watch::Sender<bool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::default()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.journal.lock().await.clone()
    }

    /// Addresses given in RCPT TO, in arrival order
    pub async fn recipients(&self) -> Vec<String> {
        self.journal
            .lock()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::RcptTo(to) => Some(to.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of completed DATA transfers
    pub async fn messages(&self) -> usize {
        self.journal
            .lock()
            .await
            .iter()
            .filter(|command| matches!(command, SmtpCommand::MessageContent(_)))
            .count()
    }

    /// TCP connections accepted so far
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Stop accepting connections. Sessions in progress run to completion.
    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

async fn session(stream: TcpStream, script: Arc<Script>, journal: Journal) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut seen = 0;

    writer.write_all(script.greeting.render().as_bytes()).await?;

    loop {
        if script.hangup_after.is_some_and(|limit| seen >= limit) {
            return Ok(());
        }

        line.clear();
        match timeout(Duration::from_secs(10), reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Err(_) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(_)) => seen += 1,
        }

        let input = line.trim_end();
        tracing::debug!("Mock server received: {input}");
        let (verb, argument) = input.split_once(' ').unwrap_or((input, ""));

        let (command, reply) = match verb.to_ascii_uppercase().as_str() {
            "EHLO" => (SmtpCommand::Ehlo(argument.to_string()), script.ehlo()),
            "HELO" => (
                SmtpCommand::Helo(argument.to_string()),
                script.helo.render(),
            ),
            "MAIL" => (
                SmtpCommand::MailFrom(path_of(argument)),
                script.mail_from.render(),
            ),
            "RCPT" => {
                let to = path_of(argument);
                let reply = script.rcpt(&to).render();
                (SmtpCommand::RcptTo(to), reply)
            }
            "DATA" => (SmtpCommand::Data, script.data.render()),
            "RSET" => (SmtpCommand::Rset, Reply::new(250, "2.0.0 Reset").render()),
            "NOOP" => (SmtpCommand::Noop, Reply::new(250, "2.0.0 OK").render()),
            "QUIT" => (SmtpCommand::Quit, script.quit.render()),
            _ => (
                SmtpCommand::Other(input.to_string()),
                Reply::new(500, "5.5.1 Unrecognized command").render(),
            ),
        };

        let closing = command == SmtpCommand::Quit;
        let body_follows = command == SmtpCommand::Data && script.data.0 == 354;
        journal.lock().await.push(command);

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        writer.write_all(reply.as_bytes()).await?;

        if closing {
            return Ok(());
        }

        if body_follows {
            let mut body = Vec::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" {
                    break;
                }
                body.extend_from_slice(line.as_bytes());
            }

            journal.lock().await.push(SmtpCommand::MessageContent(body));
            writer
                .write_all(script.data_end.render().as_bytes())
                .await?;
        }
    }
}

#[derive(Default)]
pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.greeting = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.script.ehlo_code = code;
        self.script.ehlo_lines = capabilities;
        self
    }

    #[must_use]
    pub fn with_helo_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.helo = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.mail_from = Reply::new(code, message);
        self
    }

    /// RCPT TO reply for addresses without their own
    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.rcpt_to = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_response_for(
        mut self,
        address: &str,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.script
            .rcpt_for
            .insert(address.to_lowercase(), Reply::new(code, message));
        self
    }

    /// Reply to the DATA command itself
    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data = Reply::new(code, message);
        self
    }

    /// Reply after the terminating `.` line
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, message);
        self
    }

    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.script.delay = Some(delay);
        self
    }

    /// Close each session, without a reply, once `count` commands arrived
    #[must_use]
    pub const fn with_hangup_after(mut self, count: usize) -> Self {
        self.script.hangup_after = Some(count);
        self
    }

    /// Bind to an ephemeral loopback port and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound.
    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let journal = Journal::default();
        let connections = Arc::new(AtomicUsize::new(0));
        let (stop, mut stopped) = watch::channel(false);

        let counter = Arc::clone(&connections);
        let recorded = Arc::clone(&journal);
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = stopped.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            tracing::debug!("Mock server accept failed: {e}");
                            continue;
                        }
                    },
                };

                counter.fetch_add(1, Ordering::SeqCst);
                let script = Arc::clone(&script);
                let journal = Arc::clone(&recorded);
                tokio::spawn(async move {
                    if let Err(e) = session(stream, script, journal).await {
                        tracing::debug!("Mock server session ended: {e}");
                    }
                });
            }
        });

        Ok(MockSmtpServer {
            addr,
            journal,
            connections,
            stop,
        })
    }
}
