//! Integration tests for the dispatch engine

mod support;

use std::{path::Path, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use support::{StaticZone, mock_server::MockSmtpServer, mock_server::SmtpCommand};
use tokio::sync::broadcast;
use volley_common::{Domain, Recipient, Signal};
use volley_delivery::{
    ConnectionConfig, ConnectionManager, DeliveryEndpoint, DispatchConfig, DispatchEngine,
    DispatchError, EndpointResolver, PayloadStrategy, ProgressCheckpoint, ResolveError,
    RoutingConfig,
};

const PAYLOAD: &[u8] = b"Subject: Hello\r\n\r\nHi there.\r\n";

fn recipients(domain: &str, count: usize) -> Vec<Recipient> {
    (0..count)
        .map(|i| Recipient::parse(&format!("user{i}@{domain}")).unwrap())
        .collect()
}

fn config(checkpoint: &Path) -> DispatchConfig {
    DispatchConfig {
        mail_from: "campaign@sender.test".to_string(),
        workers: 4,
        enable_throttling: false,
        min_batch_delay_secs: 0,
        checkpoint_path: Some(checkpoint.to_path_buf()),
        ..Default::default()
    }
}

fn engine(zone: Arc<StaticZone>, config: DispatchConfig) -> DispatchEngine {
    DispatchEngine::new(
        config,
        EndpointResolver::new(zone, RoutingConfig::default(), 25),
        ConnectionManager::new(ConnectionConfig::default()),
    )
}

fn no_shutdown() -> (broadcast::Sender<Signal>, broadcast::Receiver<Signal>) {
    broadcast::channel(4)
}

async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_full_campaign_in_three_batches() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("sending_progress.txt");

    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config(&checkpoint),
    );
    let plan = engine.plan(recipients("example.com", 450));
    let sizes: Vec<_> = plan.batches().iter().map(|b| b.len()).collect();
    assert_eq!(sizes, [200, 200, 50]);

    let (_tx, rx) = no_shutdown();
    let summary = engine.run(&plan, Arc::from(PAYLOAD), rx).await.unwrap();

    assert_eq!(summary.stats.sent, 450);
    assert_eq!(summary.stats.failed, 0);
    assert_eq!(summary.stats.attempted, 450);
    assert_eq!(summary.completed_batch_index, 3);
    assert!(!summary.interrupted);
    assert!(summary.failed_batches.is_empty());

    // One connection and one DATA per batch.
    assert_eq!(server.connection_count(), 3);
    assert_eq!(server.messages().await, 3);
    assert_eq!(server.recipients().await.len(), 450);

    let saved = ProgressCheckpoint::load(&checkpoint).await.unwrap().unwrap();
    assert_eq!(saved.completed_batch_index, 3);
    assert_eq!(saved.total_batches, 3);
    assert_eq!(saved.stats.sent, 450);

    server.shutdown();
}

#[tokio::test]
async fn test_payload_is_dot_stuffed() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config(&dir.path().join("progress.txt")),
    );
    let plan = engine.plan(recipients("example.com", 1));

    let (_tx, rx) = no_shutdown();
    engine
        .run(&plan, Arc::from(&b"Subject: x\n\n.leading dot\n"[..]), rx)
        .await
        .unwrap();

    let content = server
        .commands()
        .await
        .into_iter()
        .find_map(|command| match command {
            SmtpCommand::MessageContent(content) => Some(content),
            _ => None,
        })
        .unwrap();
    assert_eq!(content, b"Subject: x\r\n\r\n..leading dot\r\n");

    server.shutdown();
}

#[tokio::test]
async fn test_resource_exhaustion_is_counted_separately() {
    let server = MockSmtpServer::builder()
        .with_rcpt_response_for("user1@example.com", 552, "5.2.2 mailbox quota exceeded")
        .with_rcpt_response_for("user2@example.com", 452, "4.3.1 Insufficient system storage")
        .with_rcpt_response_for("user3@example.com", 550, "5.1.1 No such user")
        .build()
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();

    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config(&dir.path().join("progress.txt")),
    );
    let plan = engine.plan(recipients("example.com", 10));

    let (_tx, rx) = no_shutdown();
    let summary = engine.run(&plan, Arc::from(PAYLOAD), rx).await.unwrap();

    assert_eq!(summary.stats.sent, 7);
    assert_eq!(summary.stats.failed, 3);
    assert_eq!(summary.stats.over_quota, 1);
    assert_eq!(summary.stats.insufficient_storage, 1);
    assert_eq!(summary.stats.rejected, 1);
    // A refused recipient does not abandon the batch.
    assert!(summary.failed_batches.is_empty());
    assert_eq!(server.messages().await, 1);

    server.shutdown();
}

#[tokio::test]
async fn test_unroutable_domain_fails_without_connecting() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let zone = StaticZone::new()
        .with_local_mx("good.example", server.port())
        .with_error(
            "slow.example",
            ResolveError::ResolutionTimeout("slow.example".to_string()),
        )
        .shared();
    let engine = engine(Arc::clone(&zone), config(&dir.path().join("progress.txt")));

    let mut input = recipients("missing.example", 3);
    input.extend(recipients("good.example", 2));
    input.extend(recipients("slow.example", 250));
    let plan = engine.plan(input);
    assert_eq!(plan.total_batches(), 4);

    let (_tx, rx) = no_shutdown();
    let summary = engine.run(&plan, Arc::from(PAYLOAD), rx).await.unwrap();

    assert_eq!(summary.stats.sent, 2);
    assert_eq!(summary.stats.unroutable, 253);
    assert_eq!(summary.stats.failed, 253);
    assert_eq!(summary.completed_batch_index, 4);
    // Batch 1 (missing.example) and 3-4 (slow.example), reported 1-based.
    assert_eq!(summary.failed_batches, vec![1, 3, 4]);
    assert_eq!(server.connection_count(), 1);
    // One lookup per domain.
    assert_eq!(zone.lookups(), 3);

    server.shutdown();
}

#[tokio::test]
async fn test_connection_failure_fails_whole_batch() {
    let dir = tempfile::tempdir().unwrap();
    let port = closed_port().await;

    let engine = engine(
        StaticZone::new()
            .with_mx(
                "down.example",
                vec![
                    DeliveryEndpoint::new("127.0.0.1", 10, port),
                    DeliveryEndpoint::new("127.0.0.1", 20, port),
                ],
            )
            .shared(),
        config(&dir.path().join("progress.txt")),
    );
    let plan = engine.plan(recipients("down.example", 5));

    let (_tx, rx) = no_shutdown();
    let summary = engine.run(&plan, Arc::from(PAYLOAD), rx).await.unwrap();

    assert_eq!(summary.stats.transient, 5);
    assert_eq!(summary.stats.sent, 0);
    assert_eq!(summary.failed_batches, vec![1]);
    assert_eq!(summary.completed_batch_index, 1);
}

#[tokio::test]
async fn test_rejected_mail_from_fails_transaction() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(550, "Sender blocked")
        .build()
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();

    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config(&dir.path().join("progress.txt")),
    );
    let plan = engine.plan(recipients("example.com", 4));

    let (_tx, rx) = no_shutdown();
    let summary = engine.run(&plan, Arc::from(PAYLOAD), rx).await.unwrap();

    assert_eq!(summary.stats.rejected, 4);
    assert!(server.recipients().await.is_empty());

    server.shutdown();
}

#[tokio::test]
async fn test_dropped_session_fails_rest_of_batch() {
    // Greeting, EHLO, MAIL and two RCPTs, then the line goes dead.
    let server = MockSmtpServer::builder()
        .with_hangup_after(4)
        .build()
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();

    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config(&dir.path().join("progress.txt")),
    );
    let plan = engine.plan(recipients("example.com", 6));

    let (_tx, rx) = no_shutdown();
    let summary = engine.run(&plan, Arc::from(PAYLOAD), rx).await.unwrap();

    assert_eq!(summary.stats.sent, 0);
    assert_eq!(summary.stats.transient, 6);
    assert_eq!(summary.failed_batches, vec![1]);

    server.shutdown();
}

#[tokio::test]
async fn test_per_recipient_strategy() {
    let server = MockSmtpServer::builder()
        .with_rcpt_response_for("user1@example.com", 550, "No such user")
        .build()
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();

    let mut config = config(&dir.path().join("progress.txt"));
    config.payload = PayloadStrategy::PerRecipient;
    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config,
    );
    let plan = engine.plan(recipients("example.com", 3));

    let (_tx, rx) = no_shutdown();
    let summary = engine.run(&plan, Arc::from(PAYLOAD), rx).await.unwrap();

    assert_eq!(summary.stats.sent, 2);
    assert_eq!(summary.stats.rejected, 1);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.messages().await, 2);
    assert!(server.commands().await.contains(&SmtpCommand::Rset));

    server.shutdown();
}

#[tokio::test]
async fn test_resume_skips_completed_batches() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("sending_progress.txt");

    // Batch 1 finished in an earlier run, batch 3 finished out of order.
    let mut previous = ProgressCheckpoint::new(3);
    previous.mark_complete(0);
    previous.mark_complete(2);
    previous.stats.attempted = 250;
    previous.stats.sent = 250;
    previous.save(&checkpoint).await.unwrap();

    let mut config = config(&checkpoint);
    config.resume = true;
    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config,
    );
    let plan = engine.plan(recipients("example.com", 450));

    let (_tx, rx) = no_shutdown();
    let summary = engine.run(&plan, Arc::from(PAYLOAD), rx).await.unwrap();

    // Only batch 2 went out again.
    let sent_now = server.recipients().await;
    assert_eq!(sent_now.len(), 200);
    assert_eq!(sent_now.first().map(String::as_str), Some("user200@example.com"));
    assert_eq!(server.connection_count(), 1);

    // Same totals as an uninterrupted run.
    assert_eq!(summary.stats.sent, 450);
    assert_eq!(summary.stats.attempted, 450);
    assert_eq!(summary.completed_batch_index, 3);

    server.shutdown();
}

#[tokio::test]
async fn test_resume_with_different_plan_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("sending_progress.txt");
    ProgressCheckpoint::new(7).save(&checkpoint).await.unwrap();

    let mut config = config(&checkpoint);
    config.resume = true;
    let engine = engine(StaticZone::new().shared(), config);
    let plan = engine.plan(recipients("example.com", 450));

    let (_tx, rx) = no_shutdown();
    let result = engine.run(&plan, Arc::from(PAYLOAD), rx).await;

    assert!(matches!(
        result,
        Err(DispatchError::PlanMismatch {
            checkpoint: 7,
            plan: 3
        })
    ));
}

#[tokio::test]
async fn test_unreadable_checkpoint_starts_fresh() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("sending_progress.txt");
    std::fs::write(&checkpoint, "this is not a checkpoint\n").unwrap();

    let mut config = config(&checkpoint);
    config.resume = true;
    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config,
    );
    let plan = engine.plan(recipients("example.com", 5));

    let (_tx, rx) = no_shutdown();
    let summary = engine.run(&plan, Arc::from(PAYLOAD), rx).await.unwrap();

    assert_eq!(summary.stats.sent, 5);
    let saved = ProgressCheckpoint::load(&checkpoint).await.unwrap().unwrap();
    assert_eq!(saved.completed_batch_index, 1);

    server.shutdown();
}

#[tokio::test]
async fn test_shutdown_stops_feeding_and_persists() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("sending_progress.txt");

    let mut config = config(&checkpoint);
    config.batch_size = 2;
    // The feeder pauses a minute after the first batch.
    config.min_batch_delay_secs = 60;
    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config,
    );
    let plan = engine.plan(recipients("example.com", 6));

    let (tx, rx) = broadcast::channel(4);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = tx.send(Signal::Shutdown);
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(30),
        engine.run(&plan, Arc::from(PAYLOAD), rx),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(summary.interrupted);
    assert!(summary.completed_batch_index < 3);
    assert_eq!(summary.stats.sent, 2);

    let saved = ProgressCheckpoint::load(&checkpoint).await.unwrap().unwrap();
    assert_eq!(saved.completed_batch_index, summary.completed_batch_index);
    assert_eq!(saved.total_batches, 3);

    server.shutdown();
}

#[tokio::test]
async fn test_mail_from_is_required() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir.path().join("progress.txt"));
    config.mail_from = String::new();

    let engine = engine(StaticZone::new().shared(), config);
    let plan = engine.plan(recipients("example.com", 1));

    let (_tx, rx) = no_shutdown();
    assert!(matches!(
        engine.run(&plan, Arc::from(PAYLOAD), rx).await,
        Err(DispatchError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_check_endpoint() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let engine = engine(
        StaticZone::new()
            .with_local_mx("example.com", server.port())
            .shared(),
        config(&dir.path().join("progress.txt")),
    );

    let endpoint = engine
        .check_endpoint(&Domain::new("example.com"))
        .await
        .unwrap();
    assert_eq!(endpoint.port, server.port());

    let commands = server.commands().await;
    assert!(commands.contains(&SmtpCommand::Noop));
    assert!(commands.contains(&SmtpCommand::Quit));

    assert!(matches!(
        engine.check_endpoint(&Domain::new("nowhere.example")).await,
        Err(DispatchError::Resolve(ResolveError::DomainNotFound(_)))
    ));

    server.shutdown();
}

#[test]
fn test_estimate() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir.path().join("progress.txt"));
    config.emails_per_hour = 100.0;

    let engine = engine(StaticZone::new().shared(), config);
    let estimate = engine.estimate(&engine.plan(recipients("example.com", 450)));

    assert_eq!(estimate.total_recipients, 450);
    assert_eq!(estimate.total_batches, 3);
    assert_eq!(estimate.batch_size, 200);
    assert_eq!(estimate.estimated_duration, Duration::from_secs(4 * 3600 + 1800));
}
