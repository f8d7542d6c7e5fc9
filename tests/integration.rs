//! Integration tests for email-dispatch.
//!
//! These tests require a real IMAP server and are disabled by default.
//! To run them:
//!
//! ```bash
//! # Set environment variables (or put them in a .env file)
//! export EMAIL_DISPATCH_TEST_EMAIL="your@email.com"
//! export EMAIL_DISPATCH_TEST_PASSWORD="your-app-password"
//! export EMAIL_DISPATCH_TEST_HOST="imap.example.com"
//!
//! # Optional
//! export EMAIL_DISPATCH_TEST_PORT="993"
//! export EMAIL_DISPATCH_TEST_FOLDER="INBOX"
//!
//! cargo test --test integration -- --ignored
//! ```

use email_dispatch::events::EventSink;
use email_dispatch::notifier::{ChangeNotifier, NotifierOutcome};
use email_dispatch::pipeline::{self, FetchedMessage};
use email_dispatch::session::SessionManager;
use email_dispatch::{
    Connection, Connector, Engine, ErrorCategory, ImapConnector, PatternRule, WatchConfig,
    WatchState,
};
use futures::StreamExt;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ─────────────────────────────────────────────────────────────────────────────
// Test Configuration Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn get_test_config() -> Option<WatchConfig> {
    dotenvy::dotenv().ok();
    let email = env::var("EMAIL_DISPATCH_TEST_EMAIL").ok()?;
    let password = env::var("EMAIL_DISPATCH_TEST_PASSWORD").ok()?;
    let host = env::var("EMAIL_DISPATCH_TEST_HOST").ok()?;

    let mut builder = WatchConfig::builder()
        .email(email)
        .password(password)
        .imap_host(host)
        .rule(PatternRule::optional("code", "[0-9]{6}"))
        .callback_url("http://127.0.0.1:9/hook")
        .idle_timeout(Duration::from_secs(5));

    if let Some(port) = env::var("EMAIL_DISPATCH_TEST_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
    {
        builder = builder.imap_port(port);
    }
    if let Ok(folder) = env::var("EMAIL_DISPATCH_TEST_FOLDER") {
        builder = builder.folder(folder);
    }

    builder.build().ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_connect_and_logout() {
    let config = get_test_config().expect("Test config from environment variables");

    let mut connection = ImapConnector
        .connect(&config)
        .await
        .expect("Failed to connect");

    assert_eq!(connection.mailbox().name, config.folder);

    connection.logout().await.expect("Failed to logout");
    connection.logout().await.expect("Second logout is a no-op");
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_health_check_is_repeatable() {
    let config = Arc::new(get_test_config().expect("Test config from environment variables"));
    let mut sessions = SessionManager::new(Arc::new(ImapConnector), config, EventSink::default());

    let mailbox = sessions.connect().await.expect("Failed to connect");
    println!("{} has {} messages", mailbox.name, mailbox.message_count);

    for _ in 0..3 {
        assert!(sessions.health_check().await);
    }
    assert!(sessions.is_connected());

    sessions.close().await;
    sessions.close().await;
    assert!(!sessions.is_connected());
    assert!(!sessions.health_check().await);
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_fetch_recent_messages() {
    let config = get_test_config().expect("Test config from environment variables");

    let mut connection = ImapConnector
        .connect(&config)
        .await
        .expect("Failed to connect");
    let total = connection.mailbox().message_count;

    let fetched: Vec<_> = pipeline::fetch_recent(connection.as_mut(), total, 5)
        .await
        .expect("Failed to fetch")
        .collect()
        .await;

    assert_eq!(fetched.len(), total.min(5) as usize);
    for item in fetched {
        match item.expect("transport error") {
            FetchedMessage::Decoded(message) => {
                println!("message {}: {} parts", message.seq, message.parts.len());
            }
            FetchedMessage::Undecodable { seq, error } => {
                println!("message {seq} undecodable: {error}");
            }
        }
    }

    connection.logout().await.expect("Failed to logout");
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifier and Watch Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_idle_wait_returns_connection() {
    let config = get_test_config().expect("Test config from environment variables");

    let connection = ImapConnector
        .connect(&config)
        .await
        .expect("Failed to connect");
    let mut notifier = ChangeNotifier::new(16, EventSink::default());

    let (connection, outcome) = notifier
        .wait_for_change(connection, Duration::from_secs(3), &CancellationToken::new())
        .await;

    match outcome {
        NotifierOutcome::Change(signal) => println!("mailbox changed: {signal:?}"),
        NotifierOutcome::Ended(error) => println!("wait ended: {error:?}"),
        NotifierOutcome::Cancelled => panic!("nobody cancelled"),
    }

    let mut connection = connection.expect("connection returned");
    connection.noop().await.expect("connection usable after IDLE");
    connection.logout().await.expect("Failed to logout");
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_engine_watch_starts_and_stops() {
    let config = get_test_config().expect("Test config from environment variables");
    let mut engine = Engine::new();

    engine.start(config).await.expect("Failed to start");

    tokio::time::timeout(Duration::from_secs(30), async {
        while engine.state() != WatchState::Idling {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("watch never reached Idling");

    engine.stop().await.expect("Failed to stop");
    engine.stop().await.expect("Second stop is a no-op");
    assert_eq!(engine.state(), WatchState::Stopped);
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Handling Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires intentionally wrong credentials"]
async fn test_invalid_credentials() {
    let base = get_test_config().expect("Test config from environment variables");
    let config = WatchConfig::builder()
        .email(base.email())
        .password("wrong-password")
        .imap_host(base.imap_host.clone())
        .imap_port(base.imap_port)
        .callback_url("http://127.0.0.1:9/hook")
        .build()
        .expect("valid config structure");

    let Err(err) = ImapConnector.connect(&config).await else {
        panic!("login must fail");
    };

    assert_eq!(err.category(), ErrorCategory::Authentication);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_invalid_email_format() {
    let result = WatchConfig::builder()
        .email("not-an-email")
        .password("password")
        .imap_host("imap.example.com")
        .callback_url("http://127.0.0.1:9/hook")
        .build();

    assert!(result.is_err());
}

#[tokio::test]
async fn test_missing_required_fields() {
    // Missing host
    let result = WatchConfig::builder()
        .email("test@example.com")
        .password("password")
        .callback_url("http://127.0.0.1:9/hook")
        .build();
    assert!(result.is_err());

    // Missing callback
    let result = WatchConfig::builder()
        .email("test@example.com")
        .password("password")
        .imap_host("imap.example.com")
        .build();
    assert!(result.is_err());
}
