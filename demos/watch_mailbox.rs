//! Example: Watch a mailbox and forward codes to a webhook.
//!
//! Structured logs come from the `tracing` spans the crate emits; the status
//! events every component reports are printed alongside.
//!
//! # Usage
//!
//! ```bash
//! export EMAIL_ADDRESS="your@email.com"
//! export EMAIL_PASSWORD="your-app-password"
//! export IMAP_HOST="imap.example.com"
//! export CALLBACK_URL="https://hooks.example.com/codes"
//! # Set log level (trace, debug, info, warn, error)
//! export RUST_LOG=email_dispatch=debug
//!
//! cargo run --example watch_mailbox
//! ```
//!
//! Press Ctrl-C to stop.

use email_dispatch::{Engine, PatternRule, WatchConfig};
use std::env;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> email_dispatch::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("email_dispatch=info")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .init();

    let email = env::var("EMAIL_ADDRESS").expect("EMAIL_ADDRESS environment variable required");
    let password =
        env::var("EMAIL_PASSWORD").expect("EMAIL_PASSWORD environment variable required");
    let host = env::var("IMAP_HOST").expect("IMAP_HOST environment variable required");
    let callback = env::var("CALLBACK_URL").expect("CALLBACK_URL environment variable required");

    let config = WatchConfig::builder()
        .email(&email)
        .password(password)
        .imap_host(host)
        .rule(PatternRule::required("code", "[0-9]{6}"))
        .rule(PatternRule::optional("link", r"https://\S+"))
        .callback_url(callback)
        .build()?;

    tracing::info!(email = %email, "Starting watch");

    let mut engine = Engine::new();
    let mut events = engine.subscribe();
    engine.start(config).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("[{}] {}", event.msg_type, event.data),
                Err(RecvError::Lagged(missed)) => println!("... {missed} events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.stop().await?;
    tracing::info!("Watch stopped");

    Ok(())
}
