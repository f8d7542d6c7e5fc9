//! # email-dispatch
//!
//! Watches an IMAP mailbox, extracts values from new mail with ordered pattern
//! rules and forwards them as JSON to an HTTP callback.
//!
//! This crate provides:
//! - A watch loop that idles on the server (IMAP IDLE, with a polling fallback)
//!   and reconnects with bounded backoff
//! - Fetching and MIME-decoding of the most recent messages
//! - Regex extraction with required rules that veto a message
//! - At-most-once delivery to a callback URL
//! - A lossy broadcast stream of human-readable status events
//!
//! ## Quick Start
//!
//! ```no_run
//! use email_dispatch::{Engine, PatternRule, WatchConfig};
//!
//! # async fn example() -> email_dispatch::Result<()> {
//! let config = WatchConfig::builder()
//!     .email("user@example.com")
//!     .password("app-password")
//!     .imap_host("imap.example.com")
//!     .rule(PatternRule::required("code", "[0-9]{6}"))
//!     .rule(PatternRule::optional("link", r"https://\S+"))
//!     .callback_url("https://hooks.example.com/codes")
//!     .build()?;
//!
//! let mut engine = Engine::new();
//! let mut events = engine.subscribe();
//! engine.start(config).await?;
//!
//! // Every new message matching the rules is POSTed as
//! // {"params":[{"name":"code","value":["482913"]},{"name":"link","value":[]}]}
//! while let Ok(event) = events.recv().await {
//!     println!("[{}] {}", event.msg_type, event.data);
//! }
//!
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Documents
//!
//! ```
//! use email_dispatch::WatchConfig;
//!
//! let config = WatchConfig::from_json(r#"{
//!     "emailSettings": {
//!         "imapAddress": "imap.example.com",
//!         "imapPort": 993,
//!         "email": "user@example.com",
//!         "password": "secret",
//!         "folder": "INBOX"
//!     },
//!     "contentPatterns": [{"param": "code", "regex": "[0-9]{6}", "require": true}],
//!     "callbackUrl": "https://hooks.example.com/codes"
//! }"#).unwrap();
//!
//! assert_eq!(config.rules[0].param_name, "code");
//! ```
//!
//! ## Error Handling
//!
//! All errors implement `std::error::Error` and provide context. Use
//! [`Error::is_retryable`] to tell transient failures from permanent ones, and
//! [`Error::is_transport`] to tell whether the mail connection is gone:
//!
//! ```
//! use email_dispatch::Error;
//!
//! fn handle_error(error: &Error) {
//!     if error.is_transport() {
//!         println!("Connection lost, reconnecting: {}", error);
//!     } else if error.is_retryable() {
//!         println!("Transient error, can retry: {}", error);
//!     } else {
//!         println!("Permanent error ({}): {}", error.category(), error);
//!     }
//! }
//! ```
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation. Network operations emit spans
//! with structured fields; status lines also go to the [`EventSink`].
//!
//! ### Span Naming Convention
//!
//! - `watch::run` - The watch loop
//! - `session::connect` - Connect, login and select
//! - `session::health_check` - NOOP probe
//! - `notifier::wait_for_change` - One IDLE wait
//! - `pipeline::process_batch` - Fetch, extract and deliver a batch
//! - `dispatcher::deliver` - Callback POST
//! - `connection::establish_tls` - TLS connection
//!
//! ### Standard Fields
//!
//! - `email` - Email address
//! - `imap_host` - IMAP server hostname
//! - `mailbox` - Selected folder
//! - `range` - Fetched sequence range
//! - `endpoint` - Callback URL

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod extractor;
pub mod notifier;
pub mod pipeline;
pub mod session;
pub mod watch;

// Internal modules
mod connection;

// Re-exports for ergonomic API
pub use config::{
    PatternRule, ReconnectPolicy, ServiceConfig, TimeoutConfig, WatchConfig, WatchConfigBuilder,
    WatchSettings,
};
pub use dispatcher::{Delivery, DeliveryOutcome, HttpDispatcher};
pub use error::{Error, ErrorCategory, Result};
pub use events::{EventKind, EventSink, WatchEvent};
pub use extractor::{ExtractedParam, Extraction, ExtractionResult, Extractor};
pub use session::{Connection, Connector, ImapConnector};
pub use watch::{Engine, WatchHandle, WatchSession, WatchState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_accessible() {
        let _ = WatchConfig::builder();
        let _ = EventSink::default();
        let _ = Extractor::new(&[PatternRule::required("code", "[0-9]{6}")]);
    }
}
