//! Mail server sessions.
//!
//! The watch loop talks to the mail server only through two seams:
//!
//! - [`Connector`] opens an authenticated, mailbox-selected [`Connection`].
//! - [`Connection`] is that live session: health check, IDLE, fetch, logout.
//!
//! [`ImapConnector`] implements both on top of `async-imap` over rustls.
//! [`SessionManager`] owns the single live connection of a watch and applies the
//! "close the old one before opening a new one" rule.

use crate::config::{TimeoutConfig, WatchConfig};
use crate::connection::{self, TlsStream};
use crate::error::{Error, Result};
use crate::events::{EventKind, EventSink};
use crate::pipeline::SequenceRange;
use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::UnsolicitedResponse;
use async_imap::Session;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Type alias for IMAP session over TLS.
pub(crate) type ImapSession = Session<TlsStream>;

/// Snapshot of the selected mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxState {
    /// Mailbox name.
    pub name: String,
    /// Number of messages (the `EXISTS` count).
    pub message_count: u32,
}

/// Unsolicited server data, received while idling or alongside another reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxEvent {
    /// The mailbox now holds this many messages.
    Exists(u32),
    /// Any other server data (flag changes, expunges, recent counts).
    Other,
}

/// Why an IDLE wait returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEnd {
    /// The wait reached its deadline or the server ended it.
    Timeout,
    /// The caller asked the wait to stop.
    Stopped,
}

/// A fetched message before MIME decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Sequence number within the mailbox.
    pub seq: u32,
    /// Full `BODY[]` section, if the server returned one.
    pub body: Option<Vec<u8>>,
}

/// A live, authenticated session with one mailbox selected.
#[async_trait]
pub trait Connection: Send {
    /// Last known state of the selected mailbox.
    fn mailbox(&self) -> &MailboxState;

    /// Whether the server advertised IDLE at login.
    fn supports_idle(&self) -> bool;

    /// Lightweight liveness probe. Does not change mailbox state.
    async fn noop(&mut self) -> Result<()>;

    /// Drains mailbox updates the server sent outside an IDLE wait.
    ///
    /// Servers may report new mail alongside the reply to any command (NOOP,
    /// FETCH, entering or leaving IDLE). Connections that cannot see such data
    /// report nothing.
    fn take_unsolicited(&mut self) -> Vec<MailboxEvent> {
        Vec::new()
    }

    /// Re-reads the mailbox state from the server.
    async fn refresh(&mut self) -> Result<MailboxState>;

    /// Idles until `timeout` elapses, the server ends the wait, or `stop` fires.
    ///
    /// Every piece of unsolicited data is forwarded on `events` while waiting.
    async fn idle(
        &mut self,
        timeout: Duration,
        events: mpsc::Sender<MailboxEvent>,
        stop: CancellationToken,
    ) -> Result<IdleEnd>;

    /// Fetches the full body of every message in `range`, in sequence order.
    ///
    /// An `Err` from the stream means the transport failed mid-batch.
    async fn fetch<'a>(
        &'a mut self,
        range: SequenceRange,
    ) -> Result<BoxStream<'a, Result<RawMessage>>>;

    /// Logs out. Safe to call more than once.
    async fn logout(&mut self) -> Result<()>;
}

/// Opens connections for a watch.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects, authenticates and selects `config.folder`.
    async fn connect(&self, config: &WatchConfig) -> Result<Box<dyn Connection>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// async-imap implementation
// ─────────────────────────────────────────────────────────────────────────────

/// [`Connector`] for IMAP over TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

#[async_trait]
impl Connector for ImapConnector {
    #[instrument(
        name = "session::connect",
        skip_all,
        fields(
            email = %config.email(),
            imap_host = %config.imap_host,
            mailbox = %config.folder
        )
    )]
    async fn connect(&self, config: &WatchConfig) -> Result<Box<dyn Connection>> {
        let target_addr = config.server_address();
        let timeouts = &config.timeouts;

        let tls_stream = tokio::time::timeout(
            timeouts.connect,
            connection::establish_tls_connection(&config.imap_host, &target_addr),
        )
        .await
        .map_err(|_| Error::ConnectTimeout {
            target: target_addr.clone(),
            timeout: timeouts.connect,
        })??;

        debug!("TLS connection established");

        let mut session = tokio::time::timeout(
            timeouts.auth,
            authenticate(tls_stream, config.email(), config.password()),
        )
        .await
        .map_err(|_| Error::AuthTimeout {
            email: config.email().to_string(),
            timeout: timeouts.auth,
        })??;

        debug!("Authenticated");

        let capabilities = session
            .capabilities()
            .await
            .map_err(|source| Error::ImapCapabilities { source })?;
        let idle_supported = capabilities.has_str("IDLE");

        let mailbox = select_mailbox(&mut session, &config.folder, timeouts.select).await?;

        debug!(
            message_count = mailbox.message_count,
            idle_supported, "Selected mailbox"
        );

        Ok(Box::new(ImapConnection {
            session: Some(session),
            mailbox,
            idle_supported,
            timeouts: timeouts.clone(),
        }))
    }
}

/// Authenticates to IMAP server and returns a session.
async fn authenticate(tls_stream: TlsStream, email: &str, password: &str) -> Result<ImapSession> {
    let client = async_imap::Client::new(tls_stream);

    client
        .login(email, password)
        .await
        .map_err(|e| login_error(email, e.0))
}

/// Separates a dropped connection from a refused login.
fn login_error(email: &str, source: async_imap::error::Error) -> Error {
    match source {
        async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost => {
            Error::LoginConnectionLost {
                email: email.to_string(),
                source,
            }
        }
        source => Error::ImapLogin {
            email: email.to_string(),
            source,
        },
    }
}

/// Selects a mailbox and returns its state.
#[instrument(name = "session::select", skip(session, timeout))]
async fn select_mailbox(
    session: &mut ImapSession,
    mailbox: &str,
    timeout: Duration,
) -> Result<MailboxState> {
    let selected = tokio::time::timeout(timeout, session.select(mailbox))
        .await
        .map_err(|_| Error::SelectTimeout {
            mailbox: mailbox.to_string(),
            timeout,
        })?
        .map_err(|source| Error::SelectMailbox {
            mailbox: mailbox.to_string(),
            source,
        })?;

    Ok(MailboxState {
        name: mailbox.to_string(),
        message_count: selected.exists,
    })
}

/// [`Connection`] backed by an `async-imap` session.
///
/// The session is `None` once it has been logged out or lost during IDLE.
pub struct ImapConnection {
    session: Option<ImapSession>,
    mailbox: MailboxState,
    idle_supported: bool,
    timeouts: TimeoutConfig,
}

impl ImapConnection {
    fn session(&mut self) -> Result<&mut ImapSession> {
        self.session.as_mut().ok_or(Error::ConnectionClosed)
    }
}

impl std::fmt::Debug for ImapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConnection")
            .field("open", &self.session.is_some())
            .field("mailbox", &self.mailbox)
            .field("idle_supported", &self.idle_supported)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for ImapConnection {
    fn mailbox(&self) -> &MailboxState {
        &self.mailbox
    }

    fn supports_idle(&self) -> bool {
        self.idle_supported
    }

    async fn noop(&mut self) -> Result<()> {
        let timeout = self.timeouts.health;
        let session = self.session()?;

        tokio::time::timeout(timeout, session.noop())
            .await
            .map_err(|_| Error::HealthTimeout { timeout })?
            .map_err(|source| Error::ImapNoop { source })
    }

    fn take_unsolicited(&mut self) -> Vec<MailboxEvent> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };

        let mut drained = Vec::new();
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            let event = match response {
                UnsolicitedResponse::Exists(count) => MailboxEvent::Exists(count),
                _ => MailboxEvent::Other,
            };
            debug!(?event, "Unsolicited data received");
            drained.push(event);
        }
        drained
    }

    async fn refresh(&mut self) -> Result<MailboxState> {
        let timeout = self.timeouts.select;
        let name = self.mailbox.name.clone();
        let session = self.session()?;

        let state = select_mailbox(session, &name, timeout).await?;
        // The fresh count supersedes anything reported before the SELECT.
        while session.unsolicited_responses.try_recv().is_ok() {}
        self.mailbox = state.clone();
        Ok(state)
    }

    #[instrument(name = "session::idle", skip_all, fields(mailbox = %self.mailbox.name))]
    async fn idle(
        &mut self,
        timeout: Duration,
        events: mpsc::Sender<MailboxEvent>,
        stop: CancellationToken,
    ) -> Result<IdleEnd> {
        if !self.idle_supported {
            return Err(Error::IdleNotSupported);
        }

        let session = self.session.take().ok_or(Error::ConnectionClosed)?;
        let mut handle = session.idle();

        // A failed IDLE start leaves the session in an unknown state; drop it.
        handle
            .init()
            .await
            .map_err(|source| Error::ImapIdle { source })?;

        debug!(timeout_secs = timeout.as_secs(), "IDLE started");

        let deadline = Instant::now() + timeout;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Ok(IdleEnd::Timeout);
            }

            let (wait, _interrupt) = handle.wait_with_timeout(remaining);
            let response = tokio::select! {
                biased;
                () = stop.cancelled() => None,
                response = wait => Some(response),
            };

            match response {
                None | Some(Ok(IdleResponse::ManualInterrupt)) => break Ok(IdleEnd::Stopped),
                Some(Ok(IdleResponse::Timeout)) => break Ok(IdleEnd::Timeout),
                Some(Ok(IdleResponse::NewData(data))) => {
                    let event = match data.parsed() {
                        Response::MailboxData(MailboxDatum::Exists(count)) => {
                            MailboxEvent::Exists(*count)
                        }
                        _ => MailboxEvent::Other,
                    };
                    debug!(?event, "IDLE data received");
                    if events.send(event).await.is_err() {
                        break Ok(IdleEnd::Stopped);
                    }
                }
                Some(Err(source)) => break Err(Error::ImapIdle { source }),
            }
        };

        match handle.done().await {
            Ok(session) => {
                self.session = Some(session);
                outcome
            }
            Err(source) => {
                warn!(error = %source, "Failed to leave IDLE, session dropped");
                outcome.and(Err(Error::ImapIdle { source }))
            }
        }
    }

    #[instrument(name = "session::fetch", skip_all, fields(range = %range))]
    async fn fetch<'a>(
        &'a mut self,
        range: SequenceRange,
    ) -> Result<BoxStream<'a, Result<RawMessage>>> {
        let timeout = self.timeouts.fetch;
        let range_str = range.to_string();
        let session = self.session()?;

        debug!("Fetching messages");

        let stream = tokio::time::timeout(timeout, session.fetch(range_str.clone(), "BODY[]"))
            .await
            .map_err(|_| Error::FetchTimeout {
                range: range_str.clone(),
                timeout,
            })?
            .map_err(|source| Error::ImapFetch {
                range: range_str,
                source,
            })?;

        Ok(stream
            .map(|item| {
                item.map(|fetch| RawMessage {
                    seq: fetch.message,
                    body: fetch.body().map(<[u8]>::to_vec),
                })
                .map_err(|source| Error::FetchMessage { source })
            })
            .boxed())
    }

    #[instrument(name = "session::logout", skip(self))]
    async fn logout(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let timeout = self.timeouts.logout;
        tokio::time::timeout(timeout, session.logout())
            .await
            .map_err(|_| Error::LogoutTimeout { timeout })?
            .map_err(|source| Error::ImapLogout { source })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session manager
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the single live [`Connection`] of a watch.
///
/// Authentication and network failures are returned to the caller; the retry
/// policy belongs to the watch loop.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    config: Arc<WatchConfig>,
    events: EventSink,
    connection: Option<Box<dyn Connection>>,
}

impl SessionManager {
    /// Creates a manager without an open connection.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: Arc<WatchConfig>, events: EventSink) -> Self {
        Self {
            connector,
            config,
            events,
            connection: None,
        }
    }

    /// Closes any open connection, then connects, authenticates and selects the folder.
    ///
    /// # Errors
    ///
    /// Returns the connector's error; the previous connection is closed either way.
    pub async fn connect(&mut self) -> Result<MailboxState> {
        self.close().await;

        self.events.emit(
            EventKind::Login,
            format!("Connecting to {} ...", self.config.server_address()),
        );

        let connection = match self.connector.connect(&self.config).await {
            Ok(connection) => connection,
            Err(e) => {
                self.events
                    .emit(EventKind::Login, format!("Connect failed: {e}"));
                return Err(e);
            }
        };

        let mailbox = connection.mailbox().clone();
        self.events.emit(
            EventKind::Login,
            format!(
                "Logged in, mailbox {} has {} messages",
                mailbox.name, mailbox.message_count
            ),
        );
        if !connection.supports_idle() {
            self.events
                .emit(EventKind::Login, "Server does not support IMAP IDLE");
        }

        self.connection = Some(connection);
        Ok(mailbox)
    }

    /// Returns `false` when the connection is missing or does not answer NOOP.
    #[instrument(name = "session::health_check", skip(self))]
    pub async fn health_check(&mut self) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };

        match connection.noop().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Health check failed");
                self.events
                    .emit(EventKind::Login, format!("Health check failed: {e}"));
                false
            }
        }
    }

    /// Logs out and forgets the connection. Safe to call in any state.
    pub async fn close(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        match connection.logout().await {
            Ok(()) => self.events.emit(EventKind::Login, "Logged out"),
            Err(e) => {
                warn!(error = %e, "Logout failed");
                self.events
                    .emit(EventKind::Login, format!("Logout failed: {e}"));
            }
        }
    }

    /// Whether a connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Mutable access to the live connection.
    pub(crate) fn connection_mut(&mut self) -> Result<&mut (dyn Connection + 'static)> {
        self.connection.as_deref_mut().ok_or(Error::ConnectionClosed)
    }

    /// Lends the connection out, e.g. to a background IDLE task.
    pub(crate) fn take(&mut self) -> Option<Box<dyn Connection>> {
        self.connection.take()
    }

    /// Returns a lent connection.
    pub(crate) fn restore(&mut self, connection: Box<dyn Connection>) {
        self.connection = Some(connection);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("server", &self.config.server_address())
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}
