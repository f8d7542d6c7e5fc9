//! The watch loop.
//!
//! A [`WatchSession`] ties the session manager, change notifier, pipeline and
//! dispatcher together as a state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Idling <-> Fetching
//!                                 |           |
//!                                 +-> Reconnecting -> Idling
//!                                 |
//!                                 +-> Stopped
//! ```
//!
//! Each session owns its connection; nothing is shared between sessions except
//! the event sink. [`Engine`] is the start/stop control surface that keeps at most
//! one session running.

use crate::config::WatchConfig;
use crate::dispatcher::{Delivery, HttpDispatcher};
use crate::error::{Error, Result};
use crate::events::{EventKind, EventSink, WatchEvent};
use crate::extractor::Extractor;
use crate::notifier::{ChangeNotifier, NotifierOutcome};
use crate::pipeline;
use crate::session::{Connector, ImapConnector, SessionManager};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Where the watch loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchState {
    /// Not started, or between start and the first connect.
    Disconnected,
    /// Opening the first connection.
    Connecting,
    /// Waiting for a mailbox change.
    Idling,
    /// Processing a batch.
    Fetching,
    /// Replacing a lost connection.
    Reconnecting,
    /// Terminal.
    Stopped,
}

impl std::fmt::Display for WatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchState::Disconnected => write!(f, "disconnected"),
            WatchState::Connecting => write!(f, "connecting"),
            WatchState::Idling => write!(f, "idling"),
            WatchState::Fetching => write!(f, "fetching"),
            WatchState::Reconnecting => write!(f, "reconnecting"),
            WatchState::Stopped => write!(f, "stopped"),
        }
    }
}

enum Next {
    Idle,
    Fetch(u32),
    Reconnect,
    Stop,
}

/// One mailbox watch: a connection, a baseline message count and the
/// components acting on changes.
pub struct WatchSession {
    config: Arc<WatchConfig>,
    sessions: SessionManager,
    notifier: ChangeNotifier,
    extractor: Extractor,
    delivery: Arc<dyn Delivery>,
    events: EventSink,
    state: watch::Sender<WatchState>,
    baseline: u32,
}

impl WatchSession {
    /// Creates a session. Nothing connects until [`WatchSession::run`].
    #[must_use]
    pub fn new(
        config: Arc<WatchConfig>,
        connector: Arc<dyn Connector>,
        delivery: Arc<dyn Delivery>,
        events: EventSink,
    ) -> Self {
        let (state, _) = watch::channel(WatchState::Disconnected);
        Self {
            sessions: SessionManager::new(connector, config.clone(), events.clone()),
            notifier: ChangeNotifier::new(config.watch.event_queue, events.clone()),
            extractor: Extractor::new(&config.rules),
            config,
            delivery,
            events,
            state,
            baseline: 0,
        }
    }

    /// Creates a session talking IMAP over TLS and delivering over HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HttpClient`] if the HTTP client cannot be built.
    pub fn imap(config: WatchConfig, events: EventSink) -> Result<Self> {
        let delivery = HttpDispatcher::new(config.callback_url.clone(), config.timeouts.delivery)?;
        Ok(Self::new(
            Arc::new(config),
            Arc::new(ImapConnector),
            Arc::new(delivery),
            events,
        ))
    }

    /// Subscribes to state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<WatchState> {
        self.state.subscribe()
    }

    /// Runs the watch on a background task.
    #[must_use]
    pub fn spawn(self) -> WatchHandle {
        let cancel = CancellationToken::new();
        let state = self.subscribe_state();
        let task = tokio::spawn(self.run(cancel.clone()));

        WatchHandle {
            cancel,
            state,
            task: Some(task),
        }
    }

    /// Runs until `cancel` fires or the connection cannot be re-established.
    ///
    /// A stop request is observed while idling or backing off; a batch that is
    /// already being processed runs to completion first.
    ///
    /// # Errors
    ///
    /// Returns the last connect error when reconnecting gives up, or at once for
    /// errors that retrying cannot fix (such as rejected credentials).
    #[instrument(
        name = "watch::run",
        skip_all,
        fields(imap_host = %self.config.imap_host, mailbox = %self.config.folder)
    )]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        for error in self.extractor.invalid_rules() {
            warn!(error = %error, "Rule will never match");
            self.events.emit(EventKind::Extract, error_chain(error));
        }

        let mut next = self.connect(&cancel, WatchState::Connecting).await;
        let result = loop {
            next = match next {
                Ok(Next::Idle) => Ok(self.idle(&cancel).await),
                Ok(Next::Fetch(total)) => Ok(self.fetch(total).await),
                Ok(Next::Reconnect) => self.connect(&cancel, WatchState::Reconnecting).await,
                Ok(Next::Stop) => break Ok(()),
                Err(e) => break Err(e),
            };
        };

        self.sessions.close().await;
        self.set_state(WatchState::Stopped);

        match &result {
            Ok(()) => info!("Watch stopped"),
            Err(e) => {
                warn!(error = %e, "Watch terminated");
                self.events
                    .emit(EventKind::Watch, format!("Watch terminated: {e}"));
            }
        }
        result
    }

    fn set_state(&self, next: WatchState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            self.events.emit(EventKind::Watch, format!("State: {next}"));
        }
    }

    /// Connects with bounded exponential backoff.
    async fn connect(&mut self, cancel: &CancellationToken, phase: WatchState) -> Result<Next> {
        self.set_state(phase);
        let policy = self.config.reconnect.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Next::Stop),
                result = self.sessions.connect() => result,
            };

            match result {
                Ok(mailbox) => {
                    self.baseline = mailbox.message_count;
                    self.notifier.reset();
                    info!(baseline = self.baseline, "Connected");
                    return Ok(Next::Idle);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= policy.max_attempts => {
                    self.events.emit(
                        EventKind::Watch,
                        format!("Giving up after {attempt} connect attempts"),
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = policy.backoff(attempt);
                    warn!(error = %e, attempt, ?delay, "Connect failed, retrying");
                    self.events.emit(
                        EventKind::Watch,
                        format!("Retrying connect in {}s", delay.as_secs_f32()),
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Ok(Next::Stop),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn idle(&mut self, cancel: &CancellationToken) -> Next {
        self.set_state(WatchState::Idling);

        let Some(connection) = self.sessions.take() else {
            return Next::Reconnect;
        };

        let (connection, outcome) = self
            .notifier
            .wait_for_change(connection, self.config.watch.idle_timeout, cancel)
            .await;
        if let Some(connection) = connection {
            self.sessions.restore(connection);
        }

        match outcome {
            NotifierOutcome::Change(signal) if signal.message_count != self.baseline => {
                Next::Fetch(signal.message_count)
            }
            NotifierOutcome::Change(_) => Next::Idle,
            NotifierOutcome::Cancelled => Next::Stop,
            NotifierOutcome::Ended(Some(Error::IdleNotSupported)) => self.poll(cancel).await,
            NotifierOutcome::Ended(error) => {
                if let Some(e) = error {
                    warn!(error = %e, "Change notifier ended with error");
                }
                if self.sessions.health_check().await {
                    Next::Idle
                } else {
                    Next::Reconnect
                }
            }
        }
    }

    /// Fallback for servers without IDLE: sleep, then re-read the mailbox.
    async fn poll(&mut self, cancel: &CancellationToken) -> Next {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Next::Stop,
            () = tokio::time::sleep(self.config.watch.poll_interval) => {}
        }

        let Ok(connection) = self.sessions.connection_mut() else {
            return Next::Reconnect;
        };

        match connection.refresh().await {
            Ok(mailbox) if mailbox.message_count != self.baseline => {
                Next::Fetch(mailbox.message_count)
            }
            Ok(_) => Next::Idle,
            Err(e) => {
                warn!(error = %e, "Mailbox refresh failed");
                self.events
                    .emit(EventKind::Watch, format!("Mailbox refresh failed: {e}"));
                Next::Reconnect
            }
        }
    }

    async fn fetch(&mut self, total: u32) -> Next {
        self.set_state(WatchState::Fetching);
        self.baseline = total;

        let Ok(connection) = self.sessions.connection_mut() else {
            return Next::Reconnect;
        };

        let result = pipeline::process_batch(
            connection,
            total,
            self.config.watch.fetch_count,
            &self.extractor,
            self.delivery.as_ref(),
            &self.events,
        )
        .await;

        match result {
            Ok(summary) => {
                info!(%summary, "Batch processed");
                Next::Idle
            }
            Err(e) => {
                warn!(error = %e, "Fetch failed");
                self.events
                    .emit(EventKind::Fetch, format!("Fetch failed: {e}"));
                if e.is_transport() {
                    Next::Reconnect
                } else {
                    Next::Idle
                }
            }
        }
    }
}

impl std::fmt::Debug for WatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSession")
            .field("sessions", &self.sessions)
            .field("state", &*self.state.borrow())
            .field("baseline", &self.baseline)
            .finish_non_exhaustive()
    }
}

fn error_chain(error: &Error) -> String {
    let mut text = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Control handle for a spawned [`WatchSession`].
#[derive(Debug)]
pub struct WatchHandle {
    cancel: CancellationToken,
    state: watch::Receiver<WatchState>,
    task: Option<JoinHandle<Result<()>>>,
}

impl WatchHandle {
    /// Current state of the watch.
    #[must_use]
    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    /// Whether the watch task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the watch and waits for it to finish.
    ///
    /// The first call returns how the watch ended; later calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the error the watch terminated with, if it did not stop cleanly.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the watch to end on its own.
    ///
    /// # Errors
    ///
    /// Same as [`WatchHandle::stop`].
    pub async fn join(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|source| Error::WatchTask { source })?,
            None => Ok(()),
        }
    }
}

/// Start/stop control surface keeping at most one watch running.
///
/// ```no_run
/// use email_dispatch::{Engine, PatternRule, WatchConfig};
///
/// # async fn example() -> email_dispatch::Result<()> {
/// let mut engine = Engine::new();
/// let mut events = engine.subscribe();
///
/// let config = WatchConfig::builder()
///     .email("user@example.com")
///     .password("app-password")
///     .imap_host("imap.example.com")
///     .rule(PatternRule::required("code", "[0-9]{6}"))
///     .callback_url("https://hooks.example.com/codes")
///     .build()?;
///
/// engine.start(config).await?;
/// while let Ok(event) = events.recv().await {
///     println!("[{}] {}", event.msg_type, event.data);
/// }
/// engine.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    connector: Arc<dyn Connector>,
    events: EventSink,
    current: Option<WatchHandle>,
}

impl Engine {
    /// Creates an engine that connects over IMAP.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(ImapConnector), EventSink::default())
    }

    /// Creates an engine with a custom connector and event sink.
    #[must_use]
    pub fn with_connector(connector: Arc<dyn Connector>, events: EventSink) -> Self {
        Self {
            connector,
            events,
            current: None,
        }
    }

    /// Subscribes to events of every watch this engine runs.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Stops the running watch, if any, then starts one for `config` delivering
    /// over HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HttpClient`] if the HTTP client cannot be built.
    pub async fn start(&mut self, config: WatchConfig) -> Result<()> {
        let delivery =
            HttpDispatcher::new(config.callback_url.clone(), config.timeouts.delivery)?;
        self.start_with_delivery(config, Arc::new(delivery)).await;
        Ok(())
    }

    /// Like [`Engine::start`] with a custom delivery.
    pub async fn start_with_delivery(&mut self, config: WatchConfig, delivery: Arc<dyn Delivery>) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Previous watch ended with error");
        }

        let session = WatchSession::new(
            Arc::new(config),
            self.connector.clone(),
            delivery,
            self.events.clone(),
        );
        self.events.emit(EventKind::Watch, "Watch started");
        self.current = Some(session.spawn());
    }

    /// Stops the running watch. Safe to call at any time, any number of times.
    ///
    /// # Errors
    ///
    /// Returns the error the stopped watch terminated with.
    pub async fn stop(&mut self) -> Result<()> {
        match self.current.as_mut() {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    /// State of the latest watch; [`WatchState::Disconnected`] if none was started.
    #[must_use]
    pub fn state(&self) -> WatchState {
        self.current
            .as_ref()
            .map_or(WatchState::Disconnected, WatchHandle::state)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
