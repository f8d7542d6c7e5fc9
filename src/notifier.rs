//! Change notification via IMAP IDLE.
//!
//! [`ChangeNotifier::wait_for_change`] lends the connection to a background task
//! that idles on the server, and races three things against each other:
//!
//! - a mailbox `EXISTS` update arriving on the event queue,
//! - the IDLE wait ending on its own (deadline reached, server closed it, error),
//! - an external cancellation.
//!
//! The connection is handed back once the background task has finished, so only
//! one task ever talks to the server at a time. The event queue outlives a single
//! wait: updates received while the caller is busy fetching are kept, in order,
//! and returned by the next call. That includes updates the server attached to
//! other commands (a health check, a fetch, entering or leaving IDLE), which are
//! collected from [`Connection::take_unsolicited`] before every wait and after
//! every IDLE round.

use crate::error::{Error, Result};
use crate::events::{EventKind, EventSink};
use crate::session::{Connection, IdleEnd, MailboxEvent};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// The selected mailbox reported a new message count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSignal {
    /// Mailbox the update belongs to.
    pub mailbox_name: String,
    /// New `EXISTS` count.
    pub message_count: u32,
}

/// Result of one [`ChangeNotifier::wait_for_change`] call.
#[derive(Debug)]
pub enum NotifierOutcome {
    /// The mailbox changed.
    Change(ChangeSignal),
    /// The wait ended without a change.
    ///
    /// `None` means it simply expired; `Some` carries the failure. Either way the
    /// caller decides whether the connection is still usable.
    Ended(Option<Error>),
    /// Cancellation was requested. Nothing queued before it will be reported.
    Cancelled,
}

type IdleTask = JoinHandle<(Box<dyn Connection>, Result<IdleEnd>)>;

/// Waits for mailbox changes on a borrowed connection.
pub struct ChangeNotifier {
    tx: mpsc::Sender<MailboxEvent>,
    rx: mpsc::Receiver<MailboxEvent>,
    pending: VecDeque<MailboxEvent>,
    events: EventSink,
}

impl ChangeNotifier {
    /// Creates a notifier whose event queue holds up to `capacity` updates.
    #[must_use]
    pub fn new(capacity: usize, events: EventSink) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx,
            pending: VecDeque::new(),
            events,
        }
    }

    /// Drops every queued update, e.g. after reconnecting.
    pub fn reset(&mut self) {
        self.pending.clear();
        while self.rx.try_recv().is_ok() {}
    }

    /// Blocks until the mailbox changes, the IDLE wait ends or `cancel` fires.
    ///
    /// Returns the connection alongside the outcome. The connection is `None`
    /// only if the background task panicked.
    #[instrument(
        name = "notifier::wait_for_change",
        skip_all,
        fields(mailbox = %connection.mailbox().name, timeout_secs = timeout.as_secs())
    )]
    pub async fn wait_for_change(
        &mut self,
        mut connection: Box<dyn Connection>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> (Option<Box<dyn Connection>>, NotifierOutcome) {
        let mailbox_name = connection.mailbox().name.clone();

        if cancel.is_cancelled() {
            self.reset();
            return (Some(connection), NotifierOutcome::Cancelled);
        }

        self.collect_unsolicited(connection.as_mut());

        if let Some(count) = self.next_queued_change() {
            debug!(count, "Change already queued");
            return (Some(connection), self.change(mailbox_name, count));
        }

        if !connection.supports_idle() {
            return (
                Some(connection),
                NotifierOutcome::Ended(Some(Error::IdleNotSupported)),
            );
        }

        self.events
            .emit(EventKind::Idle, format!("Waiting for changes in {mailbox_name}"));

        let stop = cancel.child_token();
        let mut task = spawn_idle(connection, timeout, self.tx.clone(), stop.clone());

        let interrupted = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break None,
                Some(event) = self.rx.recv() => match event {
                    MailboxEvent::Exists(count) => break Some(count),
                    MailboxEvent::Other => debug!("Ignoring non-EXISTS update"),
                },
                joined = &mut task => return self.idle_finished(joined, mailbox_name),
            }
        };

        stop.cancel();
        let connection = self.join(task).await;

        match interrupted {
            None => {
                self.reset();
                self.events.emit(EventKind::Idle, "Stopped waiting");
                (connection, NotifierOutcome::Cancelled)
            }
            Some(count) => (connection, self.change(mailbox_name, count)),
        }
    }

    fn change(&self, mailbox_name: String, message_count: u32) -> NotifierOutcome {
        self.events.emit(
            EventKind::Idle,
            format!("Mailbox {mailbox_name} now has {message_count} messages"),
        );
        NotifierOutcome::Change(ChangeSignal {
            mailbox_name,
            message_count,
        })
    }

    /// Queues updates the connection received outside IDLE, after everything
    /// already queued.
    fn collect_unsolicited(&mut self, connection: &mut dyn Connection) {
        while let Ok(event) = self.rx.try_recv() {
            self.pending.push_back(event);
        }
        let unsolicited = connection.take_unsolicited();
        if !unsolicited.is_empty() {
            debug!(count = unsolicited.len(), "Queued unsolicited updates");
        }
        self.pending.extend(unsolicited);
    }

    /// Pops queued updates until an `EXISTS` is found.
    fn next_queued_change(&mut self) -> Option<u32> {
        while let Some(event) = self.pending.pop_front().or_else(|| self.rx.try_recv().ok()) {
            if let MailboxEvent::Exists(count) = event {
                return Some(count);
            }
        }
        None
    }

    /// Handles the IDLE task finishing on its own.
    fn idle_finished(
        &mut self,
        joined: std::result::Result<(Box<dyn Connection>, Result<IdleEnd>), tokio::task::JoinError>,
        mailbox_name: String,
    ) -> (Option<Box<dyn Connection>>, NotifierOutcome) {
        let (mut connection, result) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                warn!(error = %e, "IDLE task failed");
                self.events.emit(EventKind::Idle, "IDLE task failed");
                return (None, NotifierOutcome::Ended(Some(Error::ConnectionClosed)));
            }
        };

        // An update may have been queued just before the wait ended.
        self.collect_unsolicited(connection.as_mut());
        if let Some(count) = self.next_queued_change() {
            if let Err(e) = result {
                warn!(error = %e, "IDLE ended with error after an update");
            }
            return (Some(connection), self.change(mailbox_name, count));
        }

        let outcome = match result {
            Ok(end) => {
                debug!(?end, "IDLE ended");
                self.events.emit(EventKind::Idle, "IDLE wait ended");
                NotifierOutcome::Ended(None)
            }
            Err(e) => {
                warn!(error = %e, "IDLE failed");
                self.events.emit(EventKind::Idle, format!("IDLE failed: {e}"));
                NotifierOutcome::Ended(Some(e))
            }
        };
        (Some(connection), outcome)
    }

    /// Waits for a stopped IDLE task, keeping updates it still sends.
    async fn join(&mut self, mut task: IdleTask) -> Option<Box<dyn Connection>> {
        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok((mut connection, result)) => {
                            if let Err(e) = result {
                                warn!(error = %e, "IDLE did not stop cleanly");
                            }
                            self.collect_unsolicited(connection.as_mut());
                            Some(connection)
                        }
                        Err(e) => {
                            warn!(error = %e, "IDLE task failed");
                            None
                        }
                    };
                }
                Some(event) = self.rx.recv() => self.pending.push_back(event),
            }
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn spawn_idle(
    mut connection: Box<dyn Connection>,
    timeout: Duration,
    events: mpsc::Sender<MailboxEvent>,
    stop: CancellationToken,
) -> IdleTask {
    tokio::spawn(async move {
        let result = connection.idle(timeout, events, stop).await;
        (connection, result)
    })
}
