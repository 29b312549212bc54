//! The mailbox watcher: connection lifecycle and change reactions.

use crate::config::{WatchOptions, WatcherConfig};
use crate::error::Error;
use crate::event::{self, EventSink, Events, MailEvent};
use crate::inflight::InFlight;
use crate::mailbox::{Connection, Connector, MailboxSession, SessionSignal, SignalReceiver};
use crate::pipeline::Pipeline;
use crate::session::ImapConnector;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Watches one mailbox and reports new mail as [`MailEvent`]s.
///
/// Events are delivered through the [`Events`] receiver returned by the
/// constructor. Dropping a running watcher shuts it down in the background;
/// call [`MailWatcher::stop`] to wait for the shutdown to finish.
///
/// # Example
///
/// ```no_run
/// use mail_watcher::{MailEvent, MailWatcher, WatcherConfig};
///
/// # async fn example() -> mail_watcher::Result<()> {
/// let config = WatcherConfig::builder()
///     .host("imap.example.com")
///     .username("user@example.com")
///     .password("app-password")
///     .fetch_unread_on_start(true)
///     .build()?;
///
/// let (mut watcher, mut events) = MailWatcher::new(config);
/// watcher.start();
///
/// while let Some(event) = events.recv().await {
///     match event {
///         MailEvent::Mail { uid, message } => {
///             println!("{uid}: {:?}", message.subject);
///         }
///         MailEvent::Disconnected => break,
///         _ => {}
///     }
/// }
///
/// watcher.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct MailWatcher<C: Connector = ImapConnector> {
    connector: Arc<C>,
    options: Arc<WatchOptions>,
    in_flight: InFlight,
    sink: EventSink,
    running: Option<Running>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MailWatcher<ImapConnector> {
    /// Creates an IMAP watcher and its event receiver. Nothing connects until [`start`](Self::start).
    #[must_use]
    pub fn new(config: WatcherConfig) -> (Self, Events) {
        Self::with_connector(ImapConnector::new(config.connection), config.watch)
    }
}

impl<C: Connector> MailWatcher<C> {
    /// Creates a watcher over a custom [`Connector`].
    #[must_use]
    pub fn with_connector(connector: C, options: WatchOptions) -> (Self, Events) {
        let (sink, events) = event::channel();
        let watcher = Self {
            connector: Arc::new(connector),
            options: Arc::new(options),
            in_flight: InFlight::new(),
            sink,
            running: None,
        };
        (watcher, events)
    }

    /// Connects and starts watching in a background task.
    ///
    /// Must be called from within a Tokio runtime; otherwise an
    /// [`Error::NoRuntime`] event is emitted. Calling it while already
    /// running does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Watcher already running, ignoring start");
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Watcher started outside of a Tokio runtime");
            self.sink.error(Error::NoRuntime);
            return;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let lifecycle = Lifecycle {
            connector: Arc::clone(&self.connector),
            options: Arc::clone(&self.options),
            in_flight: self.in_flight.clone(),
            sink: self.sink.clone(),
            shutdown: shutdown_rx,
        };

        self.running = Some(Running {
            shutdown: shutdown_tx,
            task: handle.spawn(lifecycle.run()),
        });
    }

    /// Stops watching: cancels running fetches, closes the connection and
    /// waits until [`MailEvent::Disconnected`] has been emitted.
    ///
    /// The watcher may be started again afterwards.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("Watcher not running, nothing to stop");
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            if e.is_panic() {
                warn!(error = %e, "Watcher task panicked");
            }
        }
    }

    /// Whether the background task is alive.
    ///
    /// Turns `false` on its own once the server closes the connection.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Identifiers currently being fetched.
    #[must_use]
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// The watch options in use.
    #[must_use]
    pub fn options(&self) -> &WatchOptions {
        &self.options
    }
}

impl<C: Connector> Drop for MailWatcher<C> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            if !running.task.is_finished() {
                debug!("Watcher dropped while running, shutting down in background");
            }
            let _ = running.shutdown.send(true);
        }
    }
}

impl<C: Connector> std::fmt::Debug for MailWatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailWatcher")
            .field("mailbox", &self.options.mailbox)
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// State owned by the background task.
struct Lifecycle<C> {
    connector: Arc<C>,
    options: Arc<WatchOptions>,
    in_flight: InFlight,
    sink: EventSink,
    shutdown: watch::Receiver<bool>,
}

impl<C: Connector> Lifecycle<C> {
    #[instrument(
        name = "MailWatcher::run",
        skip_all,
        fields(mailbox = %self.options.mailbox, read_only = self.options.read_only())
    )]
    async fn run(mut self) {
        let connected = tokio::select! {
            result = self.connector.connect() => result,
            () = shutdown_requested(&mut self.shutdown) => {
                debug!("Stopped before the connection was established");
                return;
            }
        };

        let Connection { session, signals } = match connected {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Connection failed");
                self.sink.error(e);
                return;
            }
        };

        let session = Arc::new(session);
        let pipeline = Pipeline::new(
            Arc::clone(&session),
            Arc::clone(&self.options),
            self.in_flight.clone(),
            self.sink.clone(),
        );

        let opened = match session
            .open_mailbox(&self.options.mailbox, self.options.read_only())
            .await
        {
            Ok(info) => {
                info!(exists = info.exists, "Mailbox opened, watching");
                self.sink.emit(MailEvent::Connected);
                self.sink.emit(MailEvent::Mailbox(info));
                if self.options.fetch_unread_on_start {
                    pipeline.run_cycle().await;
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to open mailbox");
                self.sink.error(e);
                false
            }
        };

        self.watch(&session, &pipeline, signals, opened).await;
    }

    /// Reacts to signals until shutdown or until the connection closes.
    async fn watch(
        &mut self,
        session: &C::Session,
        pipeline: &Pipeline<C::Session>,
        mut signals: SignalReceiver,
        opened: bool,
    ) {
        loop {
            tokio::select! {
                () = shutdown_requested(&mut self.shutdown) => {
                    debug!("Shutdown requested");
                    pipeline.cancel().await;
                    if let Err(e) = session.close().await {
                        warn!(error = %e, "Failed to close session");
                        self.sink.error(e);
                    }
                    info!("Watcher stopped");
                    self.sink.emit(MailEvent::Disconnected);
                    return;
                }
                signal = signals.recv() => match signal {
                    Some(SessionSignal::NewMail | SessionSignal::FlagsUpdated) if opened => {
                        pipeline.run_cycle().await;
                    }
                    Some(SessionSignal::NewMail | SessionSignal::FlagsUpdated) => {
                        debug!("Ignoring change, mailbox not open");
                    }
                    Some(SessionSignal::Error(e)) => {
                        warn!(error = %e, "Session error");
                        self.sink.error(e);
                    }
                    None => {
                        info!("Connection closed by server");
                        pipeline.detach();
                        self.sink.emit(MailEvent::Disconnected);
                        return;
                    }
                },
            }
        }
    }
}

/// Resolves once shutdown is requested or the watcher is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
