//! IMAP implementation of the mailbox session.
//!
//! An async-imap session allows one command at a time, but the watcher
//! fetches from many tasks at once. The session is therefore owned by a
//! driver task that executes commands sent over a channel in arrival order.
//! Between commands, once a mailbox is open, the driver waits for server
//! pushes with IDLE (or NOOP polling when the server lacks IDLE) and turns
//! unsolicited `EXISTS` / `FETCH` responses into [`SessionSignal`]s.

use crate::config::{ConnectionConfig, Credentials, IdleConfig};
use crate::connection::{self, ImapStream};
use crate::error::{Error, Result};
use crate::mailbox::{Connection, Connector, MailboxInfo, MailboxSession, SessionSignal, Uid};
use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::UnsolicitedResponse;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

/// Type alias for IMAP session over TLS or plain TCP.
pub(crate) type ImapSession = async_imap::Session<ImapStream>;

/// Commands queued before the driver applies backpressure.
const COMMAND_QUEUE: usize = 64;

/// Production [`Connector`] for IMAP servers.
///
/// # Example
///
/// ```no_run
/// use mail_watcher::{ImapConnector, WatcherConfig};
/// use mail_watcher::mailbox::{Connector, MailboxSession};
///
/// # async fn example() -> mail_watcher::Result<()> {
/// let config = WatcherConfig::builder()
///     .host("imap.example.com")
///     .username("user@example.com")
///     .password("app-password")
///     .build()?;
///
/// let connector = ImapConnector::new(config.connection);
/// let connection = connector.connect().await?;
/// let info = connection.session.open_mailbox("INBOX", true).await?;
/// println!("{} messages", info.exists);
/// connection.session.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: Arc<ConnectionConfig>,
}

impl ImapConnector {
    /// Creates a connector for the given server.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The connection parameters in use.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl Connector for ImapConnector {
    type Session = ImapMailbox;

    #[instrument(
        name = "ImapConnector::connect",
        skip_all,
        fields(
            username = %self.config.username,
            imap_host = %self.config.host,
            tls = self.config.tls
        )
    )]
    async fn connect(&self) -> Result<Connection<ImapMailbox>> {
        let config = &self.config;
        let target_addr = config.server_address();
        let timeouts = &config.timeouts;

        let stream = tokio::time::timeout(
            timeouts.connect,
            connection::establish(&config.host, &target_addr, config.tls),
        )
        .await
        .map_err(|_| Error::ConnectTimeout {
            target: target_addr.clone(),
            timeout: timeouts.connect,
        })??;

        debug!("Connection established");

        let mut session = tokio::time::timeout(
            timeouts.auth,
            authenticate(stream, &config.username, &config.credentials),
        )
        .await
        .map_err(|_| Error::AuthTimeout {
            username: config.username.clone(),
            timeout: timeouts.auth,
        })??;

        debug!("Authenticated");

        let idle_supported = session
            .capabilities()
            .await
            .map_err(|source| Error::ImapCapabilities { source })?
            .has_str("IDLE");

        if !idle_supported {
            warn!(
                poll_interval_secs = config.idle.poll_interval.as_secs(),
                "Server lacks IDLE, falling back to NOOP polling"
            );
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            commands: commands_rx,
            signals: signals_tx,
            idle: config.idle.clone(),
            idle_supported,
            selected: false,
        };
        tokio::spawn(driver.run(session));

        Ok(Connection {
            session: ImapMailbox {
                commands: commands_tx,
                logout_timeout: timeouts.logout,
            },
            signals: signals_rx,
        })
    }
}

/// Handle to a connected IMAP session. Cheap to clone; all clones share the connection.
#[derive(Debug, Clone)]
pub struct ImapMailbox {
    commands: mpsc::Sender<Command>,
    logout_timeout: Duration,
}

impl ImapMailbox {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)?
    }
}

impl MailboxSession for ImapMailbox {
    async fn open_mailbox(&self, name: &str, read_only: bool) -> Result<MailboxInfo> {
        self.request(|reply| Command::Open {
            name: name.to_string(),
            read_only,
            reply,
        })
        .await
    }

    async fn search(&self, criteria: &[String]) -> Result<Vec<Uid>> {
        self.request(|reply| Command::Search {
            criteria: criteria.join(" "),
            reply,
        })
        .await
    }

    async fn fetch_body(&self, uid: Uid, mark_seen: bool) -> Result<Vec<u8>> {
        self.request(|reply| Command::Fetch {
            uid,
            mark_seen,
            reply,
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let timeout = self.logout_timeout;
        tokio::time::timeout(timeout, self.request(|reply| Command::Logout { reply }))
            .await
            .map_err(|_| Error::LogoutTimeout { timeout })?
    }
}

enum Command {
    Open {
        name: String,
        read_only: bool,
        reply: oneshot::Sender<Result<MailboxInfo>>,
    },
    Search {
        criteria: String,
        reply: oneshot::Sender<Result<Vec<Uid>>>,
    },
    Fetch {
        uid: Uid,
        mark_seen: bool,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Logout {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Why the driver stopped waiting.
enum Wake {
    Command(Command),
    /// Every [`ImapMailbox`] handle is gone.
    HandlesDropped,
    /// The server sent data or the wait timed out.
    Server,
}

enum Flow {
    Continue,
    Stop,
}

struct Driver {
    commands: mpsc::Receiver<Command>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    idle: IdleConfig,
    idle_supported: bool,
    selected: bool,
}

impl Driver {
    async fn run(mut self, mut session: ImapSession) {
        loop {
            let wake = if let Some(wake) = self.queued_command() {
                wake
            } else if !self.selected {
                self.next_command().await
            } else if self.idle_supported {
                match self.idle(session).await {
                    Ok((returned, wake)) => {
                        session = returned;
                        wake
                    }
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                }
            } else {
                match self.poll(&mut session).await {
                    Ok(wake) => wake,
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                }
            };

            match wake {
                Wake::Server => {}
                Wake::HandlesDropped => {
                    debug!("All session handles dropped, logging out");
                    if let Err(e) = session.logout().await {
                        debug!(error = %e, "Logout after drop failed");
                    }
                    return;
                }
                Wake::Command(command) => {
                    if let Flow::Stop = self.execute(&mut session, command).await {
                        return;
                    }
                }
            }

            self.drain_unsolicited(&session);
        }
    }

    /// A command that is already waiting, so it runs without entering IDLE.
    fn queued_command(&mut self) -> Option<Wake> {
        match self.commands.try_recv() {
            Ok(command) => Some(Wake::Command(command)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Wake::HandlesDropped),
        }
    }

    async fn next_command(&mut self) -> Wake {
        self.commands
            .recv()
            .await
            .map_or(Wake::HandlesDropped, Wake::Command)
    }

    async fn execute(&mut self, session: &mut ImapSession, command: Command) -> Flow {
        match command {
            Command::Open {
                name,
                read_only,
                reply,
            } => {
                let result = open_mailbox(session, &name, read_only).await;
                if result.is_ok() {
                    self.selected = true;
                    // Responses queued while opening describe the initial state
                    while session.unsolicited_responses.try_recv().is_ok() {}
                }
                respond(reply, result)
            }
            Command::Search { criteria, reply } => {
                respond(reply, search(session, &criteria).await)
            }
            Command::Fetch {
                uid,
                mark_seen,
                reply,
            } => respond(reply, fetch_body(session, uid, mark_seen).await),
            Command::Logout { reply } => {
                let result = logout(session).await;
                let _ = reply.send(result);
                Flow::Stop
            }
        }
    }

    /// IDLEs until the server pushes data, the keepalive elapses, or a command arrives.
    #[instrument(name = "session::idle", skip_all)]
    async fn idle(&mut self, session: ImapSession) -> Result<(ImapSession, Wake)> {
        enum First {
            Server(async_imap::error::Result<IdleResponse>),
            Command(Option<Command>),
        }

        let mut handle = session.idle();
        handle
            .init()
            .await
            .map_err(|source| Error::ImapIdle { source })?;

        let wake = {
            let (idle_wait, interrupt) = handle.wait_with_timeout(self.idle.keepalive);
            tokio::pin!(idle_wait);

            let first = tokio::select! {
                response = &mut idle_wait => First::Server(response),
                command = self.commands.recv() => First::Command(command),
            };

            // Ends the IDLE wait if it is still pending
            drop(interrupt);

            match first {
                First::Server(response) => {
                    let response = response.map_err(|source| Error::ImapIdle { source })?;
                    self.handle_idle_response(response);
                    Wake::Server
                }
                First::Command(command) => {
                    let response = idle_wait
                        .await
                        .map_err(|source| Error::ImapIdle { source })?;
                    self.handle_idle_response(response);
                    command.map_or(Wake::HandlesDropped, Wake::Command)
                }
            }
        };

        let session = handle
            .done()
            .await
            .map_err(|source| Error::ImapIdle { source })?;

        Ok((session, wake))
    }

    fn handle_idle_response(&self, response: IdleResponse) {
        match response {
            IdleResponse::NewData(data) => {
                if let Some(signal) = classify_response(data.parsed()) {
                    self.signal(signal);
                }
            }
            IdleResponse::Timeout => trace!("IDLE keepalive elapsed"),
            IdleResponse::ManualInterrupt => trace!("IDLE interrupted for command"),
        }
    }

    /// Waits for a command, sending NOOP every poll interval.
    async fn poll(&mut self, session: &mut ImapSession) -> Result<Wake> {
        tokio::select! {
            command = self.commands.recv() => Ok(command.map_or(Wake::HandlesDropped, Wake::Command)),
            () = tokio::time::sleep(self.idle.poll_interval) => {
                session
                    .noop()
                    .await
                    .map_err(|source| Error::ImapNoop { source })?;
                Ok(Wake::Server)
            }
        }
    }

    /// Turns queued unsolicited responses into at most one signal of each kind.
    fn drain_unsolicited(&self, session: &ImapSession) {
        let mut new_mail = false;
        let mut updated = false;

        while let Ok(response) = session.unsolicited_responses.try_recv() {
            match classify_unsolicited(&response) {
                Some(SessionSignal::NewMail) => new_mail = true,
                Some(SessionSignal::FlagsUpdated) => updated = true,
                _ => trace!(?response, "Ignoring unsolicited response"),
            }
        }

        if new_mail {
            self.signal(SessionSignal::NewMail);
        }
        if updated {
            self.signal(SessionSignal::FlagsUpdated);
        }
    }

    fn signal(&self, signal: SessionSignal) {
        debug!(?signal, "Mailbox change");
        let _ = self.signals.send(signal);
    }

    fn fail(&self, error: Error) {
        warn!(error = %error, "Session failed, closing");
        self.signal(SessionSignal::Error(error));
    }
}

/// Replies to the caller and decides whether the connection survived.
fn respond<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> Flow {
    let flow = if result.as_ref().err().is_some_and(connection_lost) {
        warn!("Connection lost during command");
        Flow::Stop
    } else {
        Flow::Continue
    };
    let _ = reply.send(result);
    flow
}

fn connection_lost(error: &Error) -> bool {
    let source = match error {
        Error::OpenMailbox { source, .. }
        | Error::ImapSearch { source, .. }
        | Error::ImapFetch { source, .. } => source,
        _ => return false,
    };
    matches!(
        source,
        async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
    )
}

fn classify_unsolicited(response: &UnsolicitedResponse) -> Option<SessionSignal> {
    match response {
        UnsolicitedResponse::Exists(_) => Some(SessionSignal::NewMail),
        UnsolicitedResponse::Other(data) => classify_response(data.parsed()),
        _ => None,
    }
}

fn classify_response(response: &Response<'_>) -> Option<SessionSignal> {
    match response {
        Response::MailboxData(MailboxDatum::Exists { .. }) => Some(SessionSignal::NewMail),
        Response::Fetch { .. } => Some(SessionSignal::FlagsUpdated),
        _ => None,
    }
}

/// Reads the greeting and authenticates with LOGIN or XOAUTH2.
#[instrument(
    name = "session::authenticate",
    skip_all,
    fields(username = %username)
)]
async fn authenticate(
    stream: ImapStream,
    username: &str,
    credentials: &Credentials,
) -> Result<ImapSession> {
    let mut client = async_imap::Client::new(stream);

    client
        .read_response()
        .await
        .ok_or(Error::ImapGreeting {
            source: async_imap::error::Error::ConnectionLost,
        })?
        .map_err(|e| Error::ImapGreeting { source: e.into() })?;

    debug!("Authenticating to IMAP server");

    match credentials {
        Credentials::Password(_) => client
            .login(username, credentials.secret())
            .await
            .map_err(|(source, _client)| Error::ImapLogin {
                username: username.to_string(),
                source,
            }),
        Credentials::XOAuth2(_) => client
            .authenticate(
                "XOAUTH2",
                XOAuth2::new(username, credentials.secret()),
            )
            .await
            .map_err(|(source, _client)| Error::ImapLogin {
                username: username.to_string(),
                source,
            }),
    }
}

/// SASL XOAUTH2 initial response.
struct XOAuth2 {
    response: Vec<u8>,
    sent: bool,
}

impl XOAuth2 {
    fn new(username: &str, access_token: &str) -> Self {
        Self {
            response: format!("user={username}\x01auth=Bearer {access_token}\x01\x01").into_bytes(),
            sent: false,
        }
    }
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = Vec<u8>;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        if self.sent {
            // Error challenge: an empty reply lets the server finish with NO
            Vec::new()
        } else {
            self.sent = true;
            self.response.clone()
        }
    }
}

/// Opens a mailbox with EXAMINE (read-only) or SELECT.
#[instrument(name = "session::open_mailbox", skip(session))]
async fn open_mailbox(session: &mut ImapSession, name: &str, read_only: bool) -> Result<MailboxInfo> {
    debug!("Opening mailbox");

    let opened = if read_only {
        session.examine(name).await
    } else {
        session.select(name).await
    };
    let mailbox = opened.map_err(|source| Error::OpenMailbox {
        mailbox: name.to_string(),
        source,
    })?;

    Ok(MailboxInfo {
        name: name.to_string(),
        read_only,
        exists: mailbox.exists,
        recent: mailbox.recent,
        unseen: mailbox.unseen,
        uid_validity: mailbox.uid_validity,
        uid_next: mailbox.uid_next,
    })
}

/// `UID SEARCH`, results in ascending UID order.
#[instrument(name = "session::search", skip(session))]
async fn search(session: &mut ImapSession, criteria: &str) -> Result<Vec<Uid>> {
    let uids = session
        .uid_search(criteria)
        .await
        .map_err(|source| Error::ImapSearch {
            criteria: criteria.to_string(),
            source,
        })?;

    let mut uids: Vec<Uid> = uids.into_iter().collect();
    uids.sort_unstable();

    debug!(uid_count = uids.len(), "Search complete");
    Ok(uids)
}

/// `UID FETCH <uid> BODY[]`, or `BODY.PEEK[]` to leave `\Seen` untouched.
#[instrument(name = "session::fetch_body", skip(session))]
async fn fetch_body(session: &mut ImapSession, uid: Uid, mark_seen: bool) -> Result<Vec<u8>> {
    let query = if mark_seen { "BODY[]" } else { "BODY.PEEK[]" };

    let mut stream = session
        .uid_fetch(uid.to_string(), query)
        .await
        .map_err(|source| Error::ImapFetch { uid, source })?
        .boxed();

    let mut body = None;
    // Drain fully so the session is ready for the next command
    while let Some(item) = stream.next().await {
        let fetch = item.map_err(|source| Error::ImapFetch { uid, source })?;
        if body.is_none() && fetch.uid.map_or(true, |fetched| fetched == uid) {
            body = fetch.body().map(<[u8]>::to_vec);
        }
    }

    body.ok_or(Error::MissingBody { uid })
}

#[instrument(name = "session::logout", skip(session))]
async fn logout(session: &mut ImapSession) -> Result<()> {
    debug!("Logging out");

    session
        .logout()
        .await
        .map_err(|source| Error::ImapLogout { source })
}
