//! Seams between the watcher and the mail-retrieval protocol.
//!
//! The watcher only orchestrates: it asks a [`Connector`] for a connected
//! [`MailboxSession`], then searches and fetches through it while reacting to
//! the [`SessionSignal`]s the connection pushes. [`ImapConnector`](crate::ImapConnector)
//! is the production implementation; tests and embedders may supply their own.
//!
//! # Example
//!
//! ```
//! use mail_watcher::mailbox::{MailboxInfo, MailboxSession, Uid};
//! use mail_watcher::Result;
//!
//! struct Fixed(Vec<u8>);
//!
//! impl MailboxSession for Fixed {
//!     async fn open_mailbox(&self, name: &str, read_only: bool) -> Result<MailboxInfo> {
//!         Ok(MailboxInfo::new(name, read_only))
//!     }
//!
//!     async fn search(&self, _criteria: &[String]) -> Result<Vec<Uid>> {
//!         Ok(vec![1])
//!     }
//!
//!     async fn fetch_body(&self, _uid: Uid, _mark_seen: bool) -> Result<Vec<u8>> {
//!         Ok(self.0.clone())
//!     }
//!
//!     async fn close(&self) -> Result<()> {
//!         Ok(())
//!     }
//! }
//! ```

use crate::error::{Error, Result};
use std::future::Future;
use tokio::sync::mpsc;

/// Protocol-assigned message identifier (an IMAP UID).
pub type Uid = u32;

/// Metadata of an opened mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    /// Mailbox name as requested.
    pub name: String,
    /// Whether the mailbox was opened read-only.
    pub read_only: bool,
    /// Number of messages in the mailbox.
    pub exists: u32,
    /// Number of messages with the `\Recent` flag.
    pub recent: u32,
    /// Sequence number of the first unseen message, if reported.
    pub unseen: Option<u32>,
    /// UIDVALIDITY, if reported.
    pub uid_validity: Option<u32>,
    /// Predicted next UID, if reported.
    pub uid_next: Option<u32>,
}

impl MailboxInfo {
    /// Metadata for a mailbox with no reported counters.
    #[must_use]
    pub fn new(name: impl Into<String>, read_only: bool) -> Self {
        Self {
            name: name.into(),
            read_only,
            exists: 0,
            recent: 0,
            unseen: None,
            uid_validity: None,
            uid_next: None,
        }
    }
}

/// Server-pushed notifications from a live connection.
#[derive(Debug)]
pub enum SessionSignal {
    /// A new message arrived (unsolicited `EXISTS`).
    NewMail,
    /// Message flags or metadata changed (unsolicited `FETCH`).
    FlagsUpdated,
    /// The connection hit a protocol or transport error.
    Error(Error),
}

/// Receiving half of a session's signal channel.
///
/// The channel closes when the underlying connection closes.
pub type SignalReceiver = mpsc::UnboundedReceiver<SessionSignal>;

/// A connected, authenticated session together with its signal stream.
#[derive(Debug)]
pub struct Connection<S> {
    /// The session used for mailbox commands.
    pub session: S,
    /// Server-pushed signals.
    pub signals: SignalReceiver,
}

/// Mailbox operations the watcher needs from a connected session.
///
/// Implementations must tolerate concurrent calls; the watcher issues
/// fetches for distinct identifiers from independent tasks.
pub trait MailboxSession: Send + Sync + 'static {
    /// Opens `name`, read-only when `read_only` is set.
    fn open_mailbox(
        &self,
        name: &str,
        read_only: bool,
    ) -> impl Future<Output = Result<MailboxInfo>> + Send;

    /// Returns identifiers matching `criteria`, in server order.
    fn search(&self, criteria: &[String]) -> impl Future<Output = Result<Vec<Uid>>> + Send;

    /// Returns the full raw message. With `mark_seen` the server flags it `\Seen`.
    fn fetch_body(&self, uid: Uid, mark_seen: bool) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Gracefully closes the connection.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Establishes connections for the watcher.
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Session: MailboxSession;

    /// Connects and authenticates.
    fn connect(&self) -> impl Future<Output = Result<Connection<Self::Session>>> + Send;
}
