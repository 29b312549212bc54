//! Events delivered to the embedding application.
//!
//! Per message the order is fixed: [`MailEvent::Mail`], [`MailEvent::Headers`],
//! [`MailEvent::Body`], then one [`MailEvent::Attachment`] per attachment.
//! Events of different messages interleave freely, so correlate them by `uid`.

use crate::error::Error;
use crate::mailbox::{MailboxInfo, Uid};
use crate::parser::{Attachment, Headers, MessageBody, ParsedMessage};
use futures::Stream;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::trace;

/// A notification from the watcher.
#[derive(Debug)]
#[non_exhaustive]
pub enum MailEvent {
    /// The mailbox was opened and watching has begun.
    Connected,
    /// The connection closed.
    Disconnected,
    /// Metadata of the opened mailbox.
    Mailbox(MailboxInfo),
    /// A message was fetched and parsed.
    Mail {
        /// Message identifier.
        uid: Uid,
        /// The parsed message.
        message: Arc<ParsedMessage>,
    },
    /// Headers of a parsed message.
    Headers {
        /// Message identifier.
        uid: Uid,
        /// Header collection.
        headers: Headers,
    },
    /// Textual bodies of a parsed message.
    Body {
        /// Message identifier.
        uid: Uid,
        /// Text, HTML and text-as-HTML bodies.
        body: MessageBody,
    },
    /// One attachment of a parsed message.
    Attachment {
        /// Message identifier.
        uid: Uid,
        /// The attachment, content included.
        attachment: Arc<Attachment>,
        /// Where it was written, when attachments are persisted.
        path: Option<PathBuf>,
    },
    /// Something failed; the watcher keeps going unless the connection is gone.
    Error(Error),
}

impl MailEvent {
    /// The message identifier for per-message events.
    #[must_use]
    pub fn uid(&self) -> Option<Uid> {
        match self {
            MailEvent::Mail { uid, .. }
            | MailEvent::Headers { uid, .. }
            | MailEvent::Body { uid, .. }
            | MailEvent::Attachment { uid, .. } => Some(*uid),
            _ => None,
        }
    }

    /// Short name of the event kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MailEvent::Connected => "server:connected",
            MailEvent::Disconnected => "server:disconnected",
            MailEvent::Mailbox(_) => "mailbox",
            MailEvent::Mail { .. } => "mail",
            MailEvent::Headers { .. } => "headers",
            MailEvent::Body { .. } => "body",
            MailEvent::Attachment { .. } => "attachment",
            MailEvent::Error(_) => "error",
        }
    }
}

/// Sending side of the event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<MailEvent>,
}

impl EventSink {
    pub(crate) fn emit(&self, event: MailEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            trace!(kind, "Event dropped, no receiver");
        }
    }

    pub(crate) fn error(&self, error: Error) {
        self.emit(MailEvent::Error(error));
    }
}

/// Receiving side of the event channel.
///
/// Also usable as a [`Stream`] of [`MailEvent`]s.
#[derive(Debug)]
pub struct Events {
    rx: mpsc::UnboundedReceiver<MailEvent>,
}

impl Events {
    /// Waits for the next event.
    ///
    /// Returns `None` once the watcher has been dropped and all events were consumed.
    pub async fn recv(&mut self) -> Option<MailEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<MailEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Events {
    type Item = MailEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Creates a connected sink/receiver pair.
pub(crate) fn channel() -> (EventSink, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, Events { rx })
}
