//! Fetch-and-parse task: one per claimed message identifier.

use crate::config::{AttachmentMode, WatchOptions};
use crate::error::Error;
use crate::event::{EventSink, MailEvent};
use crate::inflight::Claim;
use crate::mailbox::{MailboxSession, Uid};
use crate::parser::{self, Attachment};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Everything a task needs besides its claim.
pub(crate) struct FetchContext<S> {
    pub session: Arc<S>,
    pub options: Arc<WatchOptions>,
    pub sink: EventSink,
}

impl<S> Clone for FetchContext<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            options: Arc::clone(&self.options),
            sink: self.sink.clone(),
        }
    }
}

/// Fetches, parses and reports one message.
///
/// `claim` is held for the whole task and released when it returns, on
/// every path.
#[instrument(
    name = "fetch::process_message",
    skip_all,
    fields(uid = claim.uid(), mark_seen = ctx.options.mark_seen)
)]
pub(crate) async fn process_message<S: MailboxSession>(ctx: FetchContext<S>, claim: Claim) {
    let uid = claim.uid();
    let options = &ctx.options;

    let raw = match ctx.session.fetch_body(uid, options.mark_seen).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "Fetch failed");
            ctx.sink.error(e);
            return;
        }
    };

    debug!(bytes = raw.len(), "Fetched message");

    let message = match parser::parse_message(&raw, &options.parser) {
        Ok(message) => Arc::new(message),
        Err(source) => {
            warn!(error = %source, "Failed to parse message");
            ctx.sink.error(Error::ParseEmail { uid, source });
            return;
        }
    };

    ctx.sink.emit(MailEvent::Mail {
        uid,
        message: Arc::clone(&message),
    });
    ctx.sink.emit(MailEvent::Headers {
        uid,
        headers: message.headers.clone(),
    });
    ctx.sink.emit(MailEvent::Body {
        uid,
        body: message.body(),
    });

    for (index, attachment) in message.attachments.iter().enumerate() {
        let path = match options.attachments {
            AttachmentMode::Disabled | AttachmentMode::Buffer => None,
            AttachmentMode::Persist => {
                let path = attachment_path(&options.attachment_directory, uid, index, attachment);
                match persist(&path, &attachment.content).await {
                    Ok(()) => Some(path),
                    Err(e) => {
                        ctx.sink.error(e);
                        continue;
                    }
                }
            }
        };

        ctx.sink.emit(MailEvent::Attachment {
            uid,
            attachment: Arc::clone(attachment),
            path,
        });
    }

    debug!(
        attachments = message.attachments.len(),
        "Message processed"
    );

    drop(claim);
}

/// `{directory}{filename}` with the directory used verbatim.
///
/// Only the last component of the sender-supplied file name is kept.
pub(crate) fn attachment_path(
    directory: &str,
    uid: Uid,
    index: usize,
    attachment: &Attachment,
) -> PathBuf {
    let filename = attachment
        .filename
        .as_deref()
        .and_then(|name| name.rsplit(|c: char| c == '/' || c == '\\').next())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map_or_else(|| format!("attachment-{uid}-{index}"), str::to_string);

    PathBuf::from(format!("{directory}{filename}"))
}

#[instrument(
    name = "fetch::persist_attachment",
    skip_all,
    fields(path = %path.display(), bytes = content.len())
)]
async fn persist(path: &Path, content: &[u8]) -> Result<(), Error> {
    tokio::fs::write(path, content)
        .await
        .map_err(|source| Error::AttachmentWrite {
            path: path.to_path_buf(),
            source,
        })?;

    debug!("Attachment written");
    Ok(())
}
