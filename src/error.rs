//! Error types for the mail-watcher crate.
//!
//! Errors never escape the watcher's public operations: they are delivered to
//! the consumer as [`MailEvent::Error`](crate::MailEvent::Error). The watcher
//! does not interpret them or retry on its own; [`Error::is_retryable`] and
//! [`Error::category`] are provided for consumers that want to.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::mailbox::Uid;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while watching a mailbox.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration / environment errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid configuration provided.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// Invalid DNS name for TLS.
    #[error("invalid DNS name for host '{host}'")]
    InvalidDnsName {
        /// The invalid hostname.
        host: String,
        /// The underlying DNS name error.
        #[source]
        source: rustls::client::InvalidDnsNameError,
    },

    /// The watcher was started outside of a Tokio runtime.
    #[error("no Tokio runtime available to run the watcher")]
    NoRuntime,

    // ─────────────────────────────────────────────────────────────────────────
    // Network / connection errors (RETRYABLE)
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to establish TCP connection.
    #[error("failed to connect to {target}")]
    TcpConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to establish TLS connection.
    #[error("failed to establish TLS connection to {target}")]
    TlsConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The session is no longer connected.
    #[error("mailbox session is closed")]
    SessionClosed,

    // ─────────────────────────────────────────────────────────────────────────
    // Timeout errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Connection timeout.
    #[error("connection timeout to {target} after {timeout:?}")]
    ConnectTimeout {
        /// The target address.
        target: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Authentication timeout.
    #[error("authentication timeout for {username} after {timeout:?}")]
    AuthTimeout {
        /// The user name used for authentication.
        username: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Logout timeout (not critical).
    #[error("logout timeout after {timeout:?}")]
    LogoutTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // IMAP protocol errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to read the server greeting.
    #[error("failed to read IMAP greeting")]
    ImapGreeting {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP login failed.
    #[error("IMAP login failed for {username}")]
    ImapLogin {
        /// The user name used for login.
        username: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to open (SELECT or EXAMINE) the mailbox.
    #[error("failed to open mailbox '{mailbox}'")]
    OpenMailbox {
        /// The mailbox name.
        mailbox: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// CAPABILITY command failed.
    #[error("IMAP CAPABILITY command failed")]
    ImapCapabilities {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IDLE failed while waiting for mailbox changes.
    #[error("IMAP IDLE failed")]
    ImapIdle {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP NOOP failed.
    #[error("IMAP NOOP command failed")]
    ImapNoop {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP search failed.
    #[error("IMAP search failed for criteria '{criteria}'")]
    ImapSearch {
        /// The search criteria sent to the server.
        criteria: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP fetch failed.
    #[error("IMAP fetch failed for UID {uid}")]
    ImapFetch {
        /// The UID that failed.
        uid: Uid,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// The server answered a fetch without a message body.
    #[error("no message body returned for UID {uid}")]
    MissingBody {
        /// The UID that was fetched.
        uid: Uid,
    },

    /// IMAP logout failed.
    #[error("IMAP logout failed")]
    ImapLogout {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Email parsing errors (NOT retryable - malformed content won't change)
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to parse email message.
    #[error("failed to parse message UID {uid}")]
    ParseEmail {
        /// The UID of the message.
        uid: Uid,
        /// The underlying parse error.
        #[source]
        source: mailparse::MailParseError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Attachment storage errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to write an attachment to disk.
    #[error("failed to write attachment to {}", path.display())]
    AttachmentWrite {
        /// Destination path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Returns `true` if this error represents a transient failure that might succeed on retry.
    ///
    /// The watcher never retries on its own. A message whose fetch failed is
    /// picked up again on the next change signal from the server.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TcpConnect { .. }
            | Error::TlsConnect { .. }
            | Error::SessionClosed
            | Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::ImapGreeting { .. }
            | Error::ImapLogin { .. }
            | Error::OpenMailbox { .. }
            | Error::ImapCapabilities { .. }
            | Error::ImapIdle { .. }
            | Error::ImapNoop { .. }
            | Error::ImapSearch { .. }
            | Error::ImapFetch { .. }
            | Error::AttachmentWrite { .. } => true,

            Error::InvalidConfig { .. }
            | Error::InvalidDnsName { .. }
            | Error::NoRuntime
            | Error::LogoutTimeout { .. }
            | Error::MissingBody { .. }
            | Error::ImapLogout { .. }
            | Error::ParseEmail { .. } => false,
        }
    }

    /// Returns the error category for metrics/logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidConfig { .. } | Error::InvalidDnsName { .. } | Error::NoRuntime => {
                ErrorCategory::Configuration
            }

            Error::TcpConnect { .. } | Error::TlsConnect { .. } | Error::SessionClosed => {
                ErrorCategory::Network
            }

            Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::LogoutTimeout { .. } => ErrorCategory::Timeout,

            Error::ImapGreeting { .. }
            | Error::ImapLogin { .. }
            | Error::OpenMailbox { .. }
            | Error::ImapCapabilities { .. }
            | Error::ImapIdle { .. }
            | Error::ImapNoop { .. }
            | Error::ImapSearch { .. }
            | Error::ImapFetch { .. }
            | Error::MissingBody { .. }
            | Error::ImapLogout { .. } => ErrorCategory::Protocol,

            Error::ParseEmail { .. } => ErrorCategory::Parse,

            Error::AttachmentWrite { .. } => ErrorCategory::Storage,
        }
    }
}

/// Error categories for metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration or environment errors.
    Configuration,
    /// Network connectivity errors.
    Network,
    /// Timeout errors.
    Timeout,
    /// IMAP protocol errors.
    Protocol,
    /// Email parsing errors.
    Parse,
    /// Attachment storage errors.
    Storage,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Parse => write!(f, "parse"),
            ErrorCategory::Storage => write!(f, "storage"),
        }
    }
}
