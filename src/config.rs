//! Configuration for the mailbox watcher.
//!
//! Use [`WatcherConfigBuilder`] to create a configuration with sensible defaults:
//!
//! ```
//! use mail_watcher::WatcherConfig;
//!
//! let config = WatcherConfig::builder()
//!     .host("imap.example.com")
//!     .username("user@example.com")
//!     .password("app-password")
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.watch.mailbox, "INBOX");
//! assert_eq!(config.watch.search_filter, vec!["UNSEEN".to_string()]);
//! ```

use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// Default search criterion: only messages without the `\Seen` flag.
pub const DEFAULT_SEARCH_FILTER: &str = "UNSEEN";

/// Default mailbox name.
pub const DEFAULT_MAILBOX: &str = "INBOX";

/// Complete watcher configuration: how to reach the server and what to watch.
///
/// Create using [`WatcherConfig::builder()`]. Immutable once built.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Protocol-connection parameters, forwarded to the IMAP session.
    pub connection: ConnectionConfig,
    /// Mailbox watching behaviour.
    pub watch: WatchOptions,
}

impl WatcherConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> WatcherConfigBuilder {
        WatcherConfigBuilder::default()
    }
}

/// Authentication credentials.
#[derive(Clone)]
pub enum Credentials {
    /// Plain `LOGIN` with a password.
    Password(SecretString),
    /// `AUTHENTICATE XOAUTH2` with an OAuth2 access token.
    XOAuth2(SecretString),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password([REDACTED])"),
            Credentials::XOAuth2(_) => f.write_str("XOAuth2([REDACTED])"),
        }
    }
}

impl Credentials {
    /// Returns the secret (password or access token) as a string slice.
    #[must_use]
    pub fn secret(&self) -> &str {
        match self {
            Credentials::Password(secret) | Credentials::XOAuth2(secret) => secret.expose_secret(),
        }
    }
}

/// Parameters for connecting to an IMAP server.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// IMAP server hostname.
    pub host: String,
    /// IMAP server port (default: 993).
    pub port: u16,
    /// Use implicit TLS (default: `true`). When `false` the connection is plain TCP.
    pub tls: bool,
    /// User name for authentication.
    pub username: String,
    /// Password or access token (redacted in `Debug`).
    pub credentials: Credentials,
    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
    /// Change detection configuration.
    pub idle: IdleConfig,
}

impl ConnectionConfig {
    /// Returns the full IMAP server address as "host:port".
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Timeout configuration for session operations.
///
/// Only connection setup and logout are bounded; searches and fetches wait
/// for the server.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for establishing TCP/TLS connection.
    pub connect: Duration,
    /// Timeout for IMAP authentication.
    pub auth: Duration,
    /// Timeout for logout operation.
    pub logout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            auth: Duration::from_secs(30),
            logout: Duration::from_secs(5),
        }
    }
}

/// How the session waits for server-pushed changes.
#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// IDLE is re-issued after this long without server data (RFC 2177 asks for < 29 min).
    pub keepalive: Duration,
    /// NOOP polling interval for servers without the IDLE capability.
    pub poll_interval: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(25 * 60),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// What happens to attachments of fetched messages.
///
/// Every mode emits one attachment event per attachment with its content in
/// memory. Only [`AttachmentMode::Persist`] touches the filesystem, so
/// `Disabled` and `Buffer` produce identical events. `Buffer` is an alias kept
/// for callers that want to say they consume attachments from memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttachmentMode {
    /// Attachments are reported with no path; content stays in memory.
    #[default]
    Disabled,
    /// Alias of `Disabled`.
    Buffer,
    /// Attachments are written to `{attachment_directory}{filename}` before being reported.
    Persist,
}

/// Options passed through to the MIME parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserOptions {
    /// Do not render `text_as_html` from the plain text body.
    pub skip_text_to_html: bool,
    /// Do not derive a plain text body from HTML-only messages.
    pub skip_html_to_text: bool,
}

/// What to watch and how to process matched messages.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Mailbox name (default: `INBOX`).
    pub mailbox: String,
    /// Search criteria, joined with spaces into one `UID SEARCH` (default: `UNSEEN`).
    pub search_filter: Vec<String>,
    /// Fetch with `BODY[]` so the server flags the message `\Seen`.
    pub mark_seen: bool,
    /// Run one search-and-fetch cycle as soon as the mailbox is open.
    pub fetch_unread_on_start: bool,
    /// Attachment handling mode.
    pub attachments: AttachmentMode,
    /// Prefix prepended verbatim to attachment file names; include the trailing separator.
    pub attachment_directory: String,
    /// Parser options.
    pub parser: ParserOptions,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            mailbox: DEFAULT_MAILBOX.to_string(),
            search_filter: vec![DEFAULT_SEARCH_FILTER.to_string()],
            mark_seen: false,
            fetch_unread_on_start: false,
            attachments: AttachmentMode::default(),
            attachment_directory: String::new(),
            parser: ParserOptions::default(),
        }
    }
}

impl WatchOptions {
    /// The search criteria as sent to the server.
    #[must_use]
    pub fn search_query(&self) -> String {
        self.search_filter.join(" ")
    }

    /// `true` when the mailbox can be opened read-only (EXAMINE).
    #[must_use]
    pub fn read_only(&self) -> bool {
        !self.mark_seen
    }
}

/// Builder for [`WatcherConfig`].
#[derive(Debug, Default)]
pub struct WatcherConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    tls: Option<bool>,
    username: Option<String>,
    password: Option<String>,
    access_token: Option<String>,
    timeouts: Option<TimeoutConfig>,
    idle: Option<IdleConfig>,
    mailbox: Option<String>,
    search_filter: Option<Vec<String>>,
    mark_seen: bool,
    fetch_unread_on_start: bool,
    attachments: AttachmentMode,
    attachment_directory: Option<String>,
    parser: ParserOptions,
}

impl WatcherConfigBuilder {
    /// Sets the IMAP server hostname (required).
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the IMAP server port. Default is 993.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables or disables implicit TLS. Default is enabled.
    #[must_use]
    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets the user name (required).
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password for `LOGIN`.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets an OAuth2 access token; authentication then uses `XOAUTH2`.
    ///
    /// Takes precedence over [`password`](Self::password).
    #[must_use]
    pub fn xoauth2(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    /// Sets timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .connect = timeout;
        self
    }

    /// Sets the authentication timeout.
    #[must_use]
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .auth = timeout;
        self
    }

    /// Sets change detection configuration.
    #[must_use]
    pub fn idle(mut self, idle: IdleConfig) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Sets the mailbox to watch. Default is `INBOX`.
    #[must_use]
    pub fn mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = Some(mailbox.into());
        self
    }

    /// Sets the search criteria, e.g. `["UNSEEN", "FROM", "alerts@example.com"]`.
    #[must_use]
    pub fn search_filter<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_filter = Some(criteria.into_iter().map(Into::into).collect());
        self
    }

    /// Sets a single search criterion.
    #[must_use]
    pub fn search(self, criterion: impl Into<String>) -> Self {
        self.search_filter([criterion.into()])
    }

    /// Marks fetched messages as seen on the server.
    #[must_use]
    pub fn mark_seen(mut self, mark_seen: bool) -> Self {
        self.mark_seen = mark_seen;
        self
    }

    /// Processes already-matching messages right after the mailbox opens.
    #[must_use]
    pub fn fetch_unread_on_start(mut self, fetch: bool) -> Self {
        self.fetch_unread_on_start = fetch;
        self
    }

    /// Sets the attachment handling mode.
    #[must_use]
    pub fn attachments(mut self, mode: AttachmentMode) -> Self {
        self.attachments = mode;
        self
    }

    /// Persists attachments under `directory`, used verbatim as a file name prefix.
    #[must_use]
    pub fn attachment_directory(mut self, directory: impl Into<String>) -> Self {
        self.attachment_directory = Some(directory.into());
        self
    }

    /// Sets parser options.
    #[must_use]
    pub fn parser_options(mut self, parser: ParserOptions) -> Self {
        self.parser = parser;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if required fields are missing or invalid.
    pub fn build(self) -> Result<WatcherConfig> {
        let host = self
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfig {
                message: "host is required".into(),
            })?;

        let username = self.username.ok_or_else(|| Error::InvalidConfig {
            message: "username is required".into(),
        })?;

        let credentials = match (self.access_token, self.password) {
            (Some(token), _) => Credentials::XOAuth2(SecretString::from(token)),
            (None, Some(password)) => Credentials::Password(SecretString::from(password)),
            (None, None) => {
                return Err(Error::InvalidConfig {
                    message: "password or XOAUTH2 access token is required".into(),
                })
            }
        };

        let search_filter = self
            .search_filter
            .unwrap_or_else(|| vec![DEFAULT_SEARCH_FILTER.to_string()]);
        if search_filter.is_empty() {
            return Err(Error::InvalidConfig {
                message: "search filter must contain at least one criterion".into(),
            });
        }

        Ok(WatcherConfig {
            connection: ConnectionConfig {
                host,
                port: self.port.unwrap_or(993),
                tls: self.tls.unwrap_or(true),
                username,
                credentials,
                timeouts: self.timeouts.unwrap_or_default(),
                idle: self.idle.unwrap_or_default(),
            },
            watch: WatchOptions {
                mailbox: self.mailbox.unwrap_or_else(|| DEFAULT_MAILBOX.to_string()),
                search_filter,
                mark_seen: self.mark_seen,
                fetch_unread_on_start: self.fetch_unread_on_start,
                attachments: self.attachments,
                attachment_directory: self.attachment_directory.unwrap_or_default(),
                parser: self.parser,
            },
        })
    }
}
