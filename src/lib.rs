//! # mail-watcher
//!
//! Async IMAP mailbox watcher that fetches new mail, parses it and reports
//! the result as a stream of events.
//!
//! The watcher:
//! - Connects to an IMAP server over TLS (or plain TCP) and opens one mailbox
//! - Waits for server pushes with IDLE, falling back to NOOP polling
//! - Searches with configurable criteria whenever the mailbox changes
//! - Fetches and parses each matching message concurrently, never the same
//!   message twice at once
//! - Optionally writes attachments to a directory
//!
//! ## Features
//!
//! - **`observability`**: Enables OpenTelemetry integration for distributed tracing.
//!   Re-exports `opentelemetry` and `tracing_opentelemetry` at the versions the
//!   crate is built against, so an exporter layer can be attached to the same
//!   subscriber that receives the watcher's spans. Without this feature, tracing
//!   spans are still emitted but require no OTEL dependencies.
//! - **`integration-tests`**: Runs the live-server tests in `tests/integration.rs`
//!   instead of ignoring them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mail_watcher::{MailEvent, MailWatcher, WatcherConfig};
//!
//! # async fn example() -> mail_watcher::Result<()> {
//! let config = WatcherConfig::builder()
//!     .host("imap.gmail.com")
//!     .username("user@gmail.com")
//!     .password("app-password")  // Use app-specific password for Gmail
//!     .search_filter(["UNSEEN", "SINCE", "1-Jan-2025"])
//!     .mark_seen(true)
//!     .build()?;
//!
//! let (mut watcher, mut events) = MailWatcher::new(config);
//! watcher.start();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         MailEvent::Mail { uid, message } => println!("{uid}: {:?}", message.subject),
//!         MailEvent::Attachment { attachment, .. } => println!("  {:?}", attachment.filename),
//!         MailEvent::Error(e) => eprintln!("error: {e}"),
//!         MailEvent::Disconnected => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Saving Attachments
//!
//! ```no_run
//! use mail_watcher::{AttachmentMode, MailWatcher, WatcherConfig};
//!
//! # fn example() -> mail_watcher::Result<()> {
//! let config = WatcherConfig::builder()
//!     .host("imap.example.com")
//!     .username("user@example.com")
//!     .xoauth2("ya29.access-token")
//!     .attachments(AttachmentMode::Persist)
//!     .attachment_directory("/var/spool/attachments/")
//!     .build()?;
//!
//! let (_watcher, _events) = MailWatcher::new(config);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Failures while watching arrive as [`MailEvent::Error`]. All errors implement
//! `std::error::Error` and provide context. Use [`Error::is_retryable`] to decide
//! whether restarting the watcher is worthwhile:
//!
//! ```
//! use mail_watcher::Error;
//!
//! fn handle_error(error: &Error) {
//!     if error.is_retryable() {
//!         println!("Transient error, can retry: {}", error);
//!     } else {
//!         println!("Permanent error: {}", error);
//!     }
//! }
//! ```
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation. All major operations emit spans with
//! structured fields suitable for distributed tracing.
//!
//! ### Span Naming Convention
//!
//! - `MailWatcher::run` - Watcher lifecycle
//! - `ImapConnector::connect` - Connection and authentication
//! - `pipeline::run_cycle` - One search and dispatch
//! - `fetch::process_message` - Fetching and parsing one message
//! - `session::authenticate` - IMAP authentication
//! - `session::idle` - Waiting for server pushes
//! - `connection::establish` - TCP/TLS connection
//!
//! ### Standard Fields
//!
//! - `username` - Account name
//! - `imap_host` - IMAP server hostname
//! - `mailbox` - Watched mailbox
//! - `criteria` - Search criteria
//! - `uid` - Message UID
//!
//! Enable the `observability` feature for OpenTelemetry integration.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod config;
pub mod error;
pub mod event;
pub mod inflight;
pub mod mailbox;
pub mod parser;

// Internal modules
mod connection;
mod fetch;
mod pipeline;
mod session;
mod watcher;

// Re-exports for ergonomic API
pub use config::{
    AttachmentMode, ConnectionConfig, Credentials, IdleConfig, ParserOptions, TimeoutConfig,
    WatchOptions, WatcherConfig, WatcherConfigBuilder,
};
pub use error::{Error, ErrorCategory, Result};
pub use event::{Events, MailEvent};
pub use inflight::InFlight;
pub use parser::{Attachment, Headers, MessageBody, ParsedMessage};
pub use session::{ImapConnector, ImapMailbox};
pub use watcher::MailWatcher;

#[cfg(feature = "observability")]
pub use opentelemetry;
#[cfg(feature = "observability")]
pub use tracing_opentelemetry;
