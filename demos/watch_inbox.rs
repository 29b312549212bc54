//! Example: Watching a mailbox and printing every event.
//!
//! Runs until Ctrl-C, then stops the watcher cleanly.
//!
//! # Usage
//!
//! ```bash
//! export MAIL_WATCHER_HOST="imap.gmail.com"
//! export MAIL_WATCHER_USERNAME="your@email.com"
//! export MAIL_WATCHER_PASSWORD="your-app-password"
//! # Optional
//! export MAIL_WATCHER_MAILBOX="INBOX"
//! export MAIL_WATCHER_ATTACHMENT_DIR="/tmp/attachments/"
//! # Set log level (trace, debug, info, warn, error)
//! export RUST_LOG=mail_watcher=debug
//!
//! cargo run --example watch_inbox
//! ```

use mail_watcher::{AttachmentMode, MailEvent, MailWatcher, WatcherConfig};
use std::env;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> mail_watcher::Result<()> {
    dotenvy::dotenv().ok();

    // Use RUST_LOG to control log levels, e.g. RUST_LOG=mail_watcher=debug,info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mail_watcher=info")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .init();

    let host = env::var("MAIL_WATCHER_HOST").expect("MAIL_WATCHER_HOST environment variable required");
    let username =
        env::var("MAIL_WATCHER_USERNAME").expect("MAIL_WATCHER_USERNAME environment variable required");
    let password =
        env::var("MAIL_WATCHER_PASSWORD").expect("MAIL_WATCHER_PASSWORD environment variable required");

    let mut builder = WatcherConfig::builder()
        .host(host)
        .username(username)
        .password(password)
        .fetch_unread_on_start(true);

    if let Ok(mailbox) = env::var("MAIL_WATCHER_MAILBOX") {
        builder = builder.mailbox(mailbox);
    }
    if let Ok(directory) = env::var("MAIL_WATCHER_ATTACHMENT_DIR") {
        builder = builder
            .attachments(AttachmentMode::Persist)
            .attachment_directory(directory);
    }

    let config = builder.build()?;
    tracing::info!(mailbox = %config.watch.mailbox, "Starting watcher");

    let (mut watcher, mut events) = MailWatcher::new(config);
    watcher.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping");
                break;
            }
            event = events.recv() => match event {
                Some(MailEvent::Connected) => println!("connected"),
                Some(MailEvent::Mailbox(info)) => {
                    println!("watching {} ({} messages, {} recent)", info.name, info.exists, info.recent);
                }
                Some(MailEvent::Mail { uid, message }) => {
                    println!(
                        "[{uid}] {} from {}",
                        message.subject.as_deref().unwrap_or("(no subject)"),
                        message.from.as_deref().unwrap_or("(unknown)"),
                    );
                }
                Some(MailEvent::Body { uid, body }) => {
                    let preview: String = body.text.unwrap_or_default().chars().take(80).collect();
                    println!("[{uid}] {preview}");
                }
                Some(MailEvent::Attachment { uid, attachment, path }) => {
                    println!(
                        "[{uid}] attachment {:?} ({} bytes) {}",
                        attachment.filename,
                        attachment.size(),
                        path.map(|p| p.display().to_string()).unwrap_or_default(),
                    );
                }
                Some(MailEvent::Error(e)) => {
                    eprintln!("error ({}): {e}", e.category());
                }
                Some(MailEvent::Disconnected) => {
                    println!("disconnected");
                    break;
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    watcher.stop().await;
    Ok(())
}
