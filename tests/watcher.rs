//! Watcher behaviour against an in-memory mailbox.
//!
//! The mock connector records every command so tests can assert on what the
//! watcher asked for, and lets tests push server signals or hold fetches open.

use mail_watcher::mailbox::{Connection, Connector, MailboxInfo, MailboxSession, SessionSignal, Uid};
use mail_watcher::{AttachmentMode, Error, Events, MailEvent, MailWatcher, Result, WatchOptions};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

// ─────────────────────────────────────────────────────────────────────────────
// Mock Mailbox
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    messages: Mutex<HashMap<Uid, Vec<u8>>>,
    search_results: Mutex<Vec<Uid>>,
    failing_fetches: Mutex<HashSet<Uid>>,
    fail_connect: AtomicBool,
    fail_open: AtomicBool,
    /// When set, each fetch waits for a permit.
    gate: Option<Semaphore>,
    opens: Mutex<Vec<(String, bool)>>,
    searches: Mutex<Vec<Vec<String>>>,
    fetches: Mutex<Vec<(Uid, bool)>>,
    closes: AtomicUsize,
    signals: Mutex<Option<mpsc::UnboundedSender<SessionSignal>>>,
}

impl MockState {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    fn add_message(&self, uid: Uid, raw: Vec<u8>) {
        self.messages.lock().unwrap().insert(uid, raw);
        self.search_results.lock().unwrap().push(uid);
    }

    fn release_fetches(&self, count: usize) {
        self.gate.as_ref().expect("gated mock").add_permits(count);
    }

    fn push(&self, signal: SessionSignal) {
        self.signals
            .lock()
            .unwrap()
            .as_ref()
            .expect("connected")
            .send(signal)
            .unwrap();
    }

    fn close_from_server(&self) {
        self.signals.lock().unwrap().take();
    }

    fn search_count(&self) -> usize {
        self.searches.lock().unwrap().len()
    }

    fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    fn is_connected(&self) -> bool {
        self.signals.lock().unwrap().is_some()
    }
}

struct MockConnector(Arc<MockState>);

impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self) -> Result<Connection<MockSession>> {
        if self.0.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.signals.lock().unwrap() = Some(tx);

        Ok(Connection {
            session: MockSession(Arc::clone(&self.0)),
            signals: rx,
        })
    }
}

struct MockSession(Arc<MockState>);

impl MailboxSession for MockSession {
    async fn open_mailbox(&self, name: &str, read_only: bool) -> Result<MailboxInfo> {
        self.0.opens.lock().unwrap().push((name.to_string(), read_only));

        if self.0.fail_open.load(Ordering::SeqCst) {
            return Err(Error::OpenMailbox {
                mailbox: name.to_string(),
                source: async_imap::error::Error::No("Mailbox doesn't exist".into()),
            });
        }

        let mut info = MailboxInfo::new(name, read_only);
        info.exists = u32::try_from(self.0.messages.lock().unwrap().len()).unwrap();
        Ok(info)
    }

    async fn search(&self, criteria: &[String]) -> Result<Vec<Uid>> {
        self.0.searches.lock().unwrap().push(criteria.to_vec());
        Ok(self.0.search_results.lock().unwrap().clone())
    }

    async fn fetch_body(&self, uid: Uid, mark_seen: bool) -> Result<Vec<u8>> {
        self.0.fetches.lock().unwrap().push((uid, mark_seen));

        if let Some(gate) = &self.0.gate {
            gate.acquire().await.unwrap().forget();
        }

        if self.0.failing_fetches.lock().unwrap().contains(&uid) {
            return Err(Error::MissingBody { uid });
        }

        self.0
            .messages
            .lock()
            .unwrap()
            .get(&uid)
            .cloned()
            .ok_or(Error::MissingBody { uid })
    }

    async fn close(&self) -> Result<()> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        self.0.close_from_server();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// A message with `attachments` base64 text attachments named `file-{i}.txt`.
fn message(subject: &str, attachments: usize) -> Vec<u8> {
    let mut raw = format!(
        "From: Alerts <alerts@example.com>\r\n\
         To: ops@example.com\r\n\
         Subject: {subject}\r\n\
         Message-ID: <{subject}@example.com>\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
         \r\n\
         --b1\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Body of {subject}\r\n"
    );

    for i in 0..attachments {
        raw.push_str(&format!(
            "--b1\r\n\
             Content-Type: text/plain; name=\"file-{i}.txt\"\r\n\
             Content-Disposition: attachment; filename=\"file-{i}.txt\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {}\r\n",
            base64_of_digit(i)
        ));
    }
    raw.push_str("--b1--\r\n");
    raw.into_bytes()
}

/// Base64 of `"content {i}"` for single digits.
fn base64_of_digit(i: usize) -> &'static str {
    const ENCODED: [&str; 4] = [
        "Y29udGVudCAw",
        "Y29udGVudCAx",
        "Y29udGVudCAy",
        "Y29udGVudCAz",
    ];
    ENCODED[i]
}

fn watch_options() -> WatchOptions {
    WatchOptions {
        fetch_unread_on_start: true,
        ..WatchOptions::default()
    }
}

fn watcher(state: &Arc<MockState>, options: WatchOptions) -> (MailWatcher<MockConnector>, Events) {
    MailWatcher::with_connector(MockConnector(Arc::clone(state)), options)
}

async fn next_event(events: &mut Events) -> MailEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event before timeout")
        .expect("event channel open")
}

/// Receives events until `last` matches, returning all of them.
async fn events_until(events: &mut Events, last: impl Fn(&MailEvent) -> bool) -> Vec<MailEvent> {
    let mut received = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = last(&event);
        received.push(event);
        if done {
            return received;
        }
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting until {what}");
}

fn kinds(events: &[MailEvent]) -> Vec<&'static str> {
    events.iter().map(MailEvent::kind).collect()
}

fn drain(events: &mut Events) -> Vec<MailEvent> {
    std::iter::from_fn(|| events.try_recv()).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_initial_fetch_emits_events_in_order() {
    let state = MockState::new();
    state.add_message(5, message("report", 2));

    let (mut watcher, mut events) = watcher(&state, watch_options());
    watcher.start();

    let received = events_until(&mut events, |e| {
        matches!(e, MailEvent::Attachment { attachment, .. }
            if attachment.filename.as_deref() == Some("file-1.txt"))
    })
    .await;

    assert_eq!(
        kinds(&received),
        vec![
            "server:connected",
            "mailbox",
            "mail",
            "headers",
            "body",
            "attachment",
            "attachment"
        ]
    );

    match &received[2] {
        MailEvent::Mail { uid, message } => {
            assert_eq!(*uid, 5);
            assert_eq!(message.subject.as_deref(), Some("report"));
            assert_eq!(message.attachments.len(), 2);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    for event in &received[5..] {
        match event {
            MailEvent::Attachment { uid, path, .. } => {
                assert_eq!(*uid, 5);
                assert!(path.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // Default options peek and open read-only
    assert_eq!(*state.opens.lock().unwrap(), vec![("INBOX".to_string(), true)]);
    assert_eq!(*state.fetches.lock().unwrap(), vec![(5, false)]);
    assert_eq!(state.searches.lock().unwrap()[0], vec!["UNSEEN".to_string()]);

    watcher.stop().await;
    assert_eq!(kinds(&drain(&mut events)), vec!["server:disconnected"]);
    assert_eq!(state.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_no_initial_cycle_without_fetch_on_start() {
    let state = MockState::new();
    state.add_message(5, message("report", 0));

    let (mut watcher, mut events) = watcher(&state, WatchOptions::default());
    watcher.start();

    let received = events_until(&mut events, |e| matches!(e, MailEvent::Mailbox(_))).await;
    assert_eq!(kinds(&received), vec!["server:connected", "mailbox"]);
    assert_eq!(state.search_count(), 0);

    state.push(SessionSignal::NewMail);
    let received = events_until(&mut events, |e| e.kind() == "body").await;
    assert_eq!(kinds(&received), vec!["mail", "headers", "body"]);
    assert_eq!(state.search_count(), 1);

    watcher.stop().await;
}

#[tokio::test]
async fn test_flags_update_triggers_cycle() {
    let state = MockState::new();

    let (mut watcher, mut events) = watcher(&state, WatchOptions::default());
    watcher.start();
    events_until(&mut events, |e| matches!(e, MailEvent::Mailbox(_))).await;

    state.push(SessionSignal::FlagsUpdated);
    wait_until("a search ran", || state.search_count() == 1).await;

    watcher.stop().await;
}

#[tokio::test]
async fn test_connect_failure_emits_single_error() {
    let state = MockState::new();
    state.fail_connect.store(true, Ordering::SeqCst);

    let (mut watcher, mut events) = watcher(&state, watch_options());
    watcher.start();

    let event = next_event(&mut events).await;
    assert!(matches!(event, MailEvent::Error(Error::SessionClosed)));

    wait_until("the task ended", || !watcher.is_running()).await;
    assert!(drain(&mut events).is_empty());
    assert!(state.opens.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_open_failure_runs_no_cycles() {
    let state = MockState::new();
    state.fail_open.store(true, Ordering::SeqCst);
    state.add_message(1, message("never", 0));

    let (mut watcher, mut events) = watcher(&state, watch_options());
    watcher.start();

    let event = next_event(&mut events).await;
    assert!(matches!(event, MailEvent::Error(Error::OpenMailbox { .. })));

    // Signals are ignored but connection errors still surface
    state.push(SessionSignal::NewMail);
    state.push(SessionSignal::Error(Error::SessionClosed));
    let event = next_event(&mut events).await;
    assert!(matches!(event, MailEvent::Error(Error::SessionClosed)));

    assert_eq!(state.search_count(), 0);
    assert_eq!(state.fetch_count(), 0);

    watcher.stop().await;
    assert_eq!(kinds(&drain(&mut events)), vec!["server:disconnected"]);
}

#[tokio::test]
async fn test_server_close_emits_disconnected() {
    let state = MockState::new();

    let (mut watcher, mut events) = watcher(&state, WatchOptions::default());
    watcher.start();
    events_until(&mut events, |e| matches!(e, MailEvent::Mailbox(_))).await;

    state.close_from_server();

    let event = next_event(&mut events).await;
    assert!(matches!(event, MailEvent::Disconnected));
    wait_until("the task ended", || !watcher.is_running()).await;

    // Stopping an already closed watcher is harmless
    watcher.stop().await;
    assert!(drain(&mut events).is_empty());
    assert_eq!(state.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_session_error_is_forwarded_and_watching_continues() {
    let state = MockState::new();

    let (mut watcher, mut events) = watcher(&state, WatchOptions::default());
    watcher.start();
    events_until(&mut events, |e| matches!(e, MailEvent::Mailbox(_))).await;

    state.push(SessionSignal::Error(Error::SessionClosed));
    let event = next_event(&mut events).await;
    assert!(matches!(event, MailEvent::Error(Error::SessionClosed)));

    state.push(SessionSignal::NewMail);
    wait_until("a search ran", || state.search_count() == 1).await;

    watcher.stop().await;
}

#[tokio::test]
async fn test_restart_after_stop() {
    let state = MockState::new();

    let (mut watcher, mut events) = watcher(&state, WatchOptions::default());
    watcher.start();
    events_until(&mut events, |e| matches!(e, MailEvent::Mailbox(_))).await;
    watcher.stop().await;
    events_until(&mut events, |e| matches!(e, MailEvent::Disconnected)).await;
    assert!(!state.is_connected());

    watcher.start();
    let received = events_until(&mut events, |e| matches!(e, MailEvent::Mailbox(_))).await;
    assert_eq!(kinds(&received), vec!["server:connected", "mailbox"]);
    assert_eq!(state.opens.lock().unwrap().len(), 2);

    watcher.stop().await;
}

#[tokio::test]
async fn test_start_twice_is_a_no_op() {
    let state = MockState::new();

    let (mut watcher, mut events) = watcher(&state, WatchOptions::default());
    watcher.start();
    watcher.start();
    events_until(&mut events, |e| matches!(e, MailEvent::Mailbox(_))).await;

    watcher.stop().await;
    assert_eq!(state.opens.lock().unwrap().len(), 1);
    assert_eq!(kinds(&drain(&mut events)), vec!["server:disconnected"]);
}

#[tokio::test]
async fn test_dropping_watcher_closes_session() {
    let state = MockState::new();

    let (mut watcher, mut events) = watcher(&state, WatchOptions::default());
    watcher.start();
    events_until(&mut events, |e| matches!(e, MailEvent::Mailbox(_))).await;

    drop(watcher);

    let event = next_event(&mut events).await;
    assert!(matches!(event, MailEvent::Disconnected));
    assert_eq!(state.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_start_outside_runtime_emits_error() {
    let state = MockState::new();

    let (mut watcher, mut events) = watcher(&state, watch_options());
    watcher.start();

    assert!(!watcher.is_running());
    assert!(matches!(
        events.try_recv(),
        Some(MailEvent::Error(Error::NoRuntime))
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Fetching
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_identifier_in_flight_is_not_fetched_twice() {
    let state = MockState::gated();
    state.add_message(9, message("slow", 0));

    let options = WatchOptions {
        mark_seen: true,
        ..watch_options()
    };
    let (mut watcher, mut events) = watcher(&state, options);
    watcher.start();

    wait_until("the fetch started", || state.fetch_count() == 1).await;
    assert!(watcher.in_flight().contains(9));

    state.push(SessionSignal::NewMail);
    state.push(SessionSignal::NewMail);
    wait_until("both cycles searched", || state.search_count() == 3).await;
    assert_eq!(state.fetch_count(), 1);

    state.release_fetches(1);
    events_until(&mut events, |e| e.kind() == "body").await;
    wait_until("the identifier was released", || watcher.in_flight().is_empty()).await;

    // Released identifiers are fetched again by the next cycle
    state.release_fetches(1);
    state.push(SessionSignal::NewMail);
    let received = events_until(&mut events, |e| e.kind() == "body").await;
    assert_eq!(received[0].uid(), Some(9));
    assert_eq!(state.fetch_count(), 2);

    watcher.stop().await;
}

#[tokio::test]
async fn test_distinct_identifiers_fetch_concurrently() {
    let state = MockState::gated();
    state.add_message(5, message("five", 0));
    state.add_message(7, message("seven", 0));

    let (mut watcher, mut events) = watcher(&state, watch_options());
    watcher.start();

    // Both fetches are in progress while neither can finish
    wait_until("both fetches started", || state.fetch_count() == 2).await;
    assert_eq!(watcher.in_flight().len(), 2);

    state.release_fetches(2);

    let mut mailed = HashSet::new();
    while mailed.len() < 2 {
        if let MailEvent::Mail { uid, .. } = next_event(&mut events).await {
            mailed.insert(uid);
        }
    }
    assert_eq!(mailed, HashSet::from([5, 7]));

    watcher.stop().await;
}

#[tokio::test]
async fn test_fetch_failure_emits_single_error() {
    let state = MockState::new();
    state.add_message(3, message("broken", 1));
    state.failing_fetches.lock().unwrap().insert(3);

    let (mut watcher, mut events) = watcher(&state, watch_options());
    watcher.start();

    let received = events_until(&mut events, |e| e.kind() == "error").await;
    assert_eq!(kinds(&received), vec!["server:connected", "mailbox", "error"]);
    assert!(matches!(
        received[2],
        MailEvent::Error(Error::MissingBody { uid: 3 })
    ));

    wait_until("the identifier was released", || watcher.in_flight().is_empty()).await;

    watcher.stop().await;
    assert_eq!(kinds(&drain(&mut events)), vec!["server:disconnected"]);
}

#[tokio::test]
async fn test_unparseable_message_emits_single_error() {
    let state = MockState::new();
    state.add_message(4, b" Subject: folded line with no header\r\n\r\nbody".to_vec());

    let (mut watcher, mut events) = watcher(&state, watch_options());
    watcher.start();

    let received = events_until(&mut events, |e| e.kind() == "error").await;
    assert_eq!(kinds(&received), vec!["server:connected", "mailbox", "error"]);
    assert!(matches!(
        received[2],
        MailEvent::Error(Error::ParseEmail { uid: 4, .. })
    ));

    wait_until("the identifier was released", || watcher.in_flight().is_empty()).await;

    watcher.stop().await;
    assert_eq!(kinds(&drain(&mut events)), vec!["server:disconnected"]);
}

#[tokio::test]
async fn test_mark_seen_selects_and_fetches_with_seen() {
    let state = MockState::new();
    state.add_message(2, message("seen", 0));

    let options = WatchOptions {
        mark_seen: true,
        ..watch_options()
    };
    let (mut watcher, mut events) = watcher(&state, options);
    watcher.start();

    events_until(&mut events, |e| e.kind() == "body").await;

    assert_eq!(*state.opens.lock().unwrap(), vec![("INBOX".to_string(), false)]);
    assert_eq!(*state.fetches.lock().unwrap(), vec![(2, true)]);

    watcher.stop().await;
}

#[tokio::test]
async fn test_custom_search_filter_is_passed_through() {
    let state = MockState::new();

    let options = WatchOptions {
        mailbox: "Alerts".into(),
        search_filter: vec!["UNSEEN".into(), "FROM".into(), "ci@example.com".into()],
        ..watch_options()
    };
    let (mut watcher, mut events) = watcher(&state, options);
    watcher.start();

    events_until(&mut events, |e| matches!(e, MailEvent::Mailbox(_))).await;
    wait_until("the initial search ran", || state.search_count() == 1).await;

    assert_eq!(state.opens.lock().unwrap()[0].0, "Alerts");
    assert_eq!(
        state.searches.lock().unwrap()[0],
        vec!["UNSEEN", "FROM", "ci@example.com"]
    );

    watcher.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_running_fetches() {
    let state = MockState::gated();
    state.add_message(8, message("stuck", 0));

    let (mut watcher, mut events) = watcher(&state, watch_options());
    watcher.start();

    wait_until("the fetch started", || state.fetch_count() == 1).await;
    assert!(watcher.in_flight().contains(8));

    watcher.stop().await;

    assert!(watcher.in_flight().is_empty());
    let received = drain(&mut events);
    assert_eq!(
        kinds(&received),
        vec!["server:connected", "mailbox", "server:disconnected"]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Attachments
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_persisted_attachments_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let state = MockState::new();
    state.add_message(11, message("files", 2));

    let options = WatchOptions {
        attachments: AttachmentMode::Persist,
        attachment_directory: format!("{}/", dir.path().display()),
        ..watch_options()
    };
    let (mut watcher, mut events) = watcher(&state, options);
    watcher.start();

    let received = events_until(&mut events, |e| {
        matches!(e, MailEvent::Attachment { attachment, .. }
            if attachment.filename.as_deref() == Some("file-1.txt"))
    })
    .await;

    let paths: Vec<_> = received
        .iter()
        .filter_map(|e| match e {
            MailEvent::Attachment { path, .. } => path.clone(),
            _ => None,
        })
        .collect();

    assert_eq!(
        paths,
        vec![dir.path().join("file-0.txt"), dir.path().join("file-1.txt")]
    );
    assert_eq!(std::fs::read(&paths[0]).unwrap(), b"content 0");
    assert_eq!(std::fs::read(&paths[1]).unwrap(), b"content 1");

    watcher.stop().await;
}

#[tokio::test]
async fn test_buffered_attachments_carry_content_without_path() {
    let state = MockState::new();
    state.add_message(6, message("buffered", 1));

    let options = WatchOptions {
        attachments: AttachmentMode::Buffer,
        ..watch_options()
    };
    let (mut watcher, mut events) = watcher(&state, options);
    watcher.start();

    let received = events_until(&mut events, |e| e.kind() == "attachment").await;
    match received.last() {
        Some(MailEvent::Attachment {
            attachment, path, ..
        }) => {
            assert!(path.is_none());
            assert_eq!(attachment.content, b"content 0");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    watcher.stop().await;
}

#[tokio::test]
async fn test_buffer_and_disabled_emit_identical_attachments() {
    let mut observed = Vec::new();

    for mode in [AttachmentMode::Disabled, AttachmentMode::Buffer] {
        let state = MockState::new();
        state.add_message(8, message("modes", 2));

        let options = WatchOptions {
            attachments: mode,
            ..watch_options()
        };
        let (mut watcher, mut events) = watcher(&state, options);
        watcher.start();

        let received = events_until(&mut events, |e| {
            matches!(e, MailEvent::Attachment { attachment, .. }
                if attachment.filename.as_deref() == Some("file-1.txt"))
        })
        .await;
        watcher.stop().await;

        let attachments: Vec<_> = received
            .iter()
            .filter_map(|e| match e {
                MailEvent::Attachment {
                    attachment, path, ..
                } => Some((attachment.filename.clone(), attachment.content.clone(), path.clone())),
                _ => None,
            })
            .collect();
        observed.push((kinds(&received), attachments));
    }

    assert_eq!(observed[0], observed[1]);
    assert!(observed[0].1.iter().all(|(_, _, path)| path.is_none()));
}

#[tokio::test]
async fn test_attachment_write_failure_is_reported_per_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let state = MockState::new();
    state.add_message(12, message("unwritable", 2));

    let options = WatchOptions {
        attachments: AttachmentMode::Persist,
        attachment_directory: format!("{}/missing/", dir.path().display()),
        ..watch_options()
    };
    let (mut watcher, mut events) = watcher(&state, options);
    watcher.start();

    let received = events_until(&mut events, |e| e.kind() == "body").await;
    assert_eq!(kinds(&received).last(), Some(&"body"));

    let first = next_event(&mut events).await;
    let second = next_event(&mut events).await;
    assert!(matches!(first, MailEvent::Error(Error::AttachmentWrite { .. })));
    assert!(matches!(second, MailEvent::Error(Error::AttachmentWrite { .. })));

    watcher.stop().await;
    assert_eq!(kinds(&drain(&mut events)), vec!["server:disconnected"]);
}
