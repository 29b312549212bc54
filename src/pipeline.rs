//! Search-and-fetch cycles.
//!
//! A cycle searches the mailbox and spawns one fetch task per identifier
//! that is not already in flight. Tasks run concurrently and are tracked so
//! the watcher can cancel them on stop.

use crate::config::WatchOptions;
use crate::event::EventSink;
use crate::fetch::{self, FetchContext};
use crate::inflight::InFlight;
use crate::mailbox::MailboxSession;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

pub(crate) struct Pipeline<S> {
    ctx: FetchContext<S>,
    in_flight: InFlight,
    tasks: Mutex<JoinSet<()>>,
}

impl<S: MailboxSession> Pipeline<S> {
    pub(crate) fn new(
        session: Arc<S>,
        options: Arc<WatchOptions>,
        in_flight: InFlight,
        sink: EventSink,
    ) -> Self {
        Self {
            ctx: FetchContext {
                session,
                options,
                sink,
            },
            in_flight,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Runs one search and dispatches a task per new identifier.
    ///
    /// Returns the number of tasks dispatched.
    #[instrument(
        name = "pipeline::run_cycle",
        skip_all,
        fields(criteria = %self.ctx.options.search_query())
    )]
    pub(crate) async fn run_cycle(&self) -> usize {
        let uids = match self.ctx.session.search(&self.ctx.options.search_filter).await {
            Ok(uids) => uids,
            Err(e) => {
                warn!(error = %e, "Search failed");
                self.ctx.sink.error(e);
                return 0;
            }
        };

        debug!(found = uids.len(), "Search complete");

        let mut tasks = self.lock_tasks();
        reap_finished(&mut tasks);

        let mut dispatched = 0;
        for uid in uids {
            let Some(claim) = self.in_flight.try_claim(uid) else {
                debug!(uid, "Already in flight, skipping");
                continue;
            };
            tasks.spawn(fetch::process_message(self.ctx.clone(), claim));
            dispatched += 1;
        }

        debug!(dispatched, in_flight = self.in_flight.len(), "Cycle dispatched");
        dispatched
    }

    /// Aborts all running tasks and waits until they are gone.
    ///
    /// Aborted tasks release their identifiers.
    pub(crate) async fn cancel(&self) {
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        if !tasks.is_empty() {
            debug!(tasks = tasks.len(), "Cancelling fetch tasks");
        }
        tasks.shutdown().await;
    }

    /// Lets running tasks finish on their own.
    pub(crate) fn detach(&self) {
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        tasks.detach_all();
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                warn!(error = %e, "Fetch task panicked");
            }
        }
    }
}
