//! Identifiers whose fetch-and-parse task is currently running.
//!
//! Claiming an identifier is one atomic check-and-insert, and the returned
//! [`Claim`] removes it again when dropped. A task therefore releases its
//! identifier exactly once whichever way it ends: success, error, panic or
//! cancellation.

use crate::mailbox::Uid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Shared set of in-flight message identifiers.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    uids: Arc<Mutex<HashSet<Uid>>>,
}

impl InFlight {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `uid` unless it is already present.
    ///
    /// Returns `None` when another task holds the identifier.
    #[must_use]
    pub fn try_claim(&self, uid: Uid) -> Option<Claim> {
        if self.lock().insert(uid) {
            trace!(uid, "claimed");
            Some(Claim {
                uid,
                set: self.clone(),
            })
        } else {
            None
        }
    }

    /// Returns `true` if `uid` is currently in flight.
    #[must_use]
    pub fn contains(&self, uid: Uid) -> bool {
        self.lock().contains(&uid)
    }

    /// Number of identifiers in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn release(&self, uid: Uid) {
        self.lock().remove(&uid);
        trace!(uid, "released");
    }

    // The set stays consistent even if a holder panicked mid-operation.
    fn lock(&self) -> MutexGuard<'_, HashSet<Uid>> {
        self.uids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one identifier; released on drop.
#[derive(Debug)]
pub struct Claim {
    uid: Uid,
    set: InFlight,
}

impl Claim {
    /// The claimed identifier.
    #[must_use]
    pub fn uid(&self) -> Uid {
        self.uid
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.set.release(self.uid);
    }
}
