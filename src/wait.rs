//! Suspension primitive for stalled requests.
//!
//! A handler that cannot make progress parks a [`Wait`] on one or more wait
//! queues and returns to the reactor. Each queue release decrements the
//! wait's usage count; when it reaches zero the wait's action fires exactly
//! once and the saved work is replayed. A wait parked on several queues
//! therefore fires only after every queue has released it, provided the
//! registrar incremented the count once per additional queue.
//!
//! Queues hold shared handles; a killed wait never fires and is dropped
//! lazily by whichever queues still hold it.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::lookup::Lookup;
use crate::proto::RequestEnvelope;

/// Work replayed when a wait fires.
#[derive(Debug)]
pub enum WaitAction {
    /// Re-dispatch a saved request, resuming a saved lookup if one exists.
    Replay {
        /// The saved request.
        envelope: RequestEnvelope,
        /// Lookup state preserved across the stall, if any.
        lookup: Option<Lookup>,
    },
    /// Re-enter commit processing for an in-flight commit.
    ApplyCommit {
        /// Identifier of the commit to resume.
        commit_id: u64,
    },
}

impl WaitAction {
    /// The saved request, when this action replays one.
    pub fn envelope(&self) -> Option<&RequestEnvelope> {
        match self {
            WaitAction::Replay { envelope, .. } => Some(envelope),
            WaitAction::ApplyCommit { .. } => None,
        }
    }
}

/// A parked continuation with a usage count.
#[derive(Debug)]
pub struct Wait {
    usecount: AtomicU32,
    action: Mutex<Option<WaitAction>>,
}

/// Shared handle to a wait; queues and registrars hold these.
pub type WaitRef = Arc<Wait>;

impl Wait {
    /// Create a wait with usage count 1.
    pub fn create(action: WaitAction) -> WaitRef {
        Arc::new(Wait {
            usecount: AtomicU32::new(1),
            action: Mutex::new(Some(action)),
        })
    }

    /// Pin the wait for one more queue.
    pub fn increment(&self) {
        self.usecount.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one pin. Returns the action when the count reaches zero.
    pub fn decrement(&self) -> Option<WaitAction> {
        let prev = self.usecount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "wait released more times than pinned");
        if prev == 1 {
            self.action.lock().take()
        } else {
            None
        }
    }

    /// Current usage count.
    pub fn usecount(&self) -> u32 {
        self.usecount.load(Ordering::Relaxed)
    }

    /// Drop the action so the wait can never fire.
    pub fn kill(&self) {
        self.action.lock().take();
    }

    /// Whether the wait has fired or been killed.
    pub fn is_dead(&self) -> bool {
        self.action.lock().is_none()
    }

    /// Apply a predicate to the saved request, if the wait is alive and
    /// replays one.
    pub fn matches_request<F>(&self, pred: F) -> bool
    where
        F: Fn(&RequestEnvelope) -> bool,
    {
        let guard = self.action.lock();
        match guard.as_ref().and_then(|a| a.envelope()) {
            Some(envelope) => pred(envelope),
            None => false,
        }
    }
}

/// A queue of parked waits.
#[derive(Debug, Default)]
pub struct WaitQueue {
    queue: Vec<WaitRef>,
}

impl WaitQueue {
    /// An empty queue.
    pub fn new() -> Self {
        WaitQueue::default()
    }

    /// Append a wait. The usage count is not changed here; registrars pin
    /// the wait themselves when parking it on more than one queue.
    pub fn push(&mut self, wait: &WaitRef) {
        self.queue.push(wait.clone());
    }

    /// Number of live waits on the queue.
    pub fn len(&self) -> usize {
        self.queue.iter().filter(|w| !w.is_dead()).count()
    }

    /// Whether the queue holds no live waits.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every wait on the queue, returning the actions of those whose
    /// count reached zero. The queue is emptied; waits still pinned
    /// elsewhere survive through their other queues.
    pub fn run(&mut self) -> Vec<WaitAction> {
        let mut fired = Vec::new();
        for wait in self.queue.drain(..) {
            if wait.is_dead() {
                continue;
            }
            if let Some(action) = wait.decrement() {
                fired.push(action);
            }
        }
        fired
    }

    /// Kill and remove every live wait whose saved request matches `pred`.
    /// Returns how many were destroyed. A destroyed wait never fires, on
    /// this queue or any other.
    pub fn destroy_msg<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&RequestEnvelope) -> bool,
    {
        let mut destroyed = 0;
        self.queue.retain(|wait| {
            if wait.is_dead() {
                return false;
            }
            if wait.matches_request(&pred) {
                wait.kill();
                destroyed += 1;
                return false;
            }
            true
        });
        destroyed
    }
}
