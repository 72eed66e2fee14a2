//! Cancellable delayed-job scheduler.
//!
//! `run_after` registers a job and returns an id that can be cancelled or
//! queried while the job is still pending. Due jobs are delivered to an
//! mpsc channel; the consumer (the engine's dispatcher) decides how to run
//! them. Scheduled work is in-memory only — after a process restart the
//! recovery sweep re-derives whatever was lost from the persistent records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledState {
    Pending,
    /// Fired or cancelled; the scheduler keeps no terminal records.
    Gone,
}

struct Entry {
    handle: tokio::task::JoinHandle<()>,
}

/// Scheduler for jobs of type `J`. Cloneable; all clones share one entry
/// table and one delivery channel.
pub struct Scheduler<J> {
    tx: mpsc::UnboundedSender<(Uuid, J)>,
    entries: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl<J> Clone for Scheduler<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<J: Send + 'static> Scheduler<J> {
    /// Create a scheduler and the receiving end of its delivery channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Uuid, J)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                entries: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Schedule `job` to be delivered after `delay_ms`. Must be called from
    /// within a tokio runtime.
    pub fn run_after(&self, delay_ms: u64, job: J) -> Uuid {
        let id = Uuid::new_v4();
        let tx = self.tx.clone();
        let entries = self.entries.clone();
        let handle = tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            // Leave the pending set before delivery so `is_pending` is
            // false by the time the consumer observes the job.
            entries.lock().remove(&id);
            let _ = tx.send((id, job));
        });
        self.entries.lock().insert(id, Entry { handle });
        id
    }

    /// Cancel a pending job. Returns whether it was still pending.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.entries.lock().remove(id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: &Uuid) -> ScheduledState {
        if self.entries.lock().contains_key(id) {
            ScheduledState::Pending
        } else {
            ScheduledState::Gone
        }
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.state(id) == ScheduledState::Pending
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }
}
