//! Delayed actions of the session controller.
//!
//! The scheduler only keeps deadlines; the controller polls [`Scheduler::next_deadline`] in its
//! event loop and fires what [`Scheduler::pop_due`] returns, so a trigger never runs concurrently
//! with an event handler.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Something the controller does later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Ask the server to start the lobby without waiting for more players.
    ForceStart,
    /// Adjust the options of the custom lobby.
    CustomOptions,
    /// Post a chat line in a round.
    Chat {
        /// Chat room of the round.
        room: String,
        /// Line to post.
        text: String,
    },
}

/// Handle on a scheduled trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

/// Pending triggers ordered by deadline, then by scheduling order.
#[derive(Debug, Default)]
pub struct Scheduler {
    next_id: u64,
    pending: BTreeMap<(Instant, TaskId), Trigger>,
}

impl Scheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `trigger` once `delay` elapsed from `now`.
    pub fn schedule(&mut self, now: Instant, delay: Duration, trigger: Trigger) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.pending.insert((now + delay, id), trigger);
        id
    }

    /// Cancel a trigger. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let key = self.pending.keys().find(|(_, task)| *task == id).copied();
        key.and_then(|key| self.pending.remove(&key)).is_some()
    }

    /// Cancel everything.
    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    /// True if `id` has not fired nor been cancelled.
    pub fn is_pending(&self, id: TaskId) -> bool {
        self.pending.keys().any(|(_, task)| *task == id)
    }

    /// Number of pending triggers.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every trigger due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TaskId, Trigger)> {
        let mut due = vec![];
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), trigger) = entry.remove_entry();
            due.push((id, trigger));
        }
        due
    }
}
