//! In-process queue with the same lease semantics as the Redis queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueConsumer, QueueMessage, QueueResult};

struct Entry {
    id: Uuid,
    attempts: u32,
    body: Vec<u8>,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Entry>,
    inflight: HashMap<String, (Entry, Instant)>,
    delayed: Vec<(Instant, Entry)>,
}

impl State {
    /// Move due delayed entries and expired leases back to the ready head.
    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, entry) = self.delayed.swap_remove(i);
                self.ready.push_front(entry);
            } else {
                i += 1;
            }
        }

        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(lease, _)| lease.clone())
            .collect();
        for lease in expired {
            if let Some((entry, _)) = self.inflight.remove(&lease) {
                tracing::debug!(message_id = %entry.id, "Visibility timeout elapsed, message reclaimed");
                self.ready.push_front(entry);
            }
        }
    }

    /// Earliest instant at which `promote` would change something.
    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let leases = self.inflight.values().map(|(_, deadline)| *deadline);
        delayed.chain(leases).min()
    }
}

/// Number of messages in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub inflight: usize,
    pub delayed: usize,
}

/// Queue held entirely in memory, timed on `tokio::time::Instant`.
pub struct InMemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Append a raw envelope to the tail of the ready list.
    pub fn push(&self, body: impl Into<Vec<u8>>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().ready.push_back(Entry {
            id,
            attempts: 0,
            body: body.into(),
        });
        self.notify.notify_one();
        id
    }

    pub fn depth(&self) -> QueueDepth {
        let state = self.lock();
        QueueDepth {
            ready: state.ready.len(),
            inflight: state.inflight.len(),
            delayed: state.delayed.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lease(&self) -> Result<QueueMessage, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.lock();
        state.promote(now);

        match state.ready.pop_front() {
            Some(entry) => {
                let lease = Uuid::new_v4().to_string();
                let message =
                    QueueMessage::new(entry.id, lease.clone(), entry.body.clone(), entry.attempts);
                state
                    .inflight
                    .insert(lease, (entry, now + self.visibility_timeout));
                Ok(message)
            }
            None => Err(state.next_wakeup()),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl QueueConsumer for InMemoryQueue {
    async fn pop(&self, timeout: Duration) -> QueueResult<Option<QueueMessage>> {
        let deadline = Instant::now() + timeout;

        loop {
            let wakeup = match self.try_lease() {
                Ok(message) => return Ok(Some(message)),
                Err(wakeup) => wakeup,
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let until = wakeup.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }

    async fn ack(&self, message: QueueMessage) -> QueueResult<bool> {
        Ok(self.lock().inflight.remove(message.lease()).is_some())
    }

    async fn requeue(&self, message: QueueMessage, delay: Duration) -> QueueResult<bool> {
        let mut state = self.lock();
        let Some((mut entry, _)) = state.inflight.remove(message.lease()) else {
            return Ok(false);
        };
        entry.attempts = message.attempts();

        if delay.is_zero() {
            state.ready.push_back(entry);
            drop(state);
            self.notify.notify_one();
        } else {
            state.delayed.push((Instant::now() + delay, entry));
        }
        Ok(true)
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}
