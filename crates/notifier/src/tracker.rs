//! Delivery outcome counters, bucketed into fixed time windows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub start: DateTime<Utc>,
    #[serde(flatten)]
    pub counts: Counts,
}

/// Read-only view of the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerSnapshot {
    pub window_secs: u64,
    pub totals: Counts,
    /// Oldest first; windows with no activity are omitted.
    pub windows: Vec<WindowSnapshot>,
}

#[derive(Clone, Copy)]
enum Event {
    Delivered,
    Retried,
    DeadLettered,
}

struct Bucket {
    index: u64,
    counts: Counts,
}

pub struct ResultTracker {
    window: Duration,
    capacity: usize,
    started: Instant,
    started_at: DateTime<Utc>,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    buckets: Mutex<VecDeque<Bucket>>,
}

impl ResultTracker {
    /// Keep `capacity` windows of `window` width. Both must be non-zero.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            capacity: capacity.max(1),
            started: Instant::now(),
            started_at: Utc::now(),
            delivered: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            buckets: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.record(Event::Delivered);
    }

    pub(crate) fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        self.record(Event::Retried);
    }

    pub(crate) fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.record(Event::DeadLettered);
    }

    /// Lifetime totals.
    pub fn totals(&self) -> Counts {
        Counts {
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let current = self.current_index();
        let oldest = current.saturating_sub(self.capacity as u64 - 1);

        let windows = self
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|bucket| bucket.index >= oldest)
            .map(|bucket| WindowSnapshot {
                start: self.window_start(bucket.index),
                counts: bucket.counts,
            })
            .collect();

        TrackerSnapshot {
            window_secs: self.window.as_secs(),
            totals: self.totals(),
            windows,
        }
    }

    fn record(&self, event: Event) {
        let index = self.current_index();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        if buckets.back().is_none_or(|bucket| bucket.index != index) {
            buckets.push_back(Bucket {
                index,
                counts: Counts::default(),
            });
            while buckets.len() > self.capacity {
                buckets.pop_front();
            }
        }

        if let Some(bucket) = buckets.back_mut() {
            match event {
                Event::Delivered => bucket.counts.delivered += 1,
                Event::Retried => bucket.counts.retried += 1,
                Event::DeadLettered => bucket.counts.dead_lettered += 1,
            }
        }
    }

    fn current_index(&self) -> u64 {
        (self.started.elapsed().as_nanos() / self.window.as_nanos()) as u64
    }

    fn window_start(&self, index: u64) -> DateTime<Utc> {
        let offset = self.window.saturating_mul(index.min(u32::MAX as u64) as u32);
        chrono::Duration::from_std(offset)
            .ok()
            .and_then(|offset| self.started_at.checked_add_signed(offset))
            .unwrap_or(self.started_at)
    }
}
