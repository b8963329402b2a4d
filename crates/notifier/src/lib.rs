//! Push notification dispatcher.
//!
//! Drains a queue of notification envelopes and delivers them through a push
//! provider, retrying transient failures with exponential backoff and
//! dead-lettering messages that cannot be delivered.

pub mod attempt;
pub mod dead_letter;
pub mod delivery;
pub mod http;
pub mod pool;
pub mod providers;
pub mod queue;
pub mod signal;
pub mod tracker;

pub use attempt::{AttemptState, DispatchAttempt, Outcome, RetryPolicy, TransitionError};
pub use dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterKind, DeadLetterSink, MemoryDeadLetterSink,
    RedisDeadLetterSink,
};
pub use delivery::{DeliveryClient, deliver_with_timeout};
pub use pool::{DispatchConfig, WorkerPool};
pub use queue::{InMemoryQueue, QueueConsumer, QueueError, QueueMessage, RedisQueue};
pub use tracker::{Counts, ResultTracker, TrackerSnapshot};
