//! Redis-backed queue consumer.
//!
//! Keys derived from the queue name `q`:
//!
//! - `q`            ready list; producers `RPUSH` raw envelopes
//! - `q:processing` hand-off list between `BLMOVE` and lease registration
//! - `q:leases`     hash lease id -> stored message
//! - `q:inflight`   zset lease id -> visibility deadline (unix ms)
//! - `q:delayed`    zset stored message -> ready-at (unix ms)
//!
//! Multi-key transitions run as Lua scripts so each one is atomic. Requires
//! Redis 6.2 or newer for `BLMOVE`.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, Script};
use uuid::Uuid;

use super::{QueueConsumer, QueueMessage, QueueResult, StoredMessage};

/// Upper bound on entries moved per promotion pass.
const PROMOTE_BATCH: usize = 100;

/// Redis treats a zero `BLMOVE` timeout as "block forever".
const MIN_BLOCK_SECS: f64 = 0.01;

/// Idle blocking connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 16;

const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, entry in ipairs(due) do
    redis.call('ZREM', KEYS[2], entry)
    redis.call('LPUSH', KEYS[1], entry)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, lease in ipairs(expired) do
    local entry = redis.call('HGET', KEYS[4], lease)
    redis.call('ZREM', KEYS[3], lease)
    redis.call('HDEL', KEYS[4], lease)
    if entry then
        redis.call('LPUSH', KEYS[1], entry)
    end
end
return #due + #expired
";

const LEASE_SCRIPT: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[2])
return 1
";

const ACK_SCRIPT: &str = r"
local held = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
return held
";

const REQUEUE_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[2])
return 1
";

/// Settings for a `RedisQueue`.
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Name of the ready list producers push onto
    pub name: String,
    /// How long a popped message stays leased before it is reclaimed
    pub visibility_timeout: Duration,
}

struct Keys {
    ready: String,
    processing: String,
    leases: String,
    inflight: String,
    delayed: String,
}

impl Keys {
    fn new(name: &str) -> Self {
        Self {
            ready: name.to_string(),
            processing: format!("{name}:processing"),
            leases: format!("{name}:leases"),
            inflight: format!("{name}:inflight"),
            delayed: format!("{name}:delayed"),
        }
    }
}

struct Scripts {
    promote: Script,
    lease: Script,
    ack: Script,
    requeue: Script,
}

/// Queue consumer over Redis lists and sorted sets.
pub struct RedisQueue {
    client: Client,
    manager: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    keys: Keys,
    scripts: Scripts,
    visibility_timeout: Duration,
}

impl RedisQueue {
    pub fn new(client: Client, manager: ConnectionManager, config: RedisQueueConfig) -> Self {
        Self {
            client,
            manager,
            blocking: Mutex::new(Vec::new()),
            keys: Keys::new(&config.name),
            scripts: Scripts {
                promote: Script::new(PROMOTE_SCRIPT),
                lease: Script::new(LEASE_SCRIPT),
                ack: Script::new(ACK_SCRIPT),
                requeue: Script::new(REQUEUE_SCRIPT),
            },
            visibility_timeout: config.visibility_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.keys.ready
    }

    /// Append a raw envelope to the ready list, as a producer would.
    pub async fn push(&self, body: &[u8]) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.keys.ready)
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Move entries stranded in the processing list by a crashed consumer
    /// back to the head of the ready list. Call once before workers start.
    pub async fn recover_orphans(&self) -> QueueResult<usize> {
        let mut conn = self.manager.clone();
        let mut recovered = 0;

        loop {
            let moved: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&self.keys.processing)
                .arg(&self.keys.ready)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            tracing::warn!(queue = %self.keys.ready, recovered, "Recovered orphaned messages");
        }
        Ok(recovered)
    }

    async fn promote(&self) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let moved: i64 = self
            .scripts
            .promote
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.inflight)
            .key(&self.keys.leases)
            .arg(now_ms())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            tracing::debug!(queue = %self.keys.ready, moved, "Promoted delayed and expired messages");
        }
        Ok(())
    }

    async fn blocking_connection(&self) -> QueueResult<MultiplexedConnection> {
        let idle = self
            .blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    fn release_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }

    /// Block until an entry can be moved from ready to processing.
    async fn take(&self, timeout: Duration) -> QueueResult<Option<Vec<u8>>> {
        let mut conn = self.blocking_connection().await?;
        let raw: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(&self.keys.ready)
            .arg(&self.keys.processing)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(block_timeout_secs(timeout))
            .query_async(&mut conn)
            .await?;
        // Connections that errored are dropped by `?` above.
        self.release_blocking(conn);
        Ok(raw)
    }
}

#[async_trait]
impl QueueConsumer for RedisQueue {
    async fn pop(&self, timeout: Duration) -> QueueResult<Option<QueueMessage>> {
        self.promote().await?;

        let Some(raw) = self.take(timeout).await? else {
            return Ok(None);
        };

        let stored = StoredMessage::from_entry(&raw);
        let lease = Uuid::new_v4().to_string();
        let deadline = now_ms().saturating_add(duration_ms(self.visibility_timeout));

        let mut conn = self.manager.clone();
        let leased: i64 = self
            .scripts
            .lease
            .key(&self.keys.processing)
            .key(&self.keys.leases)
            .key(&self.keys.inflight)
            .arg(raw.as_slice())
            .arg(&lease)
            .arg(serde_json::to_string(&stored)?)
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;

        if leased == 0 {
            tracing::warn!(queue = %self.keys.ready, "Entry vanished from processing list before lease");
            return Ok(None);
        }

        Ok(Some(stored.into_message(lease)))
    }

    async fn ack(&self, message: QueueMessage) -> QueueResult<bool> {
        let mut conn = self.manager.clone();
        let held: i64 = self
            .scripts
            .ack
            .key(&self.keys.inflight)
            .key(&self.keys.leases)
            .arg(message.lease())
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    async fn requeue(&self, message: QueueMessage, delay: Duration) -> QueueResult<bool> {
        let stored = serde_json::to_string(&StoredMessage::from_message(&message))?;
        let ready_at = now_ms().saturating_add(duration_ms(delay));

        let mut conn = self.manager.clone();
        let held: i64 = self
            .scripts
            .requeue
            .key(&self.keys.inflight)
            .key(&self.keys.leases)
            .key(&self.keys.delayed)
            .arg(message.lease())
            .arg(stored)
            .arg(ready_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `BLMOVE` timeout in seconds, never zero.
fn block_timeout_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(MIN_BLOCK_SECS)
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
