use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{DurableQueue, QueueMessage, DEFAULT_MAX_DEQUEUE_COUNT};
use crate::types::AckHandle;

// KEYS: visible zset, counts, receipts, bodies
// ARGV: now_ms, max, hidden_until_ms, max_dequeue, receipt_prefix
const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local claimed = {}
for i, id in ipairs(ids) do
  local count = tonumber(redis.call('HGET', KEYS[2], id) or '0')
  local body = redis.call('HGET', KEYS[4], id)
  if count >= tonumber(ARGV[4]) or not body then
    redis.call('ZREM', KEYS[1], id)
    redis.call('HDEL', KEYS[2], id)
    redis.call('HDEL', KEYS[3], id)
    redis.call('HDEL', KEYS[4], id)
  else
    local receipt = ARGV[5] .. ':' .. i
    redis.call('ZADD', KEYS[1], ARGV[3], id)
    redis.call('HSET', KEYS[2], id, count + 1)
    redis.call('HSET', KEYS[3], id, receipt)
    table.insert(claimed, id)
    table.insert(claimed, receipt)
    table.insert(claimed, tostring(count + 1))
    table.insert(claimed, body)
  end
end
return claimed
"#;

// KEYS: visible zset, counts, receipts, bodies
// ARGV: id, receipt
const DELETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

/// Durable queue on Redis.
///
/// Visibility is a sorted set scored by the epoch millisecond at which each
/// message becomes claimable again. Claims and deletes run as Lua scripts so
/// concurrent workers never hand out or remove the same claim twice.
pub struct RedisQueue {
    client: redis::Client,
    prefix: String,
    max_dequeue_count: u32,
    claim: redis::Script,
    delete: redis::Script,
}

impl RedisQueue {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            max_dequeue_count: DEFAULT_MAX_DEQUEUE_COUNT,
            claim: redis::Script::new(CLAIM_SCRIPT),
            delete: redis::Script::new(DELETE_SCRIPT),
        }
    }

    pub fn with_max_dequeue_count(mut self, count: u32) -> Self {
        self.max_dequeue_count = count.max(1);
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}:queue:{}", self.prefix, name)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, QueueError> {
        self.client.get_tokio_connection().await.map_err(backend)
    }
}

fn backend(err: redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
impl DurableQueue for RedisQueue {
    async fn add_messages(&self, bodies: Vec<String>) -> Result<(), QueueError> {
        if bodies.is_empty() {
            return Ok(());
        }

        let now = now_millis();
        let visible = self.key("visible");
        let stored = self.key("bodies");

        let mut pipe = redis::pipe();
        pipe.atomic();
        for body in bodies {
            let id = Uuid::new_v4().simple().to_string();
            pipe.hset(&stored, &id, body).ignore();
            pipe.zadd(&visible, &id, now).ignore();
        }

        let mut conn = self.connection().await?;
        pipe.query_async::<_, ()>(&mut conn).await.map_err(backend)
    }

    async fn get_messages(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = now_millis();
        let hidden_until = now.saturating_add(visibility_timeout.as_millis() as u64);
        let receipt_prefix = Uuid::new_v4().simple().to_string();

        let mut conn = self.connection().await?;
        let flat: Vec<String> = self
            .claim
            .key(self.key("visible"))
            .key(self.key("counts"))
            .key(self.key("receipts"))
            .key(self.key("bodies"))
            .arg(now)
            .arg(max)
            .arg(hidden_until)
            .arg(self.max_dequeue_count)
            .arg(receipt_prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        Ok(flat
            .chunks_exact(4)
            .map(|fields| QueueMessage {
                handle: AckHandle {
                    message_id: fields[0].clone(),
                    receipt: fields[1].clone(),
                },
                dequeue_count: fields[2].parse().unwrap_or(1),
                body: fields[3].clone(),
            })
            .collect())
    }

    async fn delete_message(&self, handle: &AckHandle) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .delete
            .key(self.key("visible"))
            .key(self.key("counts"))
            .key(self.key("receipts"))
            .key(self.key("bodies"))
            .arg(&handle.message_id)
            .arg(&handle.receipt)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed == 1)
    }
}
