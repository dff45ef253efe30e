//! Redis implementation of [`Store`].
//!
//! Read-modify-write operations run as Lua scripts so they are atomic across
//! every worker and API process sharing the instance.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script, ScriptInvocation};
use tracing::debug;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::store::{Store, WindowSpec, WindowState, WriteOp};

/// Lua loop applying encoded [`WriteOp`]s to `KEYS[first..]`, reading
/// arguments from `ARGV[a..]`.
macro_rules! apply_ops_lua {
    () => {
        r#"
for k = first, #KEYS do
  local op = ARGV[a]
  if op == 'set' then
    redis.call('SET', KEYS[k], ARGV[a + 1], 'PX', ARGV[a + 2])
    a = a + 3
  elseif op == 'rpush' then
    redis.call('RPUSH', KEYS[k], ARGV[a + 1])
    a = a + 2
  elseif op == 'zadd' then
    redis.call('ZADD', KEYS[k], ARGV[a + 1], ARGV[a + 2])
    a = a + 3
  elseif op == 'zrem' then
    redis.call('ZREM', KEYS[k], ARGV[a + 1])
    a = a + 2
  elseif op == 'ztrim' then
    redis.call('ZREMRANGEBYSCORE', KEYS[k], '-inf', ARGV[a + 1])
    a = a + 2
  end
end
"#
    };
}

const COMPARE_AND_SWAP_WITH: &str = concat!(
    r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
local first, a = 2, 4
"#,
    apply_ops_lua!(),
    "return 1\n"
);

const APPLY: &str = concat!("local first, a = 1, 1\n", apply_ops_lua!(), "return 1\n");

const CLAIM_FRONT: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if id then
  redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return id
"#;

const ZMOVE_TO_LIST: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('RPUSH', KEYS[2], ARGV[1])
  return 1
end
return 0
"#;

const WINDOW_ADMIT_ALL: &str = r#"
local now = tonumber(ARGV[1])
local room = true
for k = 1, #KEYS do
  redis.call('ZREMRANGEBYSCORE', KEYS[k], '-inf', now - tonumber(ARGV[2 * k + 1]))
  if redis.call('ZCARD', KEYS[k]) >= tonumber(ARGV[2 * k + 2]) then
    room = false
  end
end
local admitted = 0
if room then
  admitted = 1
end
local states = {}
for k = 1, #KEYS do
  if room then
    redis.call('ZADD', KEYS[k], now, ARGV[2])
  end
  redis.call('PEXPIRE', KEYS[k], ARGV[2 * k + 1])
  local oldest = redis.call('ZRANGE', KEYS[k], 0, 0, 'WITHSCORES')
  local oldest_score = -1
  if oldest[2] then
    oldest_score = tonumber(oldest[2])
  end
  states[k] = {admitted, redis.call('ZCARD', KEYS[k]), oldest_score}
end
return states
"#;

/// Poll interval for [`Store::claim_front`]; the claim script cannot block.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Create from the `REDIS_URL` environment variable.
    pub fn from_env() -> QueueResult<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        Self::new(&url)
    }

    async fn conn(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::store_unavailable(e.to_string()))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn push_op(invocation: &mut ScriptInvocation<'_>, op: &WriteOp) {
    invocation.key(op.key());
    match op {
        WriteOp::SetEx { value, ttl, .. } => {
            invocation.arg("set").arg(value).arg(ttl_millis(*ttl));
        }
        WriteOp::PushBack { value, .. } => {
            invocation.arg("rpush").arg(value);
        }
        WriteOp::ZAdd { member, score, .. } => {
            invocation.arg("zadd").arg(*score).arg(member);
        }
        WriteOp::ZRem { member, .. } => {
            invocation.arg("zrem").arg(member);
        }
        WriteOp::ZRemRangeByScore { max, .. } => {
            invocation.arg("ztrim").arg(*max);
        }
    }
}

fn window_state((admitted, count, oldest): (i64, i64, i64)) -> WindowState {
    WindowState {
        admitted: admitted == 1,
        count: count.max(0) as u32,
        oldest_ms: (oldest >= 0).then_some(oldest),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap_with(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
        ops: &[WriteOp],
    ) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let script = Script::new(COMPARE_AND_SWAP_WITH);
        let mut invocation = script.prepare_invoke();
        invocation.key(key).arg(expected).arg(new).arg(ttl_millis(ttl));
        for op in ops {
            push_op(&mut invocation, op);
        }
        let swapped: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(swapped == 1)
    }

    async fn apply(&self, ops: &[WriteOp]) -> QueueResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let script = Script::new(APPLY);
        let mut invocation = script.prepare_invoke();
        for op in ops {
            push_op(&mut invocation, op);
        }
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn push_back(&self, list: &str, value: &str) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.rpush(list, value).await?)
    }

    async fn claim_front(
        &self,
        list: &str,
        claims: &str,
        score: i64,
        timeout: Duration,
    ) -> QueueResult<Option<String>> {
        let mut conn = self.conn().await?;
        let script = Script::new(CLAIM_FRONT);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let claimed: Option<String> = script
                .key(list)
                .key(claims)
                .arg(score)
                .invoke_async(&mut conn)
                .await?;
            if let Some(value) = claimed {
                debug!("Claimed {} from {}", value, list);
                return Ok(Some(value));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn list_len(&self, list: &str) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(list).await?)
    }

    async fn zrange_by_score(&self, set: &str, max: i64, limit: usize) -> QueueResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn
            .zrangebyscore_limit(set, "-inf", max, 0, limit as isize)
            .await?)
    }

    async fn zrange_last(&self, set: &str, count: usize) -> QueueResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        Ok(conn.zrange(set, -(count as isize), -1).await?)
    }

    async fn zrem(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.zrem(set, member).await?;
        Ok(removed > 0)
    }

    async fn zrem_range_by_score(&self, set: &str, max: i64) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zrembyscore(set, "-inf", max).await?)
    }

    async fn zmove_to_list(&self, set: &str, member: &str, list: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let moved: i64 = Script::new(ZMOVE_TO_LIST)
            .key(set)
            .key(list)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn zcard(&self, set: &str) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(set).await?)
    }

    async fn window_admit_all(&self, specs: &[WindowSpec], now_ms: i64) -> QueueResult<Vec<WindowState>> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let script = Script::new(WINDOW_ADMIT_ALL);
        let mut invocation = script.prepare_invoke();
        invocation.arg(now_ms).arg(format!("{}-{}", now_ms, Uuid::new_v4()));
        for spec in specs {
            invocation.key(&spec.key).arg(spec.window_ms).arg(spec.limit);
        }
        let reply: Vec<(i64, i64, i64)> = invocation.invoke_async(&mut conn).await?;
        Ok(reply.into_iter().map(window_state).collect())
    }

    async fn window_peek(&self, key: &str, now_ms: i64, window_ms: i64) -> QueueResult<WindowState> {
        let mut conn = self.conn().await?;
        let min = format!("({}", now_ms - window_ms);
        let count: i64 = conn.zcount(key, &min, "+inf").await?;
        let oldest: Vec<(String, i64)> = conn
            .zrangebyscore_limit_withscores(key, &min, "+inf", 0, 1)
            .await?;
        Ok(WindowState {
            admitted: false,
            count: count.max(0) as u32,
            oldest_ms: oldest.first().map(|(_, score)| *score),
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
