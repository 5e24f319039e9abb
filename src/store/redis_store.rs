//! Redis-backed counter store.
//!
//! The bucket transaction runs as a server-side Lua script, so read,
//! refill, consume and write happen atomically inside Redis and use the
//! Redis clock for every worker.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, info};

use super::CounterStore;
use crate::error::{Result, TollboothError};
use crate::ratelimit::bucket::{decide, BucketDecision, BucketParams, BucketState};

/// Hash fields of a bucket record, in the order the scan reads them.
const FIELDS: [&str; 5] = ["tokens", "last_update", "limit", "window", "capacity"];

/// Keys requested per SCAN round trip.
const SCAN_BATCH: usize = 500;

/// KEYS[1] = bucket key
/// ARGV = limit, window_secs, capacity, cost, ttl_secs
/// Returns {allowed (0|1), tokens_remaining, now}
const CONSUME_SCRIPT: &str = r#"
if redis.replicate_commands then redis.replicate_commands() end

local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_update')
local tokens = tonumber(state[1])
local last_update = tonumber(state[2])
if tokens == nil or last_update == nil then
  tokens = capacity
  last_update = now
end

local elapsed = math.max(0, now - last_update)
tokens = math.min(capacity, tokens + elapsed * (limit / window))

local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end

redis.call('HSET', KEYS[1],
  'tokens', string.format('%.17g', tokens),
  'last_update', string.format('%.17g', now),
  'limit', limit,
  'window', window,
  'capacity', string.format('%.17g', capacity))
redis.call('EXPIRE', KEYS[1], ttl)

return {allowed, string.format('%.17g', tokens), string.format('%.17g', now)}
"#;

/// Counter store backed by a shared Redis instance.
pub struct RedisStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to Redis counter store");
        let client = Client::open(url).map_err(unavailable("connect"))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(unavailable("connect"))?;
        Ok(Self {
            conn,
            script: Script::new(CONSUME_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn consume(&self, key: &str, params: &BucketParams, cost: f64) -> Result<BucketDecision> {
        let mut conn = self.conn.clone();
        let (allowed, tokens, now): (i64, f64, f64) = self
            .script
            .key(key)
            .arg(params.limit)
            .arg(params.window_secs)
            .arg(params.capacity)
            .arg(cost)
            .arg(params.ttl_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable("consume"))?;

        Ok(decide(allowed == 1, tokens, params, cost, now))
    }

    async fn now(&self) -> Result<f64> {
        let mut conn = self.conn.clone();
        let (secs, micros): (u64, u64) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(unavailable("now"))?;
        Ok(secs as f64 + micros as f64 / 1_000_000.0)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, BucketState)>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(prefix));

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable("scan"))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.cmd("HMGET").arg(key).arg(&FIELDS[..]);
        }
        let rows: Vec<Vec<Option<f64>>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(unavailable("scan"))?;

        let records: Vec<(String, BucketState)> = keys
            .into_iter()
            .zip(rows)
            .filter_map(|(key, row)| parse_record(&row).map(|state| (key, state)))
            .collect();

        debug!(prefix = %prefix, count = records.len(), "Scanned Redis buckets");
        Ok(records)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let deleted: usize = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(unavailable("delete"))?;
        Ok(deleted)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

fn unavailable(operation: &'static str) -> impl FnOnce(RedisError) -> TollboothError {
    move |err| TollboothError::StoreUnavailable {
        operation,
        reason: err.to_string(),
    }
}

/// Build a bucket from an `HMGET` row; records that expired between SCAN
/// and HMGET come back as all-nil and are skipped.
fn parse_record(row: &[Option<f64>]) -> Option<BucketState> {
    match row {
        [Some(tokens), Some(last_update), Some(limit), Some(window), Some(capacity)] => {
            Some(BucketState {
                tokens: *tokens,
                last_update: *last_update,
                limit: *limit as u64,
                window_secs: *window as u64,
                capacity: *capacity,
            })
        }
        _ => None,
    }
}

/// Escape glob metacharacters so `prefix` matches literally in SCAN MATCH.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
