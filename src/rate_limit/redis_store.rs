//! Redis-backed bucket store.
//!
//! Buckets live in hashes (`refillRate`, `maxTokens`, `currentTokens`) under
//! `{prefix}{client_key}`. Every read-modify-write runs as a Lua script, so
//! Redis evaluates it atomically and concurrent balancer instances cannot
//! lose updates.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::rate_limit::bucket::{Bucket, BucketSettings, TakeOutcome};
use crate::rate_limit::store::{BucketStore, StoreError};

const FIELDS: [&str; 3] = ["refillRate", "maxTokens", "currentTokens"];

const INSERT_IF_ABSENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'refillRate', ARGV[1], 'maxTokens', ARGV[2], 'currentTokens', ARGV[3])
return 1
"#;

// -2 missing, -1 empty, otherwise tokens left after the take.
const TAKE_TOKEN: &str = r#"
local current = redis.call('HGET', KEYS[1], 'currentTokens')
if not current then
    return -2
end
if tonumber(current) <= 0 then
    return -1
end
return redis.call('HINCRBY', KEYS[1], 'currentTokens', -1)
"#;

const REFILL: &str = r#"
local v = redis.call('HMGET', KEYS[1], 'refillRate', 'maxTokens', 'currentTokens')
if not v[3] then
    return nil
end
local max = tonumber(v[2])
local current = tonumber(v[3])
if current < max then
    current = current + 1
end
if current > max then
    current = max
end
if current < 0 then
    current = 0
end
redis.call('HSET', KEYS[1], 'currentTokens', current)
return {tonumber(v[1]), max, current}
"#;

const UPDATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return nil
end
if ARGV[1] ~= '' then
    redis.call('HSET', KEYS[1], 'refillRate', ARGV[1])
end
if ARGV[2] ~= '' then
    redis.call('HSET', KEYS[1], 'maxTokens', ARGV[2])
end
local v = redis.call('HMGET', KEYS[1], 'refillRate', 'maxTokens', 'currentTokens')
local max = tonumber(v[2])
local current = tonumber(v[3])
if current > max then
    current = max
    redis.call('HSET', KEYS[1], 'currentTokens', current)
end
return {tonumber(v[1]), max, current}
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    insert_script: Script,
    take_script: Script,
    refill_script: Script,
    update_script: Script,
}

impl RedisStore {
    /// Connect and verify the server answers. Fails fast when Redis is unreachable.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            conn,
            prefix: prefix.into(),
            insert_script: Script::new(INSERT_IF_ABSENT),
            take_script: Script::new(TAKE_TOKEN),
            refill_script: Script::new(REFILL),
            update_script: Script::new(UPDATE),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn bucket_from_triple(key: &str, values: Vec<i64>) -> Result<Bucket, StoreError> {
    match values.as_slice() {
        &[rate, max_tokens, current] => Ok(Bucket {
            rate: u64::try_from(rate).map_err(|_| StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("negative refill rate {rate}"),
            })?,
            max_tokens,
            current,
        }),
        other => Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("expected 3 fields, got {}", other.len()),
        }),
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn find(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let mut conn = self.conn.clone();
        let values: Vec<Option<i64>> = conn.hget(self.full_key(key), FIELDS.to_vec()).await?;

        if values.iter().all(Option::is_none) {
            return Ok(None);
        }
        let values: Option<Vec<i64>> = values.into_iter().collect();
        match values {
            Some(values) => bucket_from_triple(key, values).map(Some),
            None => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: "missing bucket field".to_string(),
            }),
        }
    }

    async fn insert_if_absent(&self, key: &str, bucket: Bucket) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let inserted: i64 = self
            .insert_script
            .key(self.full_key(key))
            .arg(bucket.rate)
            .arg(bucket.max_tokens)
            .arg(bucket.current)
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn take_token(&self, key: &str) -> Result<TakeOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .take_script
            .key(self.full_key(key))
            .invoke_async(&mut conn)
            .await?;

        Ok(match result {
            -2 => TakeOutcome::Missing,
            -1 => TakeOutcome::Empty,
            remaining => TakeOutcome::Taken { remaining },
        })
    }

    async fn refill(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let mut conn = self.conn.clone();
        let values: Option<Vec<i64>> = self
            .refill_script
            .key(self.full_key(key))
            .invoke_async(&mut conn)
            .await?;
        values.map(|v| bucket_from_triple(key, v)).transpose()
    }

    async fn update(&self, key: &str, settings: BucketSettings) -> Result<Option<Bucket>, StoreError> {
        let mut conn = self.conn.clone();
        let rate = settings.rate.map(|r| r.to_string()).unwrap_or_default();
        let max = settings.max_tokens.map(|m| m.to_string()).unwrap_or_default();
        let values: Option<Vec<i64>> = self
            .update_script
            .key(self.full_key(key))
            .arg(rate)
            .arg(max)
            .invoke_async(&mut conn)
            .await?;
        values.map(|v| bucket_from_triple(key, v)).transpose()
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", self.prefix))
            .query_async(&mut conn)
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}
