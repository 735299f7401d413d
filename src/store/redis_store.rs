//! Redis-backed counter store.
//!
//! Windows are sorted sets scored by epoch milliseconds, one member per
//! admitted request. Blacklist and whitelist flags are plain keys with a `PX`
//! TTL, so Redis expires every record on its own.
//!
//! ## Atomic and pipelined paths
//!
//! `check_and_record` runs a Lua script that prunes, counts and conditionally
//! adds in one server-side step. Deployments whose Redis-compatible store
//! rejects `EVAL` disable scripting; the engine then falls back to
//! `prune_and_count` followed by `record`, two round trips that other callers
//! can interleave with.
//!
//! ## Connecting
//!
//! `connect_lazy` returns at once and establishes the connection in the
//! background, retrying with backoff. Until it exists every operation fails
//! with `StoreUnavailable`, which the admission layer serves degraded.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{window_floor, CounterStore, WindowOutcome, WindowSnapshot};
use crate::error::{BouncerError, Result};

const CHECK_AND_RECORD_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

if count >= limit then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local reset = now + window
    if oldest[2] then
        reset = tonumber(oldest[2]) + window
    end
    return {0, count, reset}
end

redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, window)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {1, count + 1, tonumber(oldest[2]) + window}
"#;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every key (default: "bouncer:")
    pub key_prefix: String,
    /// Use the Lua script for check-and-record (default: true)
    pub scripting: bool,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "bouncer:".to_string(),
            scripting: true,
        }
    }
}

/// Counter store shared by every instance connected to the same Redis.
pub struct RedisStore {
    connection: Arc<OnceCell<ConnectionManager>>,
    config: RedisStoreConfig,
    script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect with custom configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await.map_err(|e| {
            BouncerError::StoreUnavailable(format!("could not connect to Redis: {}", e))
        })?;

        debug!(
            prefix = %config.key_prefix,
            scripting = config.scripting,
            "Connected to Redis counter store"
        );

        Ok(Self::with_cell(
            Arc::new(OnceCell::new_with(Some(connection))),
            config,
        ))
    }

    /// Create the store without waiting for Redis.
    ///
    /// The connection is established by a background task that retries until
    /// it succeeds or the store is dropped. Must be called within a Tokio
    /// runtime.
    ///
    /// # Errors
    /// Returns error only if the URL is invalid.
    pub fn connect_lazy(url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = Arc::new(OnceCell::new());
        tokio::spawn(establish(client, Arc::downgrade(&connection)));
        Ok(Self::with_cell(connection, config))
    }

    fn with_cell(connection: Arc<OnceCell<ConnectionManager>>, config: RedisStoreConfig) -> Self {
        Self {
            connection,
            config,
            script: Script::new(CHECK_AND_RECORD_LUA),
        }
    }

    /// Whether the connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.connection.get().cloned().ok_or_else(|| {
            BouncerError::StoreUnavailable("Redis connection not established".to_string())
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

/// Retry the initial connection with capped exponential backoff.
async fn establish(client: Client, cell: Weak<OnceCell<ConnectionManager>>) {
    let mut delay = INITIAL_RETRY_DELAY;
    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(connection) => {
                if let Some(cell) = cell.upgrade() {
                    let _ = cell.set(connection);
                    info!("Connected to Redis counter store");
                }
                return;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Redis unreachable, serving degraded until connected"
                );
            }
        }

        tokio::time::sleep(delay).await;
        if cell.strong_count() == 0 {
            debug!("Redis store dropped before connecting");
            return;
        }
        delay = (delay * 2).min(MAX_RETRY_DELAY);
    }
}

fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| BouncerError::Invariant(format!("{} must not be negative, got {}", what, value)))
}

/// Decode the `{admitted, count, reset_at}` reply of the Lua script.
fn parse_script_reply(reply: &[i64]) -> Result<WindowOutcome> {
    match reply {
        [admitted, count, reset_at] => Ok(WindowOutcome {
            admitted: *admitted == 1,
            current_count: non_negative(*count, "window count")?,
            reset_at: non_negative(*reset_at, "window reset")?,
        }),
        other => Err(BouncerError::Invariant(format!(
            "check-and-record script returned {} values, expected 3",
            other.len()
        ))),
    }
}

/// Read the oldest score out of a flat `ZRANGE .. WITHSCORES` reply.
fn parse_oldest(reply: &[String]) -> Result<Option<u64>> {
    match reply.get(1) {
        None => Ok(None),
        Some(score) => score
            .parse::<f64>()
            .ok()
            .filter(|s| *s >= 0.0)
            .map(|s| Some(s as u64))
            .ok_or_else(|| BouncerError::Invariant(format!("unreadable window score {:?}", score))),
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn supports_scripting(&self) -> bool {
        self.config.scripting
    }

    async fn check_and_record(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u64,
        now_ms: u64,
        member: &str,
    ) -> Result<WindowOutcome> {
        if !self.config.scripting {
            return Err(BouncerError::Unsupported("server-side scripting"));
        }

        let mut conn = self.connection()?;
        let reply: Vec<i64> = self
            .script
            .key(self.key(key))
            .arg(now_ms)
            .arg(window_ms)
            .arg(max_requests)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        parse_script_reply(&reply)
    }

    async fn prune_and_count(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowSnapshot> {
        let key = self.key(key);
        let mut conn = self.connection()?;

        let (count, oldest): (i64, Vec<String>) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(window_floor(window_ms, now_ms))
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        Ok(WindowSnapshot {
            count: non_negative(count, "window count")?,
            oldest: parse_oldest(&oldest)?,
        })
    }

    async fn record(&self, key: &str, window_ms: u64, now_ms: u64, member: &str) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.connection()?;

        let _: () = redis::pipe()
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
        member: &str,
    ) -> Result<u64> {
        let key = self.key(key);
        let mut conn = self.connection()?;

        // Unconditional, so MULTI/EXEC is enough to keep it indivisible
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(window_floor(window_ms, now_ms))
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        non_negative(count, "violation count")
    }

    async fn set_expiring(&self, key: &str, ttl_ms: u64, _now_ms: u64) -> Result<()> {
        let mut conn = self.connection()?;

        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn expires_at(&self, key: &str, now_ms: u64) -> Result<Option<u64>> {
        let mut conn = self.connection()?;

        let pttl: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;

        Ok(match pttl {
            // Key does not exist
            -2 => None,
            // Key exists without a TTL
            -1 => Some(u64::MAX),
            ttl if ttl > 0 => Some(now_ms.saturating_add(ttl as u64)),
            _ => None,
        })
    }
}
