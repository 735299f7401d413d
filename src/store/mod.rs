//! Shared counter store protocol and backends.
//!
//! The engine keeps no state of its own: every window, violation record,
//! blacklist and whitelist entry lives in a [`CounterStore`]. The protocol is
//! the subset of a Redis-compatible store the engine needs:
//!
//! - an ordered set of timestamps per key, with range removal by score and a
//!   cardinality query
//! - a TTL per key
//! - optionally, server-side scripting so that prune, count and record can run
//!   as one indivisible operation
//!
//! Every primitive receives the caller's `now` so that backends without native
//! TTLs can expire entries lazily against the same clock the engine uses.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BouncerError, Result};

/// Result of a check-and-record against one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request was counted
    pub admitted: bool,
    /// Requests in the window after this call
    pub current_count: u64,
    /// Epoch ms at which the oldest counted request leaves the window
    pub reset_at: u64,
}

/// State of a window after pruning, before any new timestamp is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSnapshot {
    /// Timestamps still inside the window
    pub count: u64,
    /// Oldest timestamp still inside the window
    pub oldest: Option<u64>,
}

impl WindowSnapshot {
    /// When the oldest counted request expires, freeing one slot.
    pub fn reset_at(&self, window_ms: u64, now_ms: u64) -> u64 {
        self.oldest.unwrap_or(now_ms).saturating_add(window_ms)
    }
}

/// Timestamps at or below this score are outside the trailing window.
///
/// Signed so that a window reaching back before the epoch expires nothing.
/// Saturates rather than wrapping when either value exceeds `i64::MAX`.
pub fn window_floor(window_ms: u64, now_ms: u64) -> i64 {
    let now = i64::try_from(now_ms).unwrap_or(i64::MAX);
    let window = i64::try_from(window_ms).unwrap_or(i64::MAX);
    now.saturating_sub(window)
}

/// Storage key layout shared by all backends.
pub(crate) mod keys {
    pub fn window(key: &str) -> String {
        format!("window:{}", key)
    }

    pub fn violations(key: &str) -> String {
        format!("violations:{}", key)
    }

    pub fn blacklist(key: &str) -> String {
        format!("blacklist:{}", key)
    }

    pub fn whitelist(key: &str) -> String {
        format!("whitelist:{}", key)
    }
}

/// Primitive operations of the shared counter store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether [`CounterStore::check_and_record`] runs as one atomic operation.
    fn supports_scripting(&self) -> bool {
        false
    }

    /// Prune, count and conditionally record in a single indivisible step.
    async fn check_and_record(
        &self,
        _key: &str,
        _window_ms: u64,
        _max_requests: u64,
        _now_ms: u64,
        _member: &str,
    ) -> Result<WindowOutcome> {
        Err(BouncerError::Unsupported("server-side scripting"))
    }

    /// Drop expired timestamps and report what remains.
    async fn prune_and_count(&self, key: &str, window_ms: u64, now_ms: u64)
        -> Result<WindowSnapshot>;

    /// Add a timestamp and refresh the key's TTL to `window_ms`.
    async fn record(&self, key: &str, window_ms: u64, now_ms: u64, member: &str) -> Result<()>;

    /// Unconditionally add a timestamp, prune, and return the resulting count.
    async fn increment(&self, key: &str, window_ms: u64, now_ms: u64, member: &str)
        -> Result<u64>;

    /// Create or refresh a flag key expiring `ttl_ms` from now.
    async fn set_expiring(&self, key: &str, ttl_ms: u64, now_ms: u64) -> Result<()>;

    /// Absolute expiry of a live flag key, `None` when absent or expired.
    async fn expires_at(&self, key: &str, now_ms: u64) -> Result<Option<u64>>;
}

/// Decorator bounding every store primitive by a timeout.
///
/// A stalled store must surface as an error quickly so that admission can fail
/// open instead of hanging the request.
pub struct TimeoutStore {
    inner: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl TimeoutStore {
    /// Wrap `inner`, failing any primitive that exceeds `timeout`.
    pub fn new(inner: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn guard<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BouncerError::Timeout {
                operation,
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl CounterStore for TimeoutStore {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn supports_scripting(&self) -> bool {
        self.inner.supports_scripting()
    }

    async fn check_and_record(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u64,
        now_ms: u64,
        member: &str,
    ) -> Result<WindowOutcome> {
        self.guard(
            "check_and_record",
            self.inner
                .check_and_record(key, window_ms, max_requests, now_ms, member),
        )
        .await
    }

    async fn prune_and_count(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowSnapshot> {
        self.guard(
            "prune_and_count",
            self.inner.prune_and_count(key, window_ms, now_ms),
        )
        .await
    }

    async fn record(&self, key: &str, window_ms: u64, now_ms: u64, member: &str) -> Result<()> {
        self.guard("record", self.inner.record(key, window_ms, now_ms, member))
            .await
    }

    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
        member: &str,
    ) -> Result<u64> {
        self.guard(
            "increment",
            self.inner.increment(key, window_ms, now_ms, member),
        )
        .await
    }

    async fn set_expiring(&self, key: &str, ttl_ms: u64, now_ms: u64) -> Result<()> {
        self.guard("set_expiring", self.inner.set_expiring(key, ttl_ms, now_ms))
            .await
    }

    async fn expires_at(&self, key: &str, now_ms: u64) -> Result<Option<u64>> {
        self.guard("expires_at", self.inner.expires_at(key, now_ms))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Store whose every primitive hangs forever.
    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn prune_and_count(&self, _: &str, _: u64, _: u64) -> Result<WindowSnapshot> {
            futures::future::pending().await
        }

        async fn record(&self, _: &str, _: u64, _: u64, _: &str) -> Result<()> {
            futures::future::pending().await
        }

        async fn increment(&self, _: &str, _: u64, _: u64, _: &str) -> Result<u64> {
            futures::future::pending().await
        }

        async fn set_expiring(&self, _: &str, _: u64, _: u64) -> Result<()> {
            futures::future::pending().await
        }

        async fn expires_at(&self, _: &str, _: u64) -> Result<Option<u64>> {
            futures::future::pending().await
        }
    }

    #[test]
    fn test_snapshot_reset_at() {
        let empty = WindowSnapshot::default();
        assert_eq!(empty.reset_at(1_000, 5_000), 6_000);

        let populated = WindowSnapshot {
            count: 3,
            oldest: Some(4_200),
        };
        assert_eq!(populated.reset_at(1_000, 5_000), 5_200);
    }

    #[test]
    fn test_window_floor_before_epoch() {
        assert_eq!(window_floor(1_000, 5_000), 4_000);
        assert_eq!(window_floor(10_000, 5_000), -5_000);
    }

    #[test]
    fn test_window_floor_saturates() {
        assert_eq!(window_floor(u64::MAX, 5_000), 5_000 - i64::MAX);
        assert_eq!(window_floor(u64::MAX, u64::MAX), 0);
        assert_eq!(window_floor(0, u64::MAX), i64::MAX);
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::window("ip:1.2.3.4"), "window:ip:1.2.3.4");
        assert_eq!(keys::violations("global"), "violations:global");
        assert_eq!(keys::blacklist("user:7"), "blacklist:user:7");
        assert_eq!(keys::whitelist("user:7"), "whitelist:user:7");
    }

    #[tokio::test]
    async fn test_timeout_store_reports_operation() {
        let store = TimeoutStore::new(Arc::new(StalledStore), Duration::from_millis(20));

        let err = store.prune_and_count("k", 1_000, 5_000).await.unwrap_err();
        assert!(err.is_store_failure());
        assert!(matches!(
            err,
            BouncerError::Timeout {
                operation: "prune_and_count",
                after_ms: 20
            }
        ));
    }

    #[tokio::test]
    async fn test_default_check_and_record_is_unsupported() {
        let store = StalledStore;
        assert!(!store.supports_scripting());

        let err = store
            .check_and_record("k", 1_000, 1, 0, "m")
            .await
            .unwrap_err();
        assert!(matches!(err, BouncerError::Unsupported(_)));
    }
}
