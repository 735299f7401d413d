//! In-process counter store.
//!
//! Suitable for a single instance or for tests. Each key is guarded by its
//! dashmap shard lock, so `check_and_record` is atomic with respect to every
//! other caller in the process. Expiry is lazy: expired records are ignored on
//! access and physically removed by [`MemoryStore::purge_expired`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::trace;

use super::{window_floor, CounterStore, WindowOutcome, WindowSnapshot};
use crate::error::Result;

/// Ordered timestamps for one key.
#[derive(Debug, Default)]
struct TimestampSet {
    stamps: VecDeque<u64>,
    expires_at: u64,
}

impl TimestampSet {
    fn prune(&mut self, window_ms: u64, now_ms: u64) {
        if self.expires_at <= now_ms {
            self.stamps.clear();
            return;
        }
        let floor = window_floor(window_ms, now_ms);
        let expired = self
            .stamps
            .partition_point(|&t| i64::try_from(t).map_or(false, |t| t <= floor));
        self.stamps.drain(..expired);
    }

    fn insert(&mut self, window_ms: u64, now_ms: u64) {
        let at = self.stamps.partition_point(|&t| t <= now_ms);
        self.stamps.insert(at, now_ms);
        self.expires_at = self.expires_at.max(now_ms.saturating_add(window_ms));
    }

    fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            count: self.stamps.len() as u64,
            oldest: self.stamps.front().copied(),
        }
    }
}

/// Counter store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sets: DashMap<String, TimestampSet>,
    flags: DashMap<String, u64>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every record whose TTL has elapsed. Returns how many were dropped.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.sets.len() + self.flags.len();
        self.sets.retain(|_, set| set.expires_at > now_ms);
        self.flags.retain(|_, expires_at| *expires_at > now_ms);
        let removed = before - (self.sets.len() + self.flags.len());

        trace!(removed, "Purged expired memory store records");
        removed
    }

    /// Number of physical records (timestamp sets and flags).
    pub fn len(&self) -> usize {
        self.sets.len() + self.flags.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_scripting(&self) -> bool {
        true
    }

    async fn check_and_record(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u64,
        now_ms: u64,
        _member: &str,
    ) -> Result<WindowOutcome> {
        let mut set = self.sets.entry(key.to_string()).or_default();
        set.prune(window_ms, now_ms);

        let before = set.snapshot();
        if before.count >= max_requests {
            return Ok(WindowOutcome {
                admitted: false,
                current_count: before.count,
                reset_at: before.reset_at(window_ms, now_ms),
            });
        }

        set.insert(window_ms, now_ms);
        let after = set.snapshot();
        Ok(WindowOutcome {
            admitted: true,
            current_count: after.count,
            reset_at: after.reset_at(window_ms, now_ms),
        })
    }

    async fn prune_and_count(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowSnapshot> {
        match self.sets.get_mut(key) {
            Some(mut set) => {
                set.prune(window_ms, now_ms);
                Ok(set.snapshot())
            }
            None => Ok(WindowSnapshot::default()),
        }
    }

    async fn record(&self, key: &str, window_ms: u64, now_ms: u64, _member: &str) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(window_ms, now_ms);
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
        _member: &str,
    ) -> Result<u64> {
        let mut set = self.sets.entry(key.to_string()).or_default();
        set.prune(window_ms, now_ms);
        set.insert(window_ms, now_ms);
        Ok(set.stamps.len() as u64)
    }

    async fn set_expiring(&self, key: &str, ttl_ms: u64, now_ms: u64) -> Result<()> {
        self.flags
            .insert(key.to_string(), now_ms.saturating_add(ttl_ms));
        Ok(())
    }

    async fn expires_at(&self, key: &str, now_ms: u64) -> Result<Option<u64>> {
        Ok(self
            .flags
            .get(key)
            .map(|expires_at| *expires_at)
            .filter(|expires_at| *expires_at > now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_and_record_admits_up_to_limit() {
        let store = MemoryStore::new();

        for i in 1..=3 {
            let outcome = store.check_and_record("k", 1_000, 3, 100, "m").await.unwrap();
            assert!(outcome.admitted);
            assert_eq!(outcome.current_count, i);
            assert_eq!(outcome.reset_at, 1_100);
        }

        let outcome = store.check_and_record("k", 1_000, 3, 200, "m").await.unwrap();
        assert!(!outcome.admitted);
        assert_eq!(outcome.current_count, 3);
        assert_eq!(outcome.reset_at, 1_100);
    }

    #[tokio::test]
    async fn test_window_slides_at_boundary() {
        let store = MemoryStore::new();
        store.check_and_record("k", 1_000, 1, 0, "m").await.unwrap();

        let blocked = store.check_and_record("k", 1_000, 1, 999, "m").await.unwrap();
        assert!(!blocked.admitted);

        // The first stamp is exactly one window old and no longer counts
        let admitted = store.check_and_record("k", 1_000, 1, 1_000, "m").await.unwrap();
        assert!(admitted.admitted);
        assert_eq!(admitted.current_count, 1);
    }

    #[tokio::test]
    async fn test_huge_window_expires_nothing() {
        let store = MemoryStore::new();
        store.check_and_record("k", u64::MAX, 2, 0, "m").await.unwrap();
        store.check_and_record("k", u64::MAX, 2, 5_000, "m").await.unwrap();

        let snapshot = store.prune_and_count("k", u64::MAX, 10_000).await.unwrap();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.reset_at(u64::MAX, 10_000), u64::MAX);
    }

    #[tokio::test]
    async fn test_zero_limit_rejects_empty_window() {
        let store = MemoryStore::new();

        let outcome = store.check_and_record("k", 500, 0, 10, "m").await.unwrap();
        assert!(!outcome.admitted);
        assert_eq!(outcome.current_count, 0);
        assert_eq!(outcome.reset_at, 510);
    }

    #[tokio::test]
    async fn test_prune_and_record_are_separate_steps() {
        let store = MemoryStore::new();

        let empty = store.prune_and_count("k", 1_000, 50).await.unwrap();
        assert_eq!(empty, WindowSnapshot::default());

        store.record("k", 1_000, 50, "a").await.unwrap();
        store.record("k", 1_000, 20, "b").await.unwrap();

        let snapshot = store.prune_and_count("k", 1_000, 60).await.unwrap();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.oldest, Some(20));
    }

    #[tokio::test]
    async fn test_increment_counts_within_window() {
        let store = MemoryStore::new();

        assert_eq!(store.increment("v", 100, 0, "a").await.unwrap(), 1);
        assert_eq!(store.increment("v", 100, 50, "b").await.unwrap(), 2);
        assert_eq!(store.increment("v", 100, 120, "c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_flags_expire() {
        let store = MemoryStore::new();
        store.set_expiring("blacklist:ip:1", 1_000, 0).await.unwrap();

        assert_eq!(store.expires_at("blacklist:ip:1", 999).await.unwrap(), Some(1_000));
        assert_eq!(store.expires_at("blacklist:ip:1", 1_000).await.unwrap(), None);
        assert_eq!(store.expires_at("missing", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.record("w", 100, 0, "a").await.unwrap();
        store.set_expiring("f", 500, 0).await.unwrap();
        assert_eq!(store.len(), 2);

        assert_eq!(store.purge_expired(100), 1);
        assert_eq!(store.purge_expired(500), 1);
        assert!(store.is_empty());
    }
}
