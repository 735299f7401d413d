//! Trailing-window check-and-record over a counter store.
//!
//! [`WindowStore`] abstracts over the two ways a window can be checked:
//!
//! - [`AtomicStore`] runs prune, count and record as one server-side step.
//!   Concurrent callers can never push a window past its limit.
//! - [`PipelinedStore`] issues prune+count, then a conditional record, as two
//!   separate operations. Callers racing between the two steps may all observe
//!   a free slot and all record, so a window can overshoot its limit by up to
//!   the number of concurrent callers. This relaxation is accepted for stores
//!   without scripting support.
//!
//! The variant is picked once, when the engine is built.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, trace, warn};
use uuid::Uuid;

use super::rules::LimitRule;
use crate::error::Result;
use crate::store::{keys, CounterStore, WindowOutcome};

/// Check-and-record capability for trailing windows.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Whether concurrent callers are serialized by the store.
    fn is_atomic(&self) -> bool;

    /// Count this request against `key` if the window has room.
    async fn check_and_record(
        &self,
        key: &str,
        rule: &LimitRule,
        now_ms: u64,
    ) -> Result<WindowOutcome>;
}

/// Unique sorted-set member so that equal timestamps are counted separately.
fn member(now_ms: u64) -> String {
    format!("{}-{}", now_ms, Uuid::new_v4().simple())
}

/// Window checks executed by a server-side script.
pub struct AtomicStore {
    store: Arc<dyn CounterStore>,
}

impl AtomicStore {
    /// Create an atomic window store. The backend must support scripting.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WindowStore for AtomicStore {
    fn is_atomic(&self) -> bool {
        true
    }

    async fn check_and_record(
        &self,
        key: &str,
        rule: &LimitRule,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let outcome = self
            .store
            .check_and_record(
                &keys::window(key),
                rule.window_ms,
                rule.max_requests,
                now_ms,
                &member(now_ms),
            )
            .await?;

        trace!(
            key = %key,
            admitted = outcome.admitted,
            count = outcome.current_count,
            "Atomic window check"
        );
        Ok(outcome)
    }
}

/// Window checks executed as prune+count followed by a conditional record.
pub struct PipelinedStore {
    store: Arc<dyn CounterStore>,
}

impl PipelinedStore {
    /// Create a pipelined window store.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WindowStore for PipelinedStore {
    fn is_atomic(&self) -> bool {
        false
    }

    async fn check_and_record(
        &self,
        key: &str,
        rule: &LimitRule,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let storage_key = keys::window(key);
        let snapshot = self
            .store
            .prune_and_count(&storage_key, rule.window_ms, now_ms)
            .await?;

        if snapshot.count >= rule.max_requests {
            return Ok(WindowOutcome {
                admitted: false,
                current_count: snapshot.count,
                reset_at: snapshot.reset_at(rule.window_ms, now_ms),
            });
        }

        self.store
            .record(&storage_key, rule.window_ms, now_ms, &member(now_ms))
            .await?;

        trace!(
            key = %key,
            count = snapshot.count + 1,
            "Pipelined window check"
        );
        Ok(WindowOutcome {
            admitted: true,
            current_count: snapshot.count + 1,
            reset_at: snapshot.reset_at(rule.window_ms, now_ms),
        })
    }
}

/// Pick the window strategy for a backend.
///
/// Scripting-capable backends get the atomic path unless `force_pipelined`
/// is set.
pub fn select_window_store(
    store: Arc<dyn CounterStore>,
    force_pipelined: bool,
) -> Arc<dyn WindowStore> {
    if store.supports_scripting() && !force_pipelined {
        info!(backend = store.name(), "Using atomic window checks");
        Arc::new(AtomicStore::new(store))
    } else {
        warn!(
            backend = store.name(),
            "Using pipelined window checks; concurrent callers may overshoot limits"
        );
        Arc::new(PipelinedStore::new(store))
    }
}
