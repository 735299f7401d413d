//! In-memory admission telemetry.
//!
//! The request path never touches the aggregate state directly. Each record
//! call is a `try_send` on a bounded channel; a worker task drains the channel
//! and applies events. When the channel is full the event is dropped and
//! counted, so a slow aggregator cannot add latency to admission.
//!
//! Counters are process-local and may diverge between instances.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::config::TelemetryConfig;
use crate::ratelimit::Dimension;

/// Upper bounds of the latency histogram buckets, in milliseconds.
const LATENCY_BUCKETS_MS: [u64; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000];

enum TelemetryEvent {
    Outcome {
        dimension: Dimension,
        key: String,
        allowed: bool,
    },
    Decision {
        allowed: bool,
    },
    Latency(Duration),
    Degraded,
    Security,
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counter {
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl Counter {
    fn add(&self, allowed: bool) {
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counts(&self) -> Counts {
        Counts {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Latency {
    count: AtomicU64,
    total_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
    // One slot per bound plus overflow
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
}

impl Default for Latency {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
            buckets: Default::default(),
        }
    }
}

impl Latency {
    fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);

        let slot = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| us <= bound * 1_000)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> LatencyStats {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return LatencyStats::default();
        }
        let max_us = self.max_us.load(Ordering::Relaxed);
        let buckets: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();

        let quantile = |q: f64| -> f64 {
            let target = ((count as f64) * q).ceil().max(1.0) as u64;
            let mut seen = 0;
            for (slot, hits) in buckets.iter().enumerate() {
                seen += hits;
                if seen >= target {
                    return match LATENCY_BUCKETS_MS.get(slot) {
                        Some(bound) => (*bound as f64).min(max_us as f64 / 1_000.0),
                        None => max_us as f64 / 1_000.0,
                    };
                }
            }
            max_us as f64 / 1_000.0
        };

        LatencyStats {
            count,
            mean_ms: self.total_us.load(Ordering::Relaxed) as f64 / count as f64 / 1_000.0,
            min_ms: self.min_us.load(Ordering::Relaxed) as f64 / 1_000.0,
            max_ms: max_us as f64 / 1_000.0,
            p50_ms: quantile(0.50),
            p95_ms: quantile(0.95),
            p99_ms: quantile(0.99),
        }
    }
}

#[derive(Debug)]
struct Shared {
    allowed: AtomicU64,
    rejected: AtomicU64,
    degraded: AtomicU64,
    security_events: AtomicU64,
    dropped_events: AtomicU64,
    untracked_keys: AtomicU64,
    by_dimension: DashMap<Dimension, Counter>,
    by_key: DashMap<String, Counter>,
    latency: Latency,
    max_tracked_keys: usize,
}

impl Shared {
    fn new(max_tracked_keys: usize) -> Self {
        Self {
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            security_events: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            untracked_keys: AtomicU64::new(0),
            by_dimension: DashMap::new(),
            by_key: DashMap::new(),
            latency: Latency::default(),
            max_tracked_keys,
        }
    }

    fn apply(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Outcome {
                dimension,
                key,
                allowed,
            } => {
                self.by_dimension.entry(dimension).or_default().add(allowed);

                if let Some(counter) = self.by_key.get(&key) {
                    counter.add(allowed);
                } else if self.by_key.len() < self.max_tracked_keys {
                    self.by_key.entry(key).or_default().add(allowed);
                } else {
                    self.untracked_keys.fetch_add(1, Ordering::Relaxed);
                }
            }
            TelemetryEvent::Decision { allowed } => {
                let total = if allowed { &self.allowed } else { &self.rejected };
                total.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::Latency(elapsed) => self.latency.record(elapsed),
            TelemetryEvent::Degraded => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::Security => {
                self.security_events.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Allowed and rejected tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    /// Admitted checks
    pub allowed: u64,
    /// Rejected checks
    pub rejected: u64,
}

/// Admission latency summary. Percentiles are histogram bucket bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Point-in-time view of the aggregated telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    /// Requests admitted, degraded admissions included
    pub allowed: u64,
    /// Requests rejected
    pub rejected: u64,
    /// Requests admitted because the engine failed
    pub degraded: u64,
    /// Blacklist promotions and administrative bans
    pub security_events: u64,
    /// Events lost to a full channel
    pub dropped_events: u64,
    /// Outcomes for keys beyond the tracking cap
    pub untracked_keys: u64,
    pub by_dimension: BTreeMap<Dimension, Counts>,
    pub by_key: BTreeMap<String, Counts>,
    pub latency: LatencyStats,
}

impl Stats {
    /// Fraction of decided requests that were rejected (0.0 to 1.0).
    pub fn rejection_rate(&self) -> f64 {
        let total = self.allowed.saturating_add(self.rejected);
        if total == 0 {
            0.0
        } else {
            self.rejected as f64 / total as f64
        }
    }
}

/// Handle for recording telemetry. Cheap to clone; all clones feed the same
/// aggregator.
#[derive(Debug, Clone)]
pub struct Telemetry {
    tx: mpsc::Sender<TelemetryEvent>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TelemetryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryEvent::Outcome { dimension, .. } => write!(f, "Outcome({})", dimension),
            TelemetryEvent::Decision { allowed } => write!(f, "Decision({})", allowed),
            TelemetryEvent::Latency(d) => write!(f, "Latency({:?})", d),
            TelemetryEvent::Degraded => f.write_str("Degraded"),
            TelemetryEvent::Security => f.write_str("Security"),
            TelemetryEvent::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl Telemetry {
    /// Start an aggregator and its drain worker on the current runtime.
    pub fn spawn(config: &TelemetryConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let shared = Arc::new(Shared::new(config.max_tracked_keys));

        let worker_state = shared.clone();
        let worker = tokio::spawn(async move {
            let mut events = ReceiverStream::new(rx);
            while let Some(event) = events.next().await {
                worker_state.apply(event);
            }
            debug!("Telemetry worker stopped");
        });

        (Self { tx, shared }, worker)
    }

    fn emit(&self, event: TelemetryEvent) {
        if self.tx.try_send(event).is_err() {
            self.shared.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one dimension check.
    pub fn record_outcome(&self, dimension: Dimension, key: &str, allowed: bool) {
        self.emit(TelemetryEvent::Outcome {
            dimension,
            key: key.to_string(),
            allowed,
        });
    }

    /// Count one admission decision.
    pub fn record_decision(&self, allowed: bool) {
        self.emit(TelemetryEvent::Decision { allowed });
    }

    /// Record how long one admission took.
    pub fn record_latency(&self, elapsed: Duration) {
        self.emit(TelemetryEvent::Latency(elapsed));
    }

    /// Count a fail-open admission.
    pub fn record_degraded(&self) {
        self.emit(TelemetryEvent::Degraded);
    }

    /// Count a ban.
    pub fn record_security_event(&self) {
        self.emit(TelemetryEvent::Security);
    }

    /// Wait until every event sent before this call has been applied.
    pub async fn flush(&self) {
        let (done, applied) = oneshot::channel();
        if self.tx.send(TelemetryEvent::Flush(done)).await.is_ok() {
            let _ = applied.await;
        }
    }

    /// Current aggregate state.
    pub fn snapshot(&self) -> Stats {
        let shared = &self.shared;
        Stats {
            allowed: shared.allowed.load(Ordering::Relaxed),
            rejected: shared.rejected.load(Ordering::Relaxed),
            degraded: shared.degraded.load(Ordering::Relaxed),
            security_events: shared.security_events.load(Ordering::Relaxed),
            dropped_events: shared.dropped_events.load(Ordering::Relaxed),
            untracked_keys: shared.untracked_keys.load(Ordering::Relaxed),
            by_dimension: shared
                .by_dimension
                .iter()
                .map(|entry| (*entry.key(), entry.value().counts()))
                .collect(),
            by_key: shared
                .by_key
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().counts()))
                .collect(),
            latency: shared.latency.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(capacity: usize, max_tracked_keys: usize) -> Telemetry {
        Telemetry::spawn(&TelemetryConfig {
            channel_capacity: capacity,
            max_tracked_keys,
        })
        .0
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_empty() {
        let telemetry = spawn(16, 16);
        assert_eq!(telemetry.snapshot(), Stats::default());
        assert_eq!(telemetry.snapshot().rejection_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_outcomes_by_dimension_and_key() {
        let telemetry = spawn(64, 64);

        telemetry.record_outcome(Dimension::Ip, "ip:1", true);
        telemetry.record_outcome(Dimension::Ip, "ip:1", false);
        telemetry.record_outcome(Dimension::Global, "global", true);
        telemetry.record_decision(true);
        telemetry.record_decision(false);
        telemetry.flush().await;

        let stats = telemetry.snapshot();
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.rejection_rate(), 0.5);
        assert_eq!(
            stats.by_dimension[&Dimension::Ip],
            Counts {
                allowed: 1,
                rejected: 1
            }
        );
        assert_eq!(stats.by_key["global"].allowed, 1);
    }

    #[tokio::test]
    async fn test_key_tracking_is_capped() {
        let telemetry = spawn(64, 2);

        for i in 0..5 {
            telemetry.record_outcome(Dimension::Ip, &format!("ip:{}", i), true);
        }
        telemetry.record_outcome(Dimension::Ip, "ip:0", true);
        telemetry.flush().await;

        let stats = telemetry.snapshot();
        assert_eq!(stats.by_key.len(), 2);
        assert_eq!(stats.by_key["ip:0"].allowed, 2);
        assert_eq!(stats.untracked_keys, 3);
        assert_eq!(stats.by_dimension[&Dimension::Ip].allowed, 6);
    }

    #[tokio::test]
    async fn test_latency_summary() {
        let telemetry = spawn(64, 64);

        telemetry.record_latency(Duration::from_micros(800));
        telemetry.record_latency(Duration::from_millis(3));
        telemetry.record_latency(Duration::from_millis(40));
        telemetry.flush().await;

        let latency = telemetry.snapshot().latency;
        assert_eq!(latency.count, 3);
        assert_eq!(latency.min_ms, 0.8);
        assert_eq!(latency.max_ms, 40.0);
        assert_eq!(latency.p50_ms, 5.0);
        assert_eq!(latency.p99_ms, 40.0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        // Current-thread runtime: the worker cannot drain until we yield
        let telemetry = spawn(2, 64);

        for _ in 0..10 {
            telemetry.record_degraded();
        }
        assert_eq!(telemetry.snapshot().dropped_events, 8);

        telemetry.flush().await;
        assert_eq!(telemetry.snapshot().degraded, 2);
    }

    #[tokio::test]
    async fn test_stats_serialize() {
        let telemetry = spawn(16, 16);
        telemetry.record_outcome(Dimension::Endpoint, "endpoint:GET /:1", false);
        telemetry.flush().await;

        let json = serde_json::to_value(telemetry.snapshot()).unwrap();
        assert_eq!(json["by_dimension"]["endpoint"]["rejected"], 1);
    }
}
