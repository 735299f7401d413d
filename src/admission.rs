//! Per-request admission entry point.
//!
//! [`Admission`] wraps the tiered limiter with the fail-open policy and turns
//! decisions into response material: rate limit headers for admitted requests
//! and a rejection payload with a retry hint otherwise. It also carries the
//! administrative surface (whitelist, blacklist, stats).

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::BouncerConfig;
use crate::error::{BouncerError, Result};
use crate::ratelimit::{
    select_window_store, Decision, Dimension, EscalationManager, Quota, RequestIdentity,
    TieredLimiter, ViolationReason,
};
use crate::store::{CounterStore, TimeoutStore};
use crate::telemetry::{Stats, Telemetry};

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    RateLimited,
    Blacklisted,
    /// The engine failed and fail-open is disabled
    Unavailable,
}

impl From<ViolationReason> for RejectionReason {
    fn from(reason: ViolationReason) -> Self {
        match reason {
            ViolationReason::RateLimited => RejectionReason::RateLimited,
            ViolationReason::Blacklisted => RejectionReason::Blacklisted,
        }
    }
}

/// Payload returned with a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    /// Always false
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<Dimension>,
    pub current: u64,
    pub max: u64,
    /// Epoch ms
    pub reset_at: u64,
    /// Whole seconds until `reset_at`, at least 1
    pub retry_after: u64,
    pub reason: RejectionReason,
}

/// Informational rate limit headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds
    pub reset: u64,
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push(("Retry-After", retry_after.to_string()));
        }
        pairs
    }
}

/// Result of admitting a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionResponse {
    Admit {
        /// Headers for the tightest consumed limit, if any limit applied
        headers: Option<RateLimitHeaders>,
        /// Admitted because the engine failed
        degraded: bool,
    },
    Reject(Rejection),
}

impl AdmissionResponse {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionResponse::Admit { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, AdmissionResponse::Admit { degraded: true, .. })
    }

    /// HTTP status the host should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionResponse::Admit { .. } => 200,
            AdmissionResponse::Reject(r) if r.reason == RejectionReason::Unavailable => 503,
            AdmissionResponse::Reject(_) => 429,
        }
    }

    /// Response headers to attach, admitted or not.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            AdmissionResponse::Admit { headers, .. } => {
                headers.map(|h| h.pairs()).unwrap_or_default()
            }
            AdmissionResponse::Reject(rejection) if rejection.reason == RejectionReason::Unavailable => {
                vec![("Retry-After", rejection.retry_after.to_string())]
            }
            AdmissionResponse::Reject(rejection) => RateLimitHeaders {
                limit: rejection.max,
                remaining: 0,
                reset: epoch_seconds(rejection.reset_at),
                retry_after: Some(rejection.retry_after),
            }
            .pairs(),
        }
    }
}

/// Whole seconds from `now_ms` until `reset_at_ms`, rounded up, at least 1.
pub fn retry_after_secs(reset_at_ms: u64, now_ms: u64) -> u64 {
    reset_at_ms.saturating_sub(now_ms).div_ceil(1_000).max(1)
}

fn epoch_seconds(ms: u64) -> u64 {
    ms.div_ceil(1_000)
}

/// Admission entry point shared by every request handler.
pub struct Admission {
    limiter: Arc<TieredLimiter>,
    telemetry: Telemetry,
    clock: Arc<dyn Clock>,
    fail_open: bool,
}

impl Admission {
    pub fn new(
        limiter: Arc<TieredLimiter>,
        telemetry: Telemetry,
        clock: Arc<dyn Clock>,
        fail_open: bool,
    ) -> Self {
        Self {
            limiter,
            telemetry,
            clock,
            fail_open,
        }
    }

    /// Assemble the whole engine over `store`.
    ///
    /// The store is wrapped with the configured per-operation timeout and the
    /// window strategy is selected from its capabilities.
    pub fn from_config(
        config: &BouncerConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        telemetry: Telemetry,
    ) -> Self {
        let store: Arc<dyn CounterStore> =
            Arc::new(TimeoutStore::new(store, config.store.timeout()));
        let windows = select_window_store(store.clone(), config.store.force_pipelined);
        let escalation = Arc::new(EscalationManager::new(
            store,
            clock.clone(),
            config.escalation.clone(),
            telemetry.clone(),
        ));
        let limiter = Arc::new(TieredLimiter::new(
            config.limits.clone(),
            windows,
            escalation,
            clock.clone(),
        ));

        Self::new(limiter, telemetry, clock, config.admission.fail_open)
    }

    /// Decide one request. Never fails: engine errors end in fail-open, or in
    /// an `unavailable` rejection when fail-open is disabled.
    pub async fn admit(&self, identity: &RequestIdentity) -> AdmissionResponse {
        let started = Instant::now();

        let response = match self.limiter.evaluate(identity).await {
            Ok(decision) => {
                for (dimension, key, allowed) in decision.outcomes() {
                    self.telemetry.record_outcome(dimension, &key, allowed);
                }
                self.respond(decision)
            }
            Err(e) => self.degrade(e, identity),
        };

        self.telemetry.record_decision(response.is_allowed());
        self.telemetry.record_latency(started.elapsed());
        response
    }

    fn respond(&self, decision: Decision) -> AdmissionResponse {
        match decision.violation {
            None => AdmissionResponse::Admit {
                headers: decision.quota.map(|quota: Quota| RateLimitHeaders {
                    limit: quota.limit,
                    remaining: quota.remaining,
                    reset: epoch_seconds(quota.reset_at),
                    retry_after: None,
                }),
                degraded: false,
            },
            Some(violation) => AdmissionResponse::Reject(Rejection {
                allowed: false,
                dimension: Some(violation.dimension),
                current: violation.current,
                max: violation.max,
                reset_at: violation.reset_at,
                retry_after: retry_after_secs(violation.reset_at, self.clock.now_ms()),
                reason: violation.reason.into(),
            }),
        }
    }

    fn degrade(&self, e: BouncerError, identity: &RequestIdentity) -> AdmissionResponse {
        if e.is_invariant_violation() {
            error!(ip = %identity.ip, path = %identity.path, error = %e, "Admission invariant violated");
        } else {
            warn!(ip = %identity.ip, path = %identity.path, error = %e, "Counter store failure");
        }

        if self.fail_open {
            self.telemetry.record_degraded();
            debug!(ip = %identity.ip, "Admitting request without rate limiting");
            return AdmissionResponse::Admit {
                headers: None,
                degraded: true,
            };
        }

        let now = self.clock.now_ms();
        AdmissionResponse::Reject(Rejection {
            allowed: false,
            dimension: None,
            current: 0,
            max: 0,
            reset_at: now.saturating_add(1_000),
            retry_after: 1,
            reason: RejectionReason::Unavailable,
        })
    }

    /// Exempt `key` from all limits; returns the expiry in epoch ms.
    pub async fn whitelist(&self, key: &str, duration_ms: Option<u64>) -> Result<u64> {
        self.limiter.escalation().whitelist(key, duration_ms).await
    }

    /// Ban `key`; returns the expiry in epoch ms.
    pub async fn blacklist(&self, key: &str, duration_ms: Option<u64>) -> Result<u64> {
        self.limiter.escalation().blacklist(key, duration_ms).await
    }

    pub fn stats(&self) -> Stats {
        self.telemetry.snapshot()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }
}
