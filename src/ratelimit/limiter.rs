//! Tiered limiter: evaluates one request against every configured dimension.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::descriptor::{Dimension, RateLimitKey, RequestIdentity};
use super::escalation::{EscalationManager, Standing};
use super::rules::{LimitRule, LimitTiers};
use super::window::WindowStore;
use crate::clock::Clock;
use crate::error::{BouncerError, Result};
use crate::store::WindowOutcome;

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    /// A trailing window is full
    RateLimited,
    /// The key is serving a temporary ban
    Blacklisted,
}

impl ViolationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationReason::RateLimited => "rate_limited",
            ViolationReason::Blacklisted => "blacklisted",
        }
    }
}

/// The limit reported for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub dimension: Dimension,
    pub key: RateLimitKey,
    /// Requests counted in the window; 0 for blacklist rejections
    pub current: u64,
    /// Window limit; 0 for blacklist rejections
    pub max: u64,
    /// Epoch ms at which a retry may succeed
    pub reset_at: u64,
    pub reason: ViolationReason,
}

/// Remaining capacity of the tightest limit an admitted request consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub dimension: Dimension,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
}

/// One window check performed for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCheck {
    pub key: RateLimitKey,
    pub rule: LimitRule,
    pub outcome: WindowOutcome,
}

impl KeyCheck {
    fn remaining(&self) -> u64 {
        self.rule
            .max_requests
            .saturating_sub(self.outcome.current_count)
    }
}

/// Outcome of evaluating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub violation: Option<Violation>,
    pub quota: Option<Quota>,
    /// Whitelisted key that short-circuited evaluation
    pub whitelisted: Option<RateLimitKey>,
    /// Window checks that ran, empty when escalation short-circuited
    pub checks: Vec<KeyCheck>,
}

impl Decision {
    fn whitelisted(key: RateLimitKey) -> Self {
        Self {
            allow: true,
            violation: None,
            quota: None,
            whitelisted: Some(key),
            checks: Vec::new(),
        }
    }

    fn rejected(violation: Violation, checks: Vec<KeyCheck>) -> Self {
        Self {
            allow: false,
            violation: Some(violation),
            quota: None,
            whitelisted: None,
            checks,
        }
    }

    /// Per-key results, for telemetry.
    pub fn outcomes(&self) -> Vec<(Dimension, String, bool)> {
        let mut outcomes: Vec<_> = self
            .checks
            .iter()
            .map(|check| {
                (
                    check.key.dimension,
                    check.key.to_string_key(),
                    check.outcome.admitted,
                )
            })
            .collect();

        match (&self.violation, &self.whitelisted) {
            (Some(v), _) if v.reason == ViolationReason::Blacklisted => {
                outcomes.push((v.dimension, v.key.to_string_key(), false));
            }
            (_, Some(key)) => outcomes.push((key.dimension, key.to_string_key(), true)),
            _ => {}
        }
        outcomes
    }
}

/// Evaluates requests against global, service, ip, user and endpoint limits.
///
/// Window checks for one request are spawned as independent tasks, so the
/// added latency is about one store round trip and an abandoned request still
/// finishes recording its checks.
pub struct TieredLimiter {
    tiers: LimitTiers,
    windows: Arc<dyn WindowStore>,
    escalation: Arc<EscalationManager>,
    clock: Arc<dyn Clock>,
}

impl TieredLimiter {
    pub fn new(
        tiers: LimitTiers,
        windows: Arc<dyn WindowStore>,
        escalation: Arc<EscalationManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tiers,
            windows,
            escalation,
            clock,
        }
    }

    /// The escalation manager consulted before any window check.
    pub fn escalation(&self) -> &Arc<EscalationManager> {
        &self.escalation
    }

    pub fn tiers(&self) -> &LimitTiers {
        &self.tiers
    }

    /// Decide whether `identity` may proceed.
    ///
    /// Errors are store or invariant failures; the caller decides whether to
    /// fail open.
    pub async fn evaluate(&self, identity: &RequestIdentity) -> Result<Decision> {
        let now = self.clock.now_ms();

        // Bans and exemptions apply to every key the caller has, limited or not
        let identity_keys: Vec<RateLimitKey> = Dimension::ALL
            .iter()
            .filter_map(|&dimension| identity.key_for(dimension))
            .collect();

        match self.escalation.status(&identity_keys).await? {
            Standing::Whitelisted { key } => {
                trace!(key = %key, "Whitelisted, skipping window checks");
                return Ok(Decision::whitelisted(key));
            }
            Standing::Blacklisted { key, expires_at } => {
                debug!(key = %key, expires_at, "Rejecting blacklisted caller");
                return Ok(Decision::rejected(
                    Violation {
                        dimension: key.dimension,
                        key,
                        current: 0,
                        max: 0,
                        reset_at: expires_at,
                        reason: ViolationReason::Blacklisted,
                    },
                    Vec::new(),
                ));
            }
            Standing::Clear => {}
        }

        let checks = self.check_windows(identity, now).await?;

        let over_limit = checks
            .iter()
            .filter(|check| !check.outcome.admitted)
            .max_by_key(|check| check.key.dimension.narrowness());

        if let Some(check) = over_limit {
            let violation = Violation {
                dimension: check.key.dimension,
                key: check.key.clone(),
                current: check.outcome.current_count,
                max: check.rule.max_requests,
                reset_at: check.outcome.reset_at,
                reason: ViolationReason::RateLimited,
            };
            debug!(
                key = %violation.key,
                current = violation.current,
                max = violation.max,
                "Rate limit exceeded"
            );

            if let Some(target) = escalation_target(&violation.key, &identity_keys) {
                self.spawn_violation(target.to_string_key(), now);
            }
            return Ok(Decision::rejected(violation, checks));
        }

        let quota = checks
            .iter()
            .min_by_key(|check| {
                (
                    check.remaining(),
                    std::cmp::Reverse(check.key.dimension.narrowness()),
                )
            })
            .map(|check| Quota {
                dimension: check.key.dimension,
                limit: check.rule.max_requests,
                remaining: check.remaining(),
                reset_at: check.outcome.reset_at,
            });

        Ok(Decision {
            allow: true,
            violation: None,
            quota,
            whitelisted: None,
            checks,
        })
    }

    /// Record a violation in its own task so that it lands even when the
    /// request future is dropped, without delaying the rejection.
    fn spawn_violation(&self, key: String, now: u64) {
        let escalation = self.escalation.clone();
        tokio::spawn(async move {
            if let Err(e) = escalation.record_violation_at(&key, now).await {
                warn!(key = %key, error = %e, "Failed to record violation");
            }
        });
    }

    async fn check_windows(&self, identity: &RequestIdentity, now: u64) -> Result<Vec<KeyCheck>> {
        let handles = self
            .tiers
            .applicable(identity)
            .into_iter()
            .map(|(key, rule)| {
                let windows = self.windows.clone();
                tokio::spawn(async move {
                    let outcome = windows
                        .check_and_record(&key.to_string_key(), &rule, now)
                        .await;
                    (key, rule, outcome)
                })
            });

        let mut checks = Vec::new();
        for joined in join_all(handles).await {
            let (key, rule, outcome) = joined
                .map_err(|e| BouncerError::Invariant(format!("window check task failed: {}", e)))?;
            checks.push(KeyCheck {
                key,
                rule,
                outcome: outcome?,
            });
        }
        Ok(checks)
    }
}

/// The key a rejection counts against for escalation.
///
/// A violated caller key is used as is. When a shared counter (`global`,
/// `service`) is the reported violation, the narrowest key identifying the
/// caller takes the violation instead.
fn escalation_target(
    violated: &RateLimitKey,
    identity_keys: &[RateLimitKey],
) -> Option<RateLimitKey> {
    if violated.dimension.identifies_caller() {
        return Some(violated.clone());
    }
    identity_keys
        .iter()
        .filter(|key| key.dimension.identifies_caller())
        .max_by_key(|key| key.dimension.narrowness())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EscalationConfig, TelemetryConfig};
    use crate::ratelimit::select_window_store;
    use crate::store::{CounterStore, MemoryStore};
    use crate::telemetry::Telemetry;

    fn limiter(tiers: LimitTiers, clock: &ManualClock) -> TieredLimiter {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let (telemetry, _) = Telemetry::spawn(&TelemetryConfig::default());
        let escalation = Arc::new(EscalationManager::new(
            store.clone(),
            clock.clone(),
            EscalationConfig::default(),
            telemetry,
        ));
        TieredLimiter::new(tiers, select_window_store(store, false), escalation, clock)
    }

    fn login() -> RequestIdentity {
        RequestIdentity::new("10.0.0.1", "POST", "/auth/login")
    }

    /// Let detached violation writes finish.
    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_narrowest_violation_is_reported() {
        let clock = ManualClock::new(0);
        let tiers = LimitTiers::unlimited()
            .with_dimension(Dimension::Global, Some(LimitRule::new(60_000, 1)))
            .with_endpoint("POST", "/auth/login", LimitRule::new(60_000, 1));
        let limiter = limiter(tiers, &clock);

        assert!(limiter.evaluate(&login()).await.unwrap().allow);

        let decision = limiter.evaluate(&login()).await.unwrap();
        assert!(!decision.allow);
        let violation = decision.violation.unwrap();
        assert_eq!(violation.dimension, Dimension::Endpoint);
        assert_eq!(violation.reason, ViolationReason::RateLimited);
        assert_eq!(violation.current, 1);
        assert_eq!(violation.max, 1);
        assert_eq!(violation.reset_at, 60_000);
    }

    #[tokio::test]
    async fn test_quota_reports_tightest_limit() {
        let clock = ManualClock::new(0);
        let tiers = LimitTiers::unlimited()
            .with_dimension(Dimension::Global, Some(LimitRule::new(60_000, 100)))
            .with_dimension(Dimension::Ip, Some(LimitRule::new(60_000, 3)));
        let limiter = limiter(tiers, &clock);

        let decision = limiter.evaluate(&login()).await.unwrap();
        assert_eq!(
            decision.quota,
            Some(Quota {
                dimension: Dimension::Ip,
                limit: 3,
                remaining: 2,
                reset_at: 60_000
            })
        );
        assert_eq!(decision.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_no_applicable_limits_allows() {
        let clock = ManualClock::new(0);
        let limiter = limiter(LimitTiers::unlimited(), &clock);

        let decision = limiter.evaluate(&login()).await.unwrap();
        assert!(decision.allow);
        assert!(decision.quota.is_none());
        assert!(decision.checks.is_empty());
    }

    #[tokio::test]
    async fn test_rejections_escalate_to_blacklist() {
        let clock = ManualClock::new(0);
        let tiers = LimitTiers::unlimited()
            .with_dimension(Dimension::Ip, Some(LimitRule::new(1_000, 1)));
        let limiter = limiter(tiers, &clock);

        assert!(limiter.evaluate(&login()).await.unwrap().allow);
        for _ in 0..3 {
            clock.advance(1);
            let decision = limiter.evaluate(&login()).await.unwrap();
            assert_eq!(
                decision.violation.unwrap().reason,
                ViolationReason::RateLimited
            );
        }

        settle().await;

        // The window has long reset; the ban has not
        clock.advance(10_000);
        let decision = limiter.evaluate(&login()).await.unwrap();
        let violation = decision.violation.as_ref().unwrap();
        assert_eq!(violation.reason, ViolationReason::Blacklisted);
        assert_eq!(violation.dimension, Dimension::Ip);
        assert_eq!(violation.reset_at, 3 + 3_600_000);
        assert!(decision.checks.is_empty());
        assert_eq!(
            decision.outcomes(),
            vec![(Dimension::Ip, "ip:10.0.0.1".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_shared_limit_never_bans_everyone() {
        let clock = ManualClock::new(0);
        let tiers = LimitTiers::unlimited()
            .with_dimension(Dimension::Global, Some(LimitRule::new(1_000, 1)));
        let limiter = limiter(tiers, &clock);
        let from = |ip: &str| RequestIdentity::new(ip, "GET", "/courses");

        assert!(limiter.evaluate(&from("1.1.1.1")).await.unwrap().allow);
        for ip in ["2.2.2.2", "3.3.3.3", "4.4.4.4"] {
            clock.advance(1);
            let violation = limiter.evaluate(&from(ip)).await.unwrap().violation.unwrap();
            assert_eq!(violation.dimension, Dimension::Global);
        }
        settle().await;

        assert!(!limiter.escalation().is_blacklisted("global").await.unwrap());
        clock.advance(10_000);
        assert!(limiter.evaluate(&from("9.9.9.9")).await.unwrap().allow);
    }

    #[tokio::test]
    async fn test_shared_violations_escalate_the_caller() {
        let clock = ManualClock::new(0);
        let tiers = LimitTiers::unlimited()
            .with_dimension(Dimension::Global, Some(LimitRule::new(60_000, 1)));
        let limiter = limiter(tiers, &clock);
        let caller = RequestIdentity::new("10.0.0.2", "GET", "/courses").with_user("42");

        assert!(limiter.evaluate(&caller).await.unwrap().allow);
        for _ in 0..3 {
            clock.advance(1);
            assert!(!limiter.evaluate(&caller).await.unwrap().allow);
        }
        settle().await;

        let escalation = limiter.escalation();
        assert!(escalation
            .is_blacklisted("endpoint:GET /courses:10.0.0.2")
            .await
            .unwrap());
        assert!(!escalation.is_blacklisted("global").await.unwrap());
        assert!(!escalation.is_blacklisted("user:42").await.unwrap());
    }

    #[test]
    fn test_escalation_target() {
        let identity =
            RequestIdentity::new("10.0.0.1", "GET", "/courses").with_service("billing");
        let identity_keys: Vec<RateLimitKey> = Dimension::ALL
            .iter()
            .filter_map(|&dimension| identity.key_for(dimension))
            .collect();

        let ip = RateLimitKey::new(Dimension::Ip, "10.0.0.1");
        assert_eq!(escalation_target(&ip, &identity_keys), Some(ip));

        let endpoint = identity.key_for(Dimension::Endpoint);
        assert_eq!(
            escalation_target(&RateLimitKey::global(), &identity_keys),
            endpoint
        );
        let service = RateLimitKey::new(Dimension::Service, "billing");
        assert_eq!(escalation_target(&service, &identity_keys), endpoint);

        assert_eq!(
            escalation_target(&RateLimitKey::global(), &[RateLimitKey::global()]),
            None
        );
    }

    #[tokio::test]
    async fn test_whitelist_bypasses_limits() {
        let clock = ManualClock::new(0);
        let tiers = LimitTiers::unlimited()
            .with_dimension(Dimension::Ip, Some(LimitRule::new(1_000, 0)));
        let limiter = limiter(tiers, &clock);

        assert!(!limiter.evaluate(&login()).await.unwrap().allow);

        limiter
            .escalation()
            .whitelist("ip:10.0.0.1", None)
            .await
            .unwrap();
        let decision = limiter.evaluate(&login()).await.unwrap();
        assert!(decision.allow);
        assert_eq!(
            decision.whitelisted,
            Some(RateLimitKey::new(Dimension::Ip, "10.0.0.1"))
        );
    }

    #[tokio::test]
    async fn test_anonymous_request_checks_no_user_key() {
        let clock = ManualClock::new(0);
        let limiter = limiter(LimitTiers::default(), &clock);

        let decision = limiter
            .evaluate(&RequestIdentity::new("10.0.0.1", "GET", "/courses"))
            .await
            .unwrap();
        assert!(decision
            .checks
            .iter()
            .all(|check| check.key.dimension != Dimension::User));
    }
}
