//! Abuse escalation: violation counting, temporary bans and whitelisting.
//!
//! Each rejection counts as a violation against the caller's key. Violations
//! are kept in a trailing window as long as the ban itself; once a key reaches
//! the threshold within that window it is blacklisted. A whitelist entry
//! overrides both the blacklist and every window check.

use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::descriptor::RateLimitKey;
use crate::clock::Clock;
use crate::config::EscalationConfig;
use crate::error::Result;
use crate::store::{keys, CounterStore};
use crate::telemetry::Telemetry;

/// Escalation state of a request across all of its keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Standing {
    /// No whitelist or blacklist entry applies
    Clear,
    /// At least one key is whitelisted
    Whitelisted { key: RateLimitKey },
    /// The narrowest blacklisted key and its ban expiry
    Blacklisted { key: RateLimitKey, expires_at: u64 },
}

/// Tracks violations and maintains blacklist and whitelist entries.
pub struct EscalationManager {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: EscalationConfig,
    telemetry: Telemetry,
}

impl EscalationManager {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: EscalationConfig,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            telemetry,
        }
    }

    /// Count a rejection against `key`, banning it at the threshold.
    ///
    /// Returns the number of violations within the trailing ban window.
    pub async fn record_violation(&self, key: &str) -> Result<u64> {
        self.record_violation_at(key, self.clock.now_ms()).await
    }

    /// Count a rejection that happened at `now_ms`.
    ///
    /// Used when the write runs detached from the request, so the violation
    /// and any resulting ban are stamped with the rejection time.
    pub async fn record_violation_at(&self, key: &str, now_ms: u64) -> Result<u64> {
        let window = self.config.blacklist_duration_ms;
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());

        let count = self
            .store
            .increment(&keys::violations(key), window, now_ms, &member)
            .await?;
        debug!(key = %key, violations = count, "Recorded violation");

        if count >= self.config.violation_threshold {
            self.ban(key, window, now_ms).await?;
        }
        Ok(count)
    }

    /// Ban `key` for `duration_ms`, or the configured ban length.
    ///
    /// Returns the ban expiry in epoch ms.
    pub async fn blacklist(&self, key: &str, duration_ms: Option<u64>) -> Result<u64> {
        let duration = duration_ms.unwrap_or(self.config.blacklist_duration_ms);
        self.ban(key, duration, self.clock.now_ms()).await
    }

    async fn ban(&self, key: &str, duration: u64, now_ms: u64) -> Result<u64> {
        self.store
            .set_expiring(&keys::blacklist(key), duration, now_ms)
            .await?;
        let expires_at = now_ms.saturating_add(duration);

        warn!(
            target: "bouncer::security",
            key = %key,
            expires_at,
            duration_ms = duration,
            "Key blacklisted"
        );
        self.telemetry.record_security_event();
        Ok(expires_at)
    }

    /// Exempt `key` from every limit for `duration_ms`, or the configured
    /// whitelist length.
    pub async fn whitelist(&self, key: &str, duration_ms: Option<u64>) -> Result<u64> {
        let now = self.clock.now_ms();
        let duration = duration_ms.unwrap_or(self.config.whitelist_duration_ms);

        self.store
            .set_expiring(&keys::whitelist(key), duration, now)
            .await?;
        let expires_at = now.saturating_add(duration);

        info!(key = %key, expires_at, "Key whitelisted");
        Ok(expires_at)
    }

    pub async fn is_blacklisted(&self, key: &str) -> Result<bool> {
        Ok(self.blacklist_expiry(key).await?.is_some())
    }

    pub async fn is_whitelisted(&self, key: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .expires_at(&keys::whitelist(key), now)
            .await?
            .is_some())
    }

    /// When the ban on `key` lifts, `None` if it is not banned.
    pub async fn blacklist_expiry(&self, key: &str) -> Result<Option<u64>> {
        let now = self.clock.now_ms();
        self.store.expires_at(&keys::blacklist(key), now).await
    }

    /// Resolve whitelist and blacklist entries for every key of a request.
    ///
    /// All lookups run concurrently. A whitelist entry on any key wins; among
    /// blacklisted keys the narrowest is reported.
    pub async fn status(&self, request_keys: &[RateLimitKey]) -> Result<Standing> {
        let now = self.clock.now_ms();
        let whitelist_keys: Vec<String> = request_keys
            .iter()
            .map(|key| keys::whitelist(&key.to_string_key()))
            .collect();
        let blacklist_keys: Vec<String> = request_keys
            .iter()
            .map(|key| keys::blacklist(&key.to_string_key()))
            .collect();

        let whitelist_lookups = whitelist_keys
            .iter()
            .map(|key| self.store.expires_at(key, now));
        let blacklist_lookups = blacklist_keys
            .iter()
            .map(|key| self.store.expires_at(key, now));

        let (whitelisted, blacklisted) = futures::try_join!(
            try_join_all(whitelist_lookups),
            try_join_all(blacklist_lookups)
        )?;

        if let Some((key, _)) = request_keys
            .iter()
            .zip(&whitelisted)
            .find(|(_, expiry)| expiry.is_some())
        {
            return Ok(Standing::Whitelisted { key: key.clone() });
        }

        let banned = request_keys
            .iter()
            .zip(&blacklisted)
            .filter_map(|(key, expiry)| expiry.map(|expires_at| (key, expires_at)))
            .max_by_key(|(key, _)| key.dimension.narrowness());

        Ok(match banned {
            Some((key, expires_at)) => Standing::Blacklisted {
                key: key.clone(),
                expires_at,
            },
            None => Standing::Clear,
        })
    }
}
