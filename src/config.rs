//! Configuration management for Bouncer.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `BOUNCER__<SECTION>__<KEY>` environment variables. Everything is
//! validated once at startup; nothing is re-parsed on the request path.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{BouncerError, Result};
use crate::ratelimit::LimitTiers;

/// Main configuration for the Bouncer service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BouncerConfig {
    /// HTTP sidecar configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limit tiers and endpoint overrides
    #[serde(default)]
    pub limits: LimitTiers,

    /// Violation counting and ban durations
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Admission policy
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// In-memory telemetry
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// HTTP sidecar configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the sidecar listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, single instance only
    Memory,
    /// Shared Redis-compatible store
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection (default: memory)
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Connection URL, credentials included (default: redis://127.0.0.1:6379/)
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for every stored key (default: "bouncer:")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Budget for a single store operation in milliseconds (default: 250)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Skip server-side scripting even when the backend offers it
    #[serde(default)]
    pub force_pipelined: bool,

    /// Sweep interval for the memory backend in milliseconds (default: 60000)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            force_pipelined: false,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl StoreConfig {
    /// Per-operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "bouncer:".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

/// Violation counting and ban durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Rejections within `blacklist_duration_ms` before a ban (default: 3)
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u64,

    /// Ban length, also the violation counting window (default: 1 hour)
    #[serde(default = "default_blacklist_duration_ms")]
    pub blacklist_duration_ms: u64,

    /// Default whitelist length (default: 24 hours)
    #[serde(default = "default_whitelist_duration_ms")]
    pub whitelist_duration_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            violation_threshold: default_violation_threshold(),
            blacklist_duration_ms: default_blacklist_duration_ms(),
            whitelist_duration_ms: default_whitelist_duration_ms(),
        }
    }
}

fn default_violation_threshold() -> u64 {
    3
}

fn default_blacklist_duration_ms() -> u64 {
    3_600_000
}

fn default_whitelist_duration_ms() -> u64 {
    86_400_000
}

/// Admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Admit requests when the engine itself fails (default: true)
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { fail_open: true }
    }
}

fn default_true() -> bool {
    true
}

/// In-memory telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Pending events before new ones are dropped (default: 4096)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Distinct keys tracked individually (default: 10000)
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_tracked_keys: default_max_tracked_keys(),
        }
    }
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_max_tracked_keys() -> usize {
    10_000
}

impl BouncerConfig {
    /// Load configuration from an optional file layered under the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BOUNCER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: BouncerConfig = builder.build()?.try_deserialize()?;
        config.validated()
    }

    /// Load configuration from a YAML file, ignoring the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BouncerConfig =
            serde_yaml::from_str(yaml).map_err(|e| BouncerError::Config(e.to_string()))?;
        config.validated()
    }

    /// Check invariants that would otherwise surface per request.
    pub fn validated(mut self) -> Result<Self> {
        self.limits = self.limits.validated()?;

        if self.store.timeout_ms == 0 {
            return Err(BouncerError::Config(
                "store.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.sweep_interval_ms == 0 {
            return Err(BouncerError::Config(
                "store.sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.escalation.violation_threshold == 0 {
            return Err(BouncerError::Config(
                "escalation.violation_threshold must be at least 1".to_string(),
            ));
        }
        if self.escalation.blacklist_duration_ms == 0 || self.escalation.whitelist_duration_ms == 0
        {
            return Err(BouncerError::Config(
                "escalation durations must be greater than 0".to_string(),
            ));
        }
        if self.telemetry.channel_capacity == 0 {
            return Err(BouncerError::Config(
                "telemetry.channel_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimitRule;

    #[test]
    fn test_defaults() {
        let config = BouncerConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert_eq!(config.escalation.violation_threshold, 3);
        assert!(config.admission.fail_open);
        assert!(config.validated().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  bind_addr: "0.0.0.0:9000"
store:
  backend: redis
  url: "redis://cache:6379/"
  force_pipelined: true
limits:
  ip:
    window_ms: 900000
    max_requests: 5
  endpoints:
    "POST /auth/login":
      window_ms: 900000
      max_requests: 5
escalation:
  violation_threshold: 5
"#;
        let config = BouncerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.bind_addr.port(), 9000);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert!(config.store.force_pipelined);
        assert_eq!(config.limits.ip, Some(LimitRule::new(900_000, 5)));
        assert_eq!(config.escalation.violation_threshold, 5);
        assert_eq!(config.escalation.blacklist_duration_ms, 3_600_000);
    }

    #[test]
    fn test_example_file_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/bouncer.example.yaml");
        let config = BouncerConfig::from_file(path).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(
            config.limits.endpoints.get("POST /auth/login"),
            Some(&LimitRule::new(900_000, 5))
        );
    }

    #[test]
    fn test_validation_rejects_zero_threshold() {
        let yaml = r#"
escalation:
  violation_threshold: 0
"#;
        assert!(matches!(
            BouncerConfig::from_yaml(yaml),
            Err(BouncerError::Config(_))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = BouncerConfig::default();
        config.store.timeout_ms = 0;
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_validation_reaches_limit_tiers() {
        let yaml = r#"
limits:
  endpoints:
    "login":
      window_ms: 1000
      max_requests: 1
"#;
        assert!(BouncerConfig::from_yaml(yaml).is_err());
    }
}
