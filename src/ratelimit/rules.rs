//! Limit tiers and endpoint overrides.
//!
//! Every dimension carries an optional default rule; a dimension without a
//! rule is simply not limited. Exact `METHOD path` overrides take precedence
//! over the endpoint default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::descriptor::{endpoint_id, Dimension, RateLimitKey, RequestIdentity};
use crate::error::{BouncerError, Result};

/// A trailing-window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Length of the trailing window in milliseconds
    pub window_ms: u64,
    /// Requests admitted within one window
    pub max_requests: u64,
}

impl LimitRule {
    /// Create a new rule.
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }
}

/// Recognized limit tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitTiers {
    /// Limit shared by all traffic
    #[serde(default = "default_global")]
    pub global: Option<LimitRule>,

    /// Per caller IP
    #[serde(default = "default_ip")]
    pub ip: Option<LimitRule>,

    /// Per authenticated user
    #[serde(default = "default_user")]
    pub user: Option<LimitRule>,

    /// Default per-endpoint limit for endpoints without an override
    #[serde(default)]
    pub endpoint: Option<LimitRule>,

    /// Per declared calling service
    #[serde(default)]
    pub service: Option<LimitRule>,

    /// Overrides keyed by exact `"METHOD path"`
    #[serde(default)]
    pub endpoints: HashMap<String, LimitRule>,
}

impl Default for LimitTiers {
    fn default() -> Self {
        Self {
            global: default_global(),
            ip: default_ip(),
            user: default_user(),
            endpoint: None,
            service: None,
            endpoints: HashMap::new(),
        }
    }
}

fn default_global() -> Option<LimitRule> {
    Some(LimitRule::new(60_000, 10_000))
}

fn default_ip() -> Option<LimitRule> {
    Some(LimitRule::new(900_000, 100))
}

fn default_user() -> Option<LimitRule> {
    Some(LimitRule::new(900_000, 1_000))
}

impl LimitTiers {
    /// Tiers with no limits at all.
    pub fn unlimited() -> Self {
        Self {
            global: None,
            ip: None,
            user: None,
            endpoint: None,
            service: None,
            endpoints: HashMap::new(),
        }
    }

    /// Load tiers from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit tiers");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate tiers from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let tiers: LimitTiers = serde_yaml::from_str(yaml)
            .map_err(|e| BouncerError::Config(format!("Failed to parse limit tiers: {}", e)))?;
        tiers.validated()
    }

    /// Add or replace an endpoint override.
    pub fn with_endpoint(mut self, method: &str, path: &str, rule: LimitRule) -> Self {
        self.endpoints.insert(endpoint_id(method, path), rule);
        self
    }

    /// Set the default rule for a dimension.
    pub fn with_dimension(mut self, dimension: Dimension, rule: Option<LimitRule>) -> Self {
        *self.slot_mut(dimension) = rule;
        self
    }

    /// Check every rule and canonicalize endpoint override keys.
    pub fn validated(self) -> Result<Self> {
        for dimension in Dimension::ALL {
            if let Some(rule) = self.default_for(dimension) {
                validate_rule(dimension.as_str(), rule)?;
            }
        }

        let mut endpoints = HashMap::with_capacity(self.endpoints.len());
        for (raw, rule) in self.endpoints {
            let canonical = parse_endpoint(&raw)?;
            validate_rule(&canonical, &rule)?;
            if endpoints.insert(canonical.clone(), rule).is_some() {
                return Err(BouncerError::Config(format!(
                    "endpoint override `{}` is defined more than once",
                    canonical
                )));
            }
        }

        Ok(Self { endpoints, ..self })
    }

    /// Default rule for a dimension.
    pub fn default_for(&self, dimension: Dimension) -> Option<&LimitRule> {
        match dimension {
            Dimension::Global => self.global.as_ref(),
            Dimension::Ip => self.ip.as_ref(),
            Dimension::User => self.user.as_ref(),
            Dimension::Endpoint => self.endpoint.as_ref(),
            Dimension::Service => self.service.as_ref(),
        }
    }

    fn slot_mut(&mut self, dimension: Dimension) -> &mut Option<LimitRule> {
        match dimension {
            Dimension::Global => &mut self.global,
            Dimension::Ip => &mut self.ip,
            Dimension::User => &mut self.user,
            Dimension::Endpoint => &mut self.endpoint,
            Dimension::Service => &mut self.service,
        }
    }

    /// Find the rule governing one dimension of a request.
    pub fn find_limit(&self, dimension: Dimension, identity: &RequestIdentity) -> Option<&LimitRule> {
        if dimension == Dimension::Endpoint {
            if let Some(rule) = self.endpoints.get(&identity.endpoint()) {
                return Some(rule);
            }
        }
        self.default_for(dimension)
    }

    /// Every key the request must be checked against, with its rule.
    ///
    /// Dimensions the request has no identity for, or that carry no rule,
    /// are skipped.
    pub fn applicable(&self, identity: &RequestIdentity) -> Vec<(RateLimitKey, LimitRule)> {
        Dimension::ALL
            .iter()
            .filter_map(|&dimension| {
                let rule = self.find_limit(dimension, identity)?;
                let key = identity.key_for(dimension)?;
                Some((key, *rule))
            })
            .collect()
    }
}

fn validate_rule(name: &str, rule: &LimitRule) -> Result<()> {
    if rule.window_ms == 0 {
        return Err(BouncerError::Config(format!(
            "limit `{}` must have a window_ms greater than 0",
            name
        )));
    }
    if i64::try_from(rule.window_ms).is_err() {
        return Err(BouncerError::Config(format!(
            "limit `{}` has a window_ms above {}",
            name,
            i64::MAX
        )));
    }
    Ok(())
}

/// Parse a `"METHOD path"` override key into canonical form.
fn parse_endpoint(raw: &str) -> Result<String> {
    let invalid = || {
        BouncerError::Config(format!(
            "endpoint override `{}` must look like `METHOD /path`",
            raw
        ))
    };

    let (method, path) = raw.trim().split_once(' ').ok_or_else(invalid)?;
    let path = path.trim();
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(invalid());
    }
    if !path.starts_with('/') || path.contains(char::is_whitespace) {
        return Err(invalid());
    }

    Ok(endpoint_id(method, path))
}
