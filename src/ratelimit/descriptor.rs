//! Rate limit dimensions, keys and request identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One axis of rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// A single counter shared by every request
    Global,
    /// Caller IP address
    Ip,
    /// Authenticated user id
    User,
    /// Exact `METHOD path` of the target endpoint
    Endpoint,
    /// Calling service declared by the request
    Service,
}

impl Dimension {
    /// Every dimension, from broadest to narrowest.
    pub const ALL: [Dimension; 5] = [
        Dimension::Global,
        Dimension::Service,
        Dimension::Ip,
        Dimension::User,
        Dimension::Endpoint,
    ];

    /// Scope rank used to pick the reported violation; higher is narrower.
    ///
    /// endpoint > user > ip > service > global
    pub fn narrowness(&self) -> u8 {
        match self {
            Dimension::Endpoint => 4,
            Dimension::User => 3,
            Dimension::Ip => 2,
            Dimension::Service => 1,
            Dimension::Global => 0,
        }
    }

    /// Whether a key of this dimension belongs to a single caller.
    ///
    /// Only such keys accumulate violations; `global` and `service` counters
    /// are shared by many callers and are never banned automatically.
    pub fn identifies_caller(&self) -> bool {
        matches!(self, Dimension::Ip | Dimension::User | Dimension::Endpoint)
    }

    /// Lowercase name used in keys, payloads and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::Ip => "ip",
            Dimension::User => "user",
            Dimension::Endpoint => "endpoint",
            Dimension::Service => "service",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one rate limit counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The dimension this key belongs to
    pub dimension: Dimension,
    /// Caller-derived identifier, empty for the global key
    pub identifier: String,
}

impl RateLimitKey {
    /// Create a key for a dimension and identifier.
    pub fn new(dimension: Dimension, identifier: impl Into<String>) -> Self {
        Self {
            dimension,
            identifier: identifier.into(),
        }
    }

    /// The singleton global key.
    pub fn global() -> Self {
        Self::new(Dimension::Global, "")
    }

    /// Convert the key to its opaque storage form.
    pub fn to_string_key(&self) -> String {
        if self.identifier.is_empty() {
            self.dimension.as_str().to_string()
        } else {
            format!("{}:{}", self.dimension, self.identifier)
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Identity context extracted from an inbound request by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdentity {
    /// Caller IP address
    pub ip: String,
    /// Authenticated user id, absent for anonymous callers
    #[serde(default)]
    pub user_id: Option<String>,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Calling service declared by the request
    #[serde(default)]
    pub service: Option<String>,
}

impl RequestIdentity {
    /// Identity for an anonymous request.
    pub fn new(ip: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id: None,
            method: method.into(),
            path: path.into(),
            service: None,
        }
    }

    /// Attach an authenticated user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a declared calling service.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// The `METHOD path` pair endpoint limits are configured against.
    pub fn endpoint(&self) -> String {
        endpoint_id(&self.method, &self.path)
    }

    /// Authenticated user id, treating blank ids as anonymous.
    pub fn user(&self) -> Option<&str> {
        non_blank(self.user_id.as_deref())
    }

    /// Declared service, treating blank names as undeclared.
    pub fn service(&self) -> Option<&str> {
        non_blank(self.service.as_deref())
    }

    /// Key for a dimension, `None` when the request has no such identity.
    ///
    /// Endpoint counters are scoped per caller IP so that one abusive caller
    /// cannot exhaust an endpoint for everyone.
    pub fn key_for(&self, dimension: Dimension) -> Option<RateLimitKey> {
        match dimension {
            Dimension::Global => Some(RateLimitKey::global()),
            Dimension::Ip => Some(RateLimitKey::new(Dimension::Ip, self.ip.as_str())),
            Dimension::User => self.user().map(|u| RateLimitKey::new(Dimension::User, u)),
            Dimension::Endpoint => Some(RateLimitKey::new(
                Dimension::Endpoint,
                format!("{}:{}", self.endpoint(), self.ip),
            )),
            Dimension::Service => self
                .service()
                .map(|s| RateLimitKey::new(Dimension::Service, s)),
        }
    }
}

/// Canonical `METHOD path` form, method uppercased.
pub fn endpoint_id(method: &str, path: &str) -> String {
    format!("{} {}", method.trim().to_ascii_uppercase(), path.trim())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
