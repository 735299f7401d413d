//! Rate limiting logic: dimensions, limit tiers, window checks and escalation.

mod descriptor;
mod escalation;
mod limiter;
mod rules;
mod window;

pub use descriptor::{endpoint_id, Dimension, RateLimitKey, RequestIdentity};
pub use escalation::{EscalationManager, Standing};
pub use limiter::{Decision, KeyCheck, Quota, TieredLimiter, Violation, ViolationReason};
pub use rules::{LimitRule, LimitTiers};
pub use window::{select_window_store, AtomicStore, PipelinedStore, WindowStore};
