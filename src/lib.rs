//! Bouncer - Request Admission and Abuse Mitigation
//!
//! This crate decides, per inbound API request, whether to admit or reject
//! it. Requests are checked against trailing-window limits on several
//! overlapping dimensions (global, calling service, caller IP, user, endpoint)
//! held in a shared counter store. Repeat offenders are escalated to temporary
//! bans, and a failing store never takes the API down with it: admission fails
//! open.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
