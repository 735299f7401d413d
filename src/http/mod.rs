//! HTTP sidecar exposing admission and the administrative surface.
//!
//! A proxy calls `POST /v1/admit` once per inbound request in forward-auth
//! style and forwards or rejects based on the status code.

mod handlers;
mod server;

pub use handlers::{AdminRequest, AdminResponse, AppState};
pub use server::{router, HttpServer};
