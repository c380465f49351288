//! HTTP surface of the channel sync engine.
//!
//! - [`http_api`]: axum router with the webhook receiver and the sync
//!   trigger endpoints
//! - [`auth`]: API key middleware guarding `/api/*`
//! - [`api_error`]: JSON error responses

pub mod api_error;
pub mod auth;
pub mod http_api;
