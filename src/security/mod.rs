//! Request gating: shared-token auth and per-key rate limiting.

pub mod auth;
pub mod ratelimit;

pub use auth::AuthGate;
pub use ratelimit::RateLimiter;
