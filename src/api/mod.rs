//! HTTP surface: client-facing routes, dashboard read APIs, and the
//! middleware stack (request IDs, master-key auth, rate limiting).

pub mod client;
pub mod client_auth;
pub mod dashboard;
pub mod health;
pub mod rate_limit;
pub mod request_id;
