//! Error types for RainyModel.
//!
//! [`RoutingError`] enumerates the typed error kinds the core distinguishes
//! (spec §7): config failures are fatal at startup, upstream/stream failures
//! drive the fallback loop and the SSE error frame, rate-limit and auth
//! failures short-circuit before any upstream is attempted.
//!
//! [`AppError`] is the generic axum adapter for anything that doesn't need
//! to be matched on — same shape as a typical `anyhow`-wrapping handler
//! error type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Typed error kinds distinguished by the routing core (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// Malformed configuration at startup. Fatal; HTTP surface returns 503
    /// until resolved.
    #[error("config error: {0}")]
    Config(String),

    /// The alias maps to no deployments, even after coercion to
    /// `rainymodel/auto`.
    #[error("no deployments configured for alias `{0}`")]
    UnknownAlias(String),

    /// Raised by the Upstream Adapter during a non-streaming attempt.
    /// Recoverable within the fallback loop.
    #[error("upstream failure ({kind}): {message}")]
    UpstreamFailure { kind: String, message: String },

    /// Raised during chunk iteration. Not recoverable — headers are already
    /// committed.
    #[error("stream failure: {0}")]
    StreamFailure(String),

    /// Sliding-window rate limit exceeded for the caller key.
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// Master-key / bearer auth failed.
    #[error("unauthorized")]
    Unauthorized,

    /// Every candidate deployment in the plan failed.
    #[error("all upstreams exhausted for `{alias}`: {last_error}")]
    Exhausted { alias: String, last_error: String },
}

impl RoutingError {
    /// The canonical error-type name surfaced in `x-rainymodel-fallback-reason`
    /// and `RequestRecord::error_type` — mirrors the Python original's use of
    /// `type(last_error).__name__`.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::UnknownAlias(_) => "UnknownAlias",
            Self::UpstreamFailure { .. } => "UpstreamFailure",
            Self::StreamFailure(_) => "StreamFailure",
            Self::RateLimited { .. } => "RateLimited",
            Self::Unauthorized => "Unauthorized",
            Self::Exhausted { .. } => "upstream_error",
        }
    }
}

impl IntoResponse for RoutingError {
    fn into_response(self) -> Response {
        match &self {
            Self::Config(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": msg })),
            )
                .into_response(),
            Self::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", retry_after_secs.to_string())],
                Json(json!({
                    "error": { "message": "Rate limit exceeded. Try again later.", "type": "rate_limit_error" }
                })),
            )
                .into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Unauthorized" })),
            )
                .into_response(),
            Self::Exhausted { last_error, .. } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": { "message": format!("All upstreams failed: {last_error}"), "type": "upstream_error" }
                })),
            )
                .into_response(),
            other => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": { "message": other.to_string(), "type": "upstream_error" } })),
            )
                .into_response(),
        }
    }
}

/// Generic axum error wrapper for anything that doesn't need to be matched
/// on — startup I/O, serde errors, etc.
///
/// Any type that implements `Into<anyhow::Error>` converts automatically via
/// the blanket [`From`] impl, so handlers can propagate with `?`.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "handler error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
