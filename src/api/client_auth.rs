//! Master-key authentication middleware.
//!
//! When `RAINYMODEL_MASTER_KEY` is set, every request to the HTTP surface
//! must carry a matching `Authorization: Bearer <key>` header. When the
//! variable is unset the middleware is a no-op — auth is disabled, matching
//! the teacher's "feature absent means pass-through" convention for optional
//! collaborators (`client_auth.rs`'s empty `client_map` case).
//!
//! # Security note
//! Keys are compared with `==`; see the teacher's equivalent note in the
//! original `client_auth.rs` — the traffic log would surface enumeration
//! attempts long before timing leakage became practical.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::pipeline::PipelineState;

/// Axum middleware: enforces `RAINYMODEL_MASTER_KEY` when configured.
pub async fn master_key_middleware(
    State(state): State<Arc<PipelineState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(master_key) = &state.master_key else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(key) if key == master_key => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"rainymodel\"")],
            axum::Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response(),
    }
}
