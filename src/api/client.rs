//! Public client-facing surface: model listing, provider introspection, and
//! the `/v1/chat/completions` entry point that hands off to the
//! [`crate::pipeline`].

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::pipeline::{self, PipelineState, DEFAULT_ALIAS};
use crate::planner::Policy;

/// The four published aliases, grounded verbatim in the original router's
/// static `KNOWN_MODELS` table — these descriptions are the only place the
/// four "editorial" alias meanings (auto/chat/code/agent) are written down.
fn known_models() -> Vec<Value> {
    vec![
        json!({
            "id": "rainymodel/auto",
            "object": "model",
            "owned_by": "rainymodel",
            "description": "Auto routing - cheapest/free first, then internal, then premium",
        }),
        json!({
            "id": "rainymodel/chat",
            "object": "model",
            "owned_by": "rainymodel",
            "description": "General/Persian chat - optimized for conversation",
        }),
        json!({
            "id": "rainymodel/code",
            "object": "model",
            "owned_by": "rainymodel",
            "description": "Coding tasks - Qwen Coder models preferred",
        }),
        json!({
            "id": "rainymodel/agent",
            "object": "model",
            "owned_by": "rainymodel",
            "description": "Agent/complex tasks - long context + tool-capable models",
        }),
    ]
}

/// `GET /v1/models` — OpenAI-compatible listing envelope.
pub async fn list_models() -> impl IntoResponse {
    Json(json!({ "object": "list", "data": known_models() }))
}

struct ProviderMapping {
    id: &'static str,
    name: &'static str,
    key_env: &'static str,
    base_env: Option<&'static str>,
}

const PROVIDER_MAPPINGS: &[ProviderMapping] = &[
    ProviderMapping { id: "ollama", name: "Ollama", key_env: "OLLAMA_API_KEY", base_env: Some("OLLAMA_BASE_URL") },
    ProviderMapping { id: "openrouter", name: "OpenRouter", key_env: "OPENROUTER_API_KEY", base_env: None },
    ProviderMapping { id: "huggingface", name: "HuggingFace", key_env: "HF_TOKEN", base_env: None },
    ProviderMapping { id: "ollamafreeapi", name: "OllamaFreeAPI", key_env: "OLLAMAFREE_API_KEY", base_env: Some("OLLAMAFREE_API_BASE") },
    ProviderMapping { id: "openai", name: "OpenAI", key_env: "OPENAI_API_KEY", base_env: Some("OPENAI_API_BASE") },
    ProviderMapping { id: "anthropic", name: "Anthropic/Claude", key_env: "ANTHROPIC_API_KEY", base_env: None },
    ProviderMapping { id: "deepseek", name: "DeepSeek", key_env: "DEEPSEEK_API_KEY", base_env: None },
    ProviderMapping { id: "gemini", name: "Google Gemini", key_env: "GEMINI_API_KEY", base_env: None },
    ProviderMapping { id: "groq", name: "Groq", key_env: "GROQ_API_KEY", base_env: None },
    ProviderMapping { id: "xai", name: "xAI/Grok", key_env: "XAI_API_KEY", base_env: None },
];

/// `GET /v1/providers` — configured/not_configured per upstream vendor.
pub async fn list_providers() -> impl IntoResponse {
    let providers: serde_json::Map<String, Value> = PROVIDER_MAPPINGS
        .iter()
        .map(|m| {
            let has_key = std::env::var(m.key_env).map(|v| !v.is_empty()).unwrap_or(false);
            let has_base = m.base_env.map(|e| std::env::var(e).map(|v| !v.is_empty()).unwrap_or(false)).unwrap_or(true);
            let base_url = m.base_env.and_then(|e| std::env::var(e).ok());
            (
                m.id.to_string(),
                json!({ "name": m.name, "configured": has_key && has_base, "base_url": base_url }),
            )
        })
        .collect();
    Json(json!({ "providers": providers }))
}

/// `GET /v1/auto/config` — recommended defaults, derived from which
/// providers currently hold credentials.
pub async fn auto_config() -> impl IntoResponse {
    let mut available = Vec::new();
    if std::env::var("HF_TOKEN").map(|v| !v.is_empty()).unwrap_or(false) {
        available.push(json!({ "tier": "free", "provider": "huggingface" }));
    }
    if std::env::var("OLLAMA_BASE_URL").map(|v| !v.is_empty()).unwrap_or(false) {
        available.push(json!({ "tier": "internal", "provider": "ollama" }));
    }
    if std::env::var("OLLAMAFREE_API_KEY").map(|v| !v.is_empty()).unwrap_or(false) {
        available.push(json!({ "tier": "free", "provider": "ollamafreeapi" }));
    }
    if std::env::var("OPENROUTER_API_KEY").map(|v| !v.is_empty()).unwrap_or(false) {
        available.push(json!({ "tier": "premium", "provider": "openrouter" }));
    }
    if std::env::var("OPENAI_API_KEY").map(|v| !v.is_empty()).unwrap_or(false) {
        available.push(json!({ "tier": "premium", "provider": "openai" }));
    }
    if std::env::var("ANTHROPIC_API_KEY").map(|v| !v.is_empty()).unwrap_or(false) {
        available.push(json!({ "tier": "premium", "provider": "anthropic" }));
    }

    Json(json!({
        "default_model": DEFAULT_ALIAS,
        "default_policy": "auto",
        "available_providers": available,
        "recommended_models": known_models(),
    }))
}

/// `POST /v1/chat/completions` — the hot path. Reads `X-RainyModel-Policy`
/// (default `auto`), coerces a non-`rainymodel/*` model id the same way the
/// pipeline coerces an unknown alias, and dispatches to the unary or
/// streaming fallback loop depending on the body's `stream` flag.
pub async fn chat_completions(
    State(state): State<Arc<PipelineState>>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    let policy = headers
        .get("x-rainymodel-policy")
        .and_then(|v| v.to_str().ok())
        .map(Policy::parse)
        .unwrap_or(Policy::Auto);

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_ALIAS.to_string());
    let model = if model.starts_with("rainymodel/") { model } else { DEFAULT_ALIAS.to_string() };
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), json!(model));
    }

    let is_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    if is_stream {
        pipeline::handle_stream(state, Some(model), policy, body).await
    } else {
        pipeline::handle_unary(&state, Some(&model), policy, body).await
    }
}

/// Fallback 404 for anything not routed, mirroring the teacher's explicit
/// "unknown path" response rather than axum's bare default body.
pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}
