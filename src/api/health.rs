//! Liveness probe and root service descriptor.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Per-provider API-key presence check — `"configured"` or `"not_configured"`,
/// never the key value itself.
const PROVIDER_ENV_VARS: &[(&str, &str)] = &[
    ("huggingface", "HF_TOKEN"),
    ("ollama", "OLLAMA_BASE_URL"),
    ("ollamafreeapi", "OLLAMAFREE_API_KEY"),
    ("openrouter", "OPENROUTER_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("deepseek", "DEEPSEEK_API_KEY"),
    ("gemini", "GEMINI_API_KEY"),
    ("groq", "GROQ_API_KEY"),
    ("xai", "XAI_API_KEY"),
];

/// `GET /health` — always 200, never blocks. Safe as a container liveness probe.
pub async fn health() -> impl IntoResponse {
    let providers: serde_json::Map<String, serde_json::Value> = PROVIDER_ENV_VARS
        .iter()
        .map(|(provider, env_var)| {
            let status = if std::env::var(env_var).map(|v| !v.is_empty()).unwrap_or(false) {
                "configured"
            } else {
                "not_configured"
            };
            (provider.to_string(), json!(status))
        })
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rainymodel",
            "version": env!("CARGO_PKG_VERSION"),
            "providers": providers,
        })),
    )
}

/// `GET /` — static service descriptor.
pub async fn root() -> impl IntoResponse {
    Json(json!({
        "name": "RainyModel",
        "description": "Intelligent LLM routing proxy",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "models": "/v1/models",
            "chat_completions": "/v1/chat/completions",
            "providers": "/v1/providers",
            "auto_config": "/v1/auto/config",
            "health": "/health",
            "dashboard": "/dashboard/api/overview",
        },
    }))
}
