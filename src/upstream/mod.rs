//! Upstream Adapter — abstracts the concrete LLM client behind two
//! operations (spec §4.4): a non-streaming unary call returning a response
//! object, and a streaming call returning an async chunk sequence.
//!
//! Per-call timeout, retries within a single upstream, and backoff-on-cooldown
//! all live here, keyed per deployment — the Request Pipeline only ever sees
//! one attempt's outcome for one deployment and moves to the next candidate
//! itself; it never retries the same deployment.

mod anthropic;
mod gemini;
mod huggingface;
mod ollama;
mod openai_compat;
mod sse;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use huggingface::HuggingFaceAdapter;
pub use ollama::OllamaAdapter;
pub use openai_compat::OpenAiCompatAdapter;

use std::{
    pin::Pin,
    sync::atomic::{AtomicI64, AtomicU32, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use futures_util::Stream;
use serde_json::{Map, Value};

use crate::catalog::Deployment;
use crate::config::RouterSettings;
use crate::error::RoutingError;

/// One streamed chunk, carried in its canonical JSON dict form — the
/// Pipeline re-serialises this verbatim into the SSE `data: ` frame.
#[derive(Debug, Clone)]
pub struct Chunk(pub Value);

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, RoutingError>> + Send>>;

/// Parsed result of one non-streaming call.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub body: Value,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Adapter construction settings shared by every deployment (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct AdapterSettings {
    pub num_retries: u32,
    pub per_call_timeout: Duration,
    pub retry_after: Duration,
    pub allowed_fails: u32,
    pub cooldown_time: Duration,
}

impl From<&RouterSettings> for AdapterSettings {
    fn from(s: &RouterSettings) -> Self {
        AdapterSettings {
            num_retries: s.num_retries,
            per_call_timeout: Duration::from_secs(s.timeout),
            retry_after: Duration::from_secs(s.retry_after),
            allowed_fails: s.allowed_fails,
            cooldown_time: Duration::from_secs(s.cooldown_time),
        }
    }
}

/// Per-deployment failure bookkeeping backing the cooldown window.
#[derive(Default)]
struct CooldownState {
    consecutive_fails: AtomicU32,
    cooldown_until_unix_ms: AtomicI64,
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// The Upstream Adapter (spec §4.4). One instance is shared across all
/// deployments; the concrete per-call client (OpenAI-compatible, Anthropic,
/// Gemini, ...) is selected per call from `deployment.route_info.upstream`.
pub struct UpstreamAdapter {
    settings: AdapterSettings,
    cooldowns: DashMap<String, CooldownState>,
    clients: DashMap<String, reqwest::Client>,
}

impl UpstreamAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        UpstreamAdapter {
            settings,
            cooldowns: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    /// Rebuild with new `router_settings` on config hot-reload. Cooldown
    /// state is intentionally preserved — a reload shouldn't reset a
    /// deployment that's mid-cooldown for a real reason.
    pub fn update_settings(&mut self, settings: AdapterSettings) {
        self.settings = settings;
    }

    fn deployment_key(d: &Deployment) -> String {
        format!("{}::{}::{}", d.alias, d.route_info.upstream, d.route_info.model)
    }

    fn in_cooldown(&self, key: &str) -> bool {
        match self.cooldowns.get(key) {
            Some(state) => now_unix_ms() < state.cooldown_until_unix_ms.load(Ordering::Relaxed),
            None => false,
        }
    }

    fn record_success(&self, key: &str) {
        if let Some(state) = self.cooldowns.get(key) {
            state.consecutive_fails.store(0, Ordering::Relaxed);
            state.cooldown_until_unix_ms.store(0, Ordering::Relaxed);
        }
    }

    fn record_failure(&self, key: &str) {
        let state = self.cooldowns.entry(key.to_string()).or_default();
        let fails = state.consecutive_fails.fetch_add(1, Ordering::Relaxed) + 1;
        if fails >= self.settings.allowed_fails {
            let until = now_unix_ms() + self.settings.cooldown_time.as_millis() as i64;
            state.cooldown_until_unix_ms.store(until, Ordering::Relaxed);
        }
    }

    fn client_for(&self, base_url: &str) -> reqwest::Client {
        if let Some(existing) = self.clients.get(base_url) {
            return existing.clone();
        }
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build reqwest client");
        self.clients.insert(base_url.to_string(), client.clone());
        client
    }

    fn cooldown_error(upstream: &str) -> RoutingError {
        RoutingError::UpstreamFailure {
            kind: "Cooldown".to_string(),
            message: format!("{upstream} is in its failure cooldown window"),
        }
    }

    fn timeout_error(&self) -> RoutingError {
        RoutingError::UpstreamFailure {
            kind: "Timeout".to_string(),
            message: format!("exceeded per-call timeout of {:?}", self.settings.per_call_timeout),
        }
    }

    /// Non-streaming call (spec §4.4 `call_unary`). Retries up to
    /// `num_retries` additional times within this single deployment,
    /// separated by `retry_after`, each bounded by `per_call_timeout`.
    pub async fn call_unary(
        &self,
        deployment: &Deployment,
        params: &Map<String, Value>,
    ) -> Result<UpstreamResponse, RoutingError> {
        let key = Self::deployment_key(deployment);
        if self.in_cooldown(&key) {
            return Err(Self::cooldown_error(&deployment.route_info.upstream));
        }

        let mut last_err = None;
        for attempt in 0..=self.settings.num_retries {
            let attempt_result = tokio::time::timeout(
                self.settings.per_call_timeout,
                self.dispatch_unary(deployment, params),
            )
            .await;

            match attempt_result {
                Ok(Ok(resp)) => {
                    self.record_success(&key);
                    return Ok(resp);
                }
                Ok(Err(e)) => last_err = Some(upstream_failure(&deployment.route_info.upstream, e)),
                Err(_elapsed) => last_err = Some(self.timeout_error()),
            }

            if attempt < self.settings.num_retries {
                tokio::time::sleep(self.settings.retry_after).await;
            }
        }

        self.record_failure(&key);
        Err(last_err.unwrap_or_else(|| RoutingError::UpstreamFailure {
            kind: "Unknown".to_string(),
            message: "no attempt was made".to_string(),
        }))
    }

    /// Streaming call (spec §4.4 `call_stream`). The same retry/cooldown
    /// policy governs *establishing* the stream; once chunks are flowing,
    /// a failure surfaces as an `Err` item in the stream instead (the
    /// Pipeline turns that into an inline SSE error frame, not a fallback).
    pub async fn call_stream(
        &self,
        deployment: &Deployment,
        params: &Map<String, Value>,
    ) -> Result<ChunkStream, RoutingError> {
        let key = Self::deployment_key(deployment);
        if self.in_cooldown(&key) {
            return Err(Self::cooldown_error(&deployment.route_info.upstream));
        }

        let mut last_err = None;
        for attempt in 0..=self.settings.num_retries {
            let attempt_result = tokio::time::timeout(
                self.settings.per_call_timeout,
                self.dispatch_stream(deployment, params),
            )
            .await;

            match attempt_result {
                Ok(Ok(stream)) => {
                    self.record_success(&key);
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(upstream_failure(&deployment.route_info.upstream, e)),
                Err(_elapsed) => last_err = Some(self.timeout_error()),
            }

            if attempt < self.settings.num_retries {
                tokio::time::sleep(self.settings.retry_after).await;
            }
        }

        self.record_failure(&key);
        Err(last_err.unwrap_or_else(|| RoutingError::UpstreamFailure {
            kind: "Unknown".to_string(),
            message: "no attempt was made".to_string(),
        }))
    }

    async fn dispatch_unary(
        &self,
        deployment: &Deployment,
        params: &Map<String, Value>,
    ) -> anyhow::Result<UpstreamResponse> {
        let base_url = base_url_for(deployment, params);
        let api_key = api_key_for(params);
        let client = self.client_for(&base_url);

        match deployment.route_info.upstream.as_str() {
            "anthropic" => AnthropicAdapter::new(client, base_url, api_key).call_unary(params).await,
            "gemini" => GeminiAdapter::new(client, base_url, api_key).call_unary(params).await,
            "hf" => HuggingFaceAdapter::new(client, base_url, api_key).call_unary(params).await,
            "ollama" | "ollamafreeapi" => {
                OllamaAdapter::new(client, base_url).call_unary(params).await
            }
            _ => OpenAiCompatAdapter::new(client, base_url, api_key).call_unary(params).await,
        }
    }

    async fn dispatch_stream(
        &self,
        deployment: &Deployment,
        params: &Map<String, Value>,
    ) -> anyhow::Result<ChunkStream> {
        let base_url = base_url_for(deployment, params);
        let api_key = api_key_for(params);
        let client = self.client_for(&base_url);

        match deployment.route_info.upstream.as_str() {
            "anthropic" => {
                AnthropicAdapter::new(client, base_url, api_key).call_stream(params).await
            }
            "gemini" => GeminiAdapter::new(client, base_url, api_key).call_stream(params).await,
            "hf" => HuggingFaceAdapter::new(client, base_url, api_key).call_stream(params).await,
            "ollama" | "ollamafreeapi" => {
                OllamaAdapter::new(client, base_url).call_stream(params).await
            }
            _ => OpenAiCompatAdapter::new(client, base_url, api_key).call_stream(params).await,
        }
    }
}

fn base_url_for(deployment: &Deployment, params: &Map<String, Value>) -> String {
    params
        .get("api_base")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| default_base_url(&deployment.route_info.upstream))
}

fn api_key_for(params: &Map<String, Value>) -> Option<String> {
    params
        .get("api_key")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Fallback base URL per vendor when a deployment doesn't set `api_base`
/// explicitly — lets a config entry say just `model: gpt-4o` and get a
/// working default endpoint.
fn default_base_url(upstream: &str) -> String {
    match upstream {
        "openai" => "https://api.openai.com",
        "anthropic" => "https://api.anthropic.com",
        "deepseek" => "https://api.deepseek.com",
        "xai" => "https://api.x.ai",
        "gemini" => "https://generativelanguage.googleapis.com",
        "openrouter" => "https://openrouter.ai/api",
        "hf" => "https://router.huggingface.co",
        "ollama" => "http://localhost:11434",
        "ollamafreeapi" => "https://ollamafreeapi.example.com",
        _ => "https://openrouter.ai/api",
    }
    .to_string()
}

/// Convert any upstream adapter's internal `anyhow::Error` into the typed
/// `RoutingError::UpstreamFailure` the Pipeline's fallback loop matches on.
pub(crate) fn upstream_failure(kind: &str, err: anyhow::Error) -> RoutingError {
    RoutingError::UpstreamFailure {
        kind: kind.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{RouteInfo, Tier};

    fn test_deployment(upstream: &str) -> Deployment {
        Deployment {
            alias: "rainymodel/chat".to_string(),
            upstream_params: Map::new(),
            description: String::new(),
            tier: Tier::Premium,
            route_info: RouteInfo {
                route: "premium",
                upstream: upstream.to_string(),
                model: "some-model".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn cooldown_engages_after_allowed_fails_and_blocks_next_call() {
        let settings = AdapterSettings {
            num_retries: 0,
            per_call_timeout: Duration::from_millis(50),
            retry_after: Duration::from_millis(1),
            allowed_fails: 1,
            cooldown_time: Duration::from_secs(60),
        };
        let adapter = UpstreamAdapter::new(settings);
        let deployment = test_deployment("openai");
        let mut params = Map::new();
        // Unroutable host — the single attempt fails fast.
        params.insert("api_base".into(), Value::String("http://127.0.0.1:1".into()));
        params.insert("model".into(), Value::String("gpt-4o".into()));

        let first = adapter.call_unary(&deployment, &params).await;
        assert!(first.is_err());

        let key = UpstreamAdapter::deployment_key(&deployment);
        assert!(adapter.in_cooldown(&key));

        let second = adapter.call_unary(&deployment, &params).await;
        match second {
            Err(RoutingError::UpstreamFailure { kind, .. }) => assert_eq!(kind, "Cooldown"),
            other => panic!("expected Cooldown failure, got {other:?}"),
        }
    }

    #[test]
    fn default_base_url_is_stable_per_vendor() {
        assert_eq!(default_base_url("anthropic"), "https://api.anthropic.com");
        assert_eq!(default_base_url("ollama"), "http://localhost:11434");
    }
}
