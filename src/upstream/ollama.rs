//! Ollama adapter — local/self-hosted `free-ollamafree` and routed
//! `ollama` deployments.
//!
//! Ollama ships an OpenAI-compatible `/v1/chat/completions` endpoint, so this
//! adapter is intentionally thin: it carries no api_key (Ollama is unauthenticated)
//! and otherwise delegates straight to [`super::OpenAiCompatAdapter`].

use reqwest::Client;
use serde_json::{Map, Value};

use super::{ChunkStream, OpenAiCompatAdapter, UpstreamResponse};

pub struct OllamaAdapter {
    inner: OpenAiCompatAdapter,
}

impl OllamaAdapter {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { inner: OpenAiCompatAdapter::new(client, base_url, None) }
    }

    pub async fn call_unary(&self, params: &Map<String, Value>) -> anyhow::Result<UpstreamResponse> {
        self.inner.call_unary(params).await
    }

    pub async fn call_stream(&self, params: &Map<String, Value>) -> anyhow::Result<ChunkStream> {
        self.inner.call_stream(params).await
    }
}
