//! Hugging Face Inference Providers adapter — `free-hf` deployments.
//!
//! HF's router exposes an OpenAI-wire-compatible `/v1/chat/completions`
//! endpoint (`https://router.huggingface.co/v1/chat/completions`) with a
//! plain bearer token, so this is a thin wrapper over
//! [`super::OpenAiCompatAdapter`] rather than a distinct schema translation.

use reqwest::Client;
use serde_json::{Map, Value};

use super::{ChunkStream, OpenAiCompatAdapter, UpstreamResponse};

pub struct HuggingFaceAdapter {
    inner: OpenAiCompatAdapter,
}

impl HuggingFaceAdapter {
    pub fn new(client: Client, base_url: String, api_key: Option<String>) -> Self {
        Self { inner: OpenAiCompatAdapter::new(client, base_url, api_key) }
    }

    pub async fn call_unary(&self, params: &Map<String, Value>) -> anyhow::Result<UpstreamResponse> {
        self.inner.call_unary(params).await
    }

    pub async fn call_stream(&self, params: &Map<String, Value>) -> anyhow::Result<ChunkStream> {
        self.inner.call_stream(params).await
    }
}
