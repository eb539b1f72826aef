//! OpenAI-compatible chat completions adapter.
//!
//! Handles any deployment that speaks the OpenAI `/v1/chat/completions`
//! wire protocol verbatim — OpenAI itself, OpenRouter, DeepSeek, xAI, and any
//! other OpenAI-wire-compatible vendor. The request body is forwarded as-is
//! (already assembled by the Pipeline's parameter passthrough); no schema
//! translation is performed.

use anyhow::Context;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{Map, Value};

use super::{upstream_failure, Chunk, ChunkStream, UpstreamResponse};

pub struct OpenAiCompatAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatAdapter {
    pub fn new(client: Client, base_url: String, api_key: Option<String>) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string(), api_key }
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            req = req.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        req
    }

    pub async fn call_unary(&self, params: &Map<String, Value>) -> anyhow::Result<UpstreamResponse> {
        let body = upstream_body(params);
        let response = self.request(&body).send().await.context("sending request")?;

        let status = response.status();
        let text = response.text().await.context("reading response body")?;
        if !status.is_success() {
            anyhow::bail!("upstream returned HTTP {status}: {text}");
        }

        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing upstream response as JSON: {text}"))?;
        let input_tokens = value
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output_tokens = value
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(UpstreamResponse { body: value, input_tokens, output_tokens })
    }

    pub async fn call_stream(&self, params: &Map<String, Value>) -> anyhow::Result<ChunkStream> {
        let mut body = upstream_body(params);
        body["stream"] = Value::Bool(true);

        let response = self.request(&body).send().await.context("sending streaming request")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("upstream returned HTTP {status}: {text}");
        }

        let byte_stream = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
        let chunks = super::sse::decode(byte_stream)
            .map(|result| result.map(Chunk).map_err(|e| upstream_failure("StreamFailure", e)));
        Ok(Box::pin(chunks))
    }
}

/// Build the request body actually sent upstream: the opaque param bag with
/// routing-only keys (`api_base`, `api_key`, `timeout`) stripped.
fn upstream_body(params: &Map<String, Value>) -> Value {
    let mut body = params.clone();
    body.remove("api_base");
    body.remove("api_key");
    body.remove("timeout");
    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_body_strips_routing_only_keys() {
        let mut params = Map::new();
        params.insert("model".into(), Value::String("gpt-4o".into()));
        params.insert("api_base".into(), Value::String("https://api.openai.com".into()));
        params.insert("api_key".into(), Value::String("sk-x".into()));
        params.insert("timeout".into(), Value::from(30));
        params.insert("messages".into(), Value::Array(vec![]));

        let body = upstream_body(&params);
        assert!(body.get("api_base").is_none());
        assert!(body.get("api_key").is_none());
        assert!(body.get("timeout").is_none());
        assert_eq!(body["model"], "gpt-4o");
    }
}
