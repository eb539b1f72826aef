//! Anthropic Messages API adapter — direct Claude deployments (`direct-claude`).
//!
//! Translates between the OpenAI chat-completions schema used internally for
//! parameter passthrough and Anthropic's `/v1/messages` API.
//!
//! | Concern | OpenAI | Anthropic |
//! |---|---|---|
//! | System prompt | message with `role: "system"` | top-level `system` field |
//! | Max tokens | optional | **required** |
//! | Finish reasons | `"stop"`, `"length"` | `"end_turn"`, `"max_tokens"` |
//! | Response shape | `choices[].message.content` | `content[].text` |
//! | Auth header | `Authorization: Bearer …` | `x-api-key: …` |
//! | Streaming | `choices[].delta.content` | `content_block_delta` events |

use anyhow::Context;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Map, Value};

use super::{upstream_failure, Chunk, ChunkStream, UpstreamResponse};

const DEFAULT_MAX_TOKENS: u64 = 8_192;
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl AnthropicAdapter {
    pub fn new(client: Client, base_url: String, api_key: Option<String>) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string(), api_key }
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/messages", self.base_url);
        let mut req = self
            .client
            .post(url)
            .json(body)
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", header::HeaderValue::from_str(key).unwrap_or_else(|_| header::HeaderValue::from_static("")));
        }
        req
    }

    pub async fn call_unary(&self, params: &Map<String, Value>) -> anyhow::Result<UpstreamResponse> {
        let anthropic_req = to_anthropic(params)?;
        let response = self.request(&anthropic_req).send().await.context("sending request")?;

        let status = response.status();
        let text = response.text().await.context("reading response body")?;
        if !status.is_success() {
            anyhow::bail!("Anthropic returned HTTP {status}: {text}");
        }

        let raw: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing Anthropic response as JSON: {text}"))?;
        let input_tokens = raw.pointer("/usage/input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output_tokens = raw.pointer("/usage/output_tokens").and_then(Value::as_u64).unwrap_or(0);
        let body = from_anthropic(raw)?;

        Ok(UpstreamResponse { body, input_tokens, output_tokens })
    }

    pub async fn call_stream(&self, params: &Map<String, Value>) -> anyhow::Result<ChunkStream> {
        let mut anthropic_req = to_anthropic(params)?;
        anthropic_req["stream"] = Value::Bool(true);

        let response = self.request(&anthropic_req).send().await.context("sending streaming request")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic returned HTTP {status}: {text}");
        }

        let byte_stream = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
        let events = super::sse::decode(byte_stream);
        let chunks = events.filter_map(|result| async move {
            match result {
                Ok(event) => translate_stream_event(&event).map(Ok),
                Err(e) => Some(Err(e)),
            }
        });
        let mapped = chunks.map(|r| r.map(Chunk).map_err(|e| upstream_failure("StreamFailure", e)));
        Ok(Box::pin(mapped))
    }
}

/// Translate an OpenAI-shaped request (the Pipeline's param bag) to
/// Anthropic's Messages format.
fn to_anthropic(params: &Map<String, Value>) -> anyhow::Result<Value> {
    let model = params.get("model").and_then(Value::as_str).context("`model` is required")?;
    let max_tokens = params.get("max_tokens").and_then(Value::as_u64).unwrap_or(DEFAULT_MAX_TOKENS);
    let raw_messages = params.get("messages").and_then(Value::as_array).context("`messages` is required")?;

    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());
    for msg in raw_messages {
        if msg["role"].as_str() == Some("system") {
            if let Some(content) = msg["content"].as_str() {
                system_parts.push(content);
            }
        } else {
            messages.push(msg.clone());
        }
    }

    let mut req = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });
    if !system_parts.is_empty() {
        req["system"] = Value::String(system_parts.join("\n\n"));
    }
    if let Some(temp) = params.get("temperature").and_then(Value::as_f64) {
        req["temperature"] = json!(temp);
    }
    if let Some(top_p) = params.get("top_p").and_then(Value::as_f64) {
        req["top_p"] = json!(top_p);
    }
    if let Some(stop) = params.get("stop") {
        req["stop_sequences"] = stop.clone();
    }

    Ok(req)
}

/// Translate an Anthropic Messages response back to the OpenAI chat
/// completions shape the Pipeline and metrics layer expect.
fn from_anthropic(resp: Value) -> anyhow::Result<Value> {
    let text = resp["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .context("no text block in Anthropic response `content` array")?
        .to_string();

    let model = resp["model"].as_str().unwrap_or("unknown");
    let finish_reason = match resp["stop_reason"].as_str().unwrap_or("stop") {
        "end_turn" => "stop",
        "max_tokens" => "length",
        other => other,
    };
    let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0);

    Ok(json!({
        "id": resp["id"],
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}

/// Translate one Anthropic SSE event into an OpenAI-shaped streaming delta,
/// or `None` for events that carry no text (message_start, ping, ...).
fn translate_stream_event(event: &Value) -> Option<Value> {
    match event["type"].as_str()? {
        "content_block_delta" => {
            let text = event.pointer("/delta/text")?.as_str()?;
            Some(json!({ "choices": [{ "delta": { "content": text } }] }))
        }
        "message_delta" => {
            let stop_reason = event.pointer("/delta/stop_reason")?.as_str()?;
            let finish_reason = match stop_reason {
                "end_turn" => "stop",
                "max_tokens" => "length",
                other => other,
            };
            Some(json!({ "choices": [{ "delta": {}, "finish_reason": finish_reason }] }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_anthropic_extracts_system_message() {
        let mut params = Map::new();
        params.insert("model".into(), Value::String("claude-3-5-sonnet-20241022".into()));
        params.insert(
            "messages".into(),
            json!([
                { "role": "system", "content": "Be terse." },
                { "role": "user", "content": "Hello" },
            ]),
        );
        let out = to_anthropic(&params).unwrap();
        assert_eq!(out["system"], "Be terse.");
        assert_eq!(out["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn to_anthropic_defaults_max_tokens() {
        let mut params = Map::new();
        params.insert("model".into(), Value::String("claude-3-5-sonnet-20241022".into()));
        params.insert("messages".into(), json!([{ "role": "user", "content": "hi" }]));
        let out = to_anthropic(&params).unwrap();
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn from_anthropic_maps_end_turn_to_stop() {
        let resp = json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{ "type": "text", "text": "Hello!" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        let out = from_anthropic(resp).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello!");
    }

    #[test]
    fn translate_stream_event_extracts_delta_text() {
        let event = json!({ "type": "content_block_delta", "delta": { "type": "text_delta", "text": "he" } });
        let out = translate_stream_event(&event).unwrap();
        assert_eq!(out["choices"][0]["delta"]["content"], "he");
    }

    #[test]
    fn translate_stream_event_ignores_message_start() {
        let event = json!({ "type": "message_start" });
        assert!(translate_stream_event(&event).is_none());
    }
}
