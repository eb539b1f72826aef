//! Google Gemini direct adapter (`direct-gemini`).
//!
//! Translates the OpenAI chat-completions schema used internally to Gemini's
//! `generateContent` / `streamGenerateContent` request and response shapes,
//! in the same spirit as [`super::AnthropicAdapter`]'s translation — Gemini's
//! REST API is not OpenAI-wire-compatible, so a dedicated adapter is needed
//! rather than delegating to the generic OpenAI-compatible client.
//!
//! | Concern | OpenAI | Gemini |
//! |---|---|---|
//! | Messages | `messages[].{role,content}` | `contents[].{role,parts[].text}` |
//! | System prompt | `role: "system"` message | top-level `systemInstruction` |
//! | Roles | `user` / `assistant` | `user` / `model` |
//! | Auth | `Authorization: Bearer …` | `?key=<api_key>` query param |
//! | Response | `choices[].message.content` | `candidates[].content.parts[].text` |

use anyhow::Context;
use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::{json, Map, Value};

use super::{upstream_failure, Chunk, ChunkStream, UpstreamResponse};

pub struct GeminiAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl GeminiAdapter {
    pub fn new(client: Client, base_url: String, api_key: Option<String>) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string(), api_key }
    }

    fn url(&self, model: &str, method: &str) -> String {
        let mut url = format!("{}/v1beta/models/{model}:{method}", self.base_url);
        if let Some(key) = &self.api_key {
            url.push_str(&format!("?key={key}"));
        }
        url
    }

    pub async fn call_unary(&self, params: &Map<String, Value>) -> anyhow::Result<UpstreamResponse> {
        let model = params.get("model").and_then(Value::as_str).context("`model` is required")?;
        let gemini_req = to_gemini(params)?;

        let response = self
            .client
            .post(self.url(model, "generateContent"))
            .json(&gemini_req)
            .send()
            .await
            .context("sending request")?;

        let status = response.status();
        let text = response.text().await.context("reading response body")?;
        if !status.is_success() {
            anyhow::bail!("Gemini returned HTTP {status}: {text}");
        }

        let raw: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing Gemini response as JSON: {text}"))?;
        let input_tokens = raw.pointer("/usageMetadata/promptTokenCount").and_then(Value::as_u64).unwrap_or(0);
        let output_tokens = raw.pointer("/usageMetadata/candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0);
        let body = from_gemini(&raw, model)?;

        Ok(UpstreamResponse { body, input_tokens, output_tokens })
    }

    pub async fn call_stream(&self, params: &Map<String, Value>) -> anyhow::Result<ChunkStream> {
        let model = params.get("model").and_then(Value::as_str).context("`model` is required")?.to_string();
        let gemini_req = to_gemini(params)?;

        let mut url = self.url(&model, "streamGenerateContent");
        url.push_str(if url.contains('?') { "&alt=sse" } else { "?alt=sse" });

        let response = self.client.post(url).json(&gemini_req).send().await.context("sending streaming request")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini returned HTTP {status}: {text}");
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

fn to_gemini(params: &Map<String, Value>) -> anyhow::Result<Value> {
    let raw_messages = params.get("messages").and_then(Value::as_array).context("`messages` is required")?;

    let mut system_parts: Vec<&str> = Vec::new();
    let mut contents: Vec<Value> = Vec::with_capacity(raw_messages.len());
    for msg in raw_messages {
        let role = msg["role"].as_str().unwrap_or("user");
        let text = msg["content"].as_str().unwrap_or_default();
        if role == "system" {
            system_parts.push(text);
            continue;
        }
        let gemini_role = if role == "assistant" { "model" } else { "user" };
        contents.push(json!({ "role": gemini_role, "parts": [{ "text": text }] }));
    }

    let mut req = json!({ "contents": contents });
    if !system_parts.is_empty() {
        req["systemInstruction"] = json!({ "parts": [{ "text": system_parts.join("\n\n") }] });
    }

    let mut generation_config = Map::new();
    if let Some(temp) = params.get("temperature").and_then(Value::as_f64) {
        generation_config.insert("temperature".into(), json!(temp));
    }
    if let Some(top_p) = params.get("top_p").and_then(Value::as_f64) {
        generation_config.insert("topP".into(), json!(top_p));
    }
    if let Some(max_tokens) = params.get("max_tokens").and_then(Value::as_u64) {
        generation_config.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if !generation_config.is_empty() {
        req["generationConfig"] = Value::Object(generation_config);
    }

    Ok(req)
}

fn from_gemini(resp: &Value, model: &str) -> anyhow::Result<Value> {
    let text = resp
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .context("no text part in Gemini response")?;

    let finish_reason = match resp.pointer("/candidates/0/finishReason").and_then(Value::as_str) {
        Some("MAX_TOKENS") => "length",
        _ => "stop",
    };
    let input_tokens = resp.pointer("/usageMetadata/promptTokenCount").and_then(Value::as_u64).unwrap_or(0);
    let output_tokens = resp.pointer("/usageMetadata/candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0);

    Ok(json!({
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

fn translate_stream_event(event: &Value) -> Option<Value> {
    let text = event.pointer("/candidates/0/content/parts/0/text")?.as_str()?;
    Some(json!({ "choices": [{ "delta": { "content": text } }] }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_gemini_maps_assistant_to_model_role() {
        let mut params = Map::new();
        params.insert(
            "messages".into(),
            json!([
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello" },
            ]),
        );
        let out = to_gemini(&params).unwrap();
        let contents = out["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn to_gemini_lifts_system_message_to_system_instruction() {
        let mut params = Map::new();
        params.insert(
            "messages".into(),
            json!([
                { "role": "system", "content": "Be terse." },
                { "role": "user", "content": "hi" },
            ]),
        );
        let out = to_gemini(&params).unwrap();
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "Be terse.");
        assert_eq!(out["contents"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn from_gemini_extracts_first_text_part() {
        let resp = json!({
            "candidates": [{ "content": { "parts": [{ "text": "hi there" }] }, "finishReason": "STOP" }],
            "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2 },
        });
        let out = from_gemini(&resp, "gemini-1.5-pro").unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hi there");
        assert_eq!(out["usage"]["total_tokens"], 5);
    }
}
