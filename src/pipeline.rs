//! Request Pipeline — drives one inbound chat-completion request through
//! the ordered fallback list, forwarding parameters, streaming, and
//! recording the terminal outcome in the [`crate::metrics::MetricsCollector`].
//!
//! The Pipeline never retries the same deployment — that's the Upstream
//! Adapter's job (spec §4.4) — it only moves to the next candidate on
//! failure. A stream failure after headers are committed is never a
//! fallback trigger; it is reported inline and the loop stops there.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::{json, Map, Value};

use crate::catalog::{Catalog, Deployment};
use crate::error::RoutingError;
use crate::hf_gate::HfGate;
use crate::metrics::{MetricsCollector, RequestRecord};
use crate::planner::{self, Policy};
use crate::upstream::UpstreamAdapter;

pub const DEFAULT_ALIAS: &str = "rainymodel/auto";

/// Body keys copied verbatim from the inbound request into the upstream
/// parameter bag, when present and non-null (spec §4.3).
const PASSTHROUGH_KEYS: &[&str] = &[
    "temperature",
    "max_tokens",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
    "stop",
    "n",
    "tools",
    "tool_choice",
    "response_format",
    "seed",
];

/// Shared, read-mostly state the Pipeline needs for every request. `catalog`
/// is swapped wholesale on config hot-reload rather than mutated in place —
/// the lock is held only for the duration of the `Arc::clone`.
pub struct PipelineState {
    catalog_lock: RwLock<Arc<Catalog>>,
    pub hf_gate: HfGate,
    pub metrics: Arc<MetricsCollector>,
    pub adapter: Arc<UpstreamAdapter>,
    /// `RAINYMODEL_MASTER_KEY`, when set. `None` disables auth entirely.
    pub master_key: Option<String>,
    /// Per-IP token bucket limiter. `None` disables rate limiting entirely.
    pub rate_limiter: Option<crate::api::rate_limit::RateLimiter>,
}

impl PipelineState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<Catalog>,
        hf_gate: HfGate,
        metrics: Arc<MetricsCollector>,
        adapter: Arc<UpstreamAdapter>,
        master_key: Option<String>,
        rate_limiter: Option<crate::api::rate_limit::RateLimiter>,
    ) -> Self {
        Self { catalog_lock: RwLock::new(catalog), hf_gate, metrics, adapter, master_key, rate_limiter }
    }

    /// Snapshot of the current live catalog. Lock is held only for the
    /// `Arc::clone`, never across an `.await`.
    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog_lock.read().expect("catalog lock poisoned").clone()
    }

    /// Atomically replace the live catalog. Called only from the hot-reload task.
    pub fn replace_catalog(&self, new: Arc<Catalog>) {
        *self.catalog_lock.write().expect("catalog lock poisoned") = new;
    }
}

/// Coerce an unknown/missing alias to [`DEFAULT_ALIAS`], matching spec §8's
/// boundary behaviour (`alias = "gpt-4"` is coerced to `rainymodel/auto`).
fn resolve_alias(catalog: &Catalog, requested: Option<&str>) -> String {
    match requested {
        Some(alias) if catalog.deployments_for(alias).first().is_some() => alias.to_string(),
        _ => DEFAULT_ALIAS.to_string(),
    }
}

/// Build the upstream parameter bag for one deployment (spec §4.3).
fn build_params(deployment: &Deployment, body: &Value, is_stream: bool) -> Map<String, Value> {
    let mut params = deployment.upstream_params.clone();
    params.insert("messages".into(), body.get("messages").cloned().unwrap_or(Value::Array(vec![])));
    if is_stream {
        params.insert("stream".into(), Value::Bool(true));
    }
    for key in PASSTHROUGH_KEYS {
        if let Some(value) = body.get(*key) {
            if !value.is_null() {
                params.insert((*key).to_string(), value.clone());
            }
        }
    }
    params
}

fn latency_ms(t0: Instant) -> u64 {
    t0.elapsed().as_millis() as u64
}

/// Run the fallback loop for a non-streaming request (spec §4.3).
pub async fn handle_unary(
    state: &PipelineState,
    alias_header: Option<&str>,
    policy: Policy,
    body: Value,
) -> Response {
    let t0 = Instant::now();
    let catalog = state.catalog();
    let alias = resolve_alias(&catalog, alias_header);
    let plan = planner::plan(&catalog, &state.hf_gate, &alias, policy);
    audit_log(state, "chat_completion_request", &alias, policy, false).await;

    if plan.is_empty() {
        let latency = latency_ms(t0);
        record_exhaustion(state, &alias, policy, latency, &[], false, RoutingError::UnknownAlias(alias.clone())).await;
        return exhausted_response(&alias, latency, &[]);
    }

    let mut tried: Vec<String> = Vec::new();
    let mut last_error: Option<RoutingError> = None;

    for deployment in &plan {
        tried.push(deployment.route_info.upstream.clone());
        let params = build_params(deployment, &body, false);

        match state.adapter.call_unary(deployment, &params).await {
            Ok(resp) => {
                let latency = latency_ms(t0);
                let fallback_from = if tried.len() > 1 { tried.get(tried.len() - 2).cloned() } else { None };

                record_success(state, deployment, &alias, policy, latency, false, resp.input_tokens, resp.output_tokens, fallback_from.clone()).await;

                let mut headers = success_headers(deployment, latency);
                if let Some(err) = &last_error {
                    headers.insert("x-rainymodel-fallback-reason", HeaderValue::from_static(err.canonical_name()));
                    let already_tried = tried[..tried.len() - 1].join(",");
                    if let Ok(value) = HeaderValue::from_str(&already_tried) {
                        headers.insert("x-rainymodel-tried", value);
                    }
                }

                return (StatusCode::OK, headers, axum::Json(resp.body)).into_response();
            }
            Err(err) => {
                last_error = Some(err);
            }
        }
    }

    let latency = latency_ms(t0);
    let err = last_error.expect("fallback loop exhausted with no attempts recorded");
    record_exhaustion(state, &alias, policy, latency, &tried, false, err).await;
    exhausted_response(&alias, latency, &tried)
}

/// Run the fallback loop for a streaming request, establishing the upstream
/// stream the same way `handle_unary` establishes the unary response, then
/// handing off to [`stream_response`] once headers are committed.
pub async fn handle_stream(
    state: Arc<PipelineState>,
    alias_header: Option<String>,
    policy: Policy,
    body: Value,
) -> Response {
    let t0 = Instant::now();
    let catalog = state.catalog();
    let alias = resolve_alias(&catalog, alias_header.as_deref());
    let plan = planner::plan(&catalog, &state.hf_gate, &alias, policy);
    audit_log(&state, "chat_completion_request", &alias, policy, true).await;

    if plan.is_empty() {
        let latency = latency_ms(t0);
        record_exhaustion(&state, &alias, policy, latency, &[], true, RoutingError::UnknownAlias(alias.clone())).await;
        return exhausted_response(&alias, latency, &[]);
    }

    let mut tried: Vec<String> = Vec::new();
    let mut last_error: Option<RoutingError> = None;

    for deployment in plan {
        tried.push(deployment.route_info.upstream.clone());
        let params = build_params(deployment, &body, true);

        match state.adapter.call_stream(deployment, &params).await {
            Ok(chunk_stream) => {
                let mut headers = success_headers(deployment, latency_ms(t0));
                if let Some(err) = &last_error {
                    headers.insert("x-rainymodel-fallback-reason", HeaderValue::from_static(err.canonical_name()));
                    let already_tried = tried[..tried.len() - 1].join(",");
                    if let Ok(value) = HeaderValue::from_str(&already_tried) {
                        headers.insert("x-rainymodel-tried", value);
                    }
                }
                headers.insert("content-type", HeaderValue::from_static("text/event-stream"));

                let fallback_from = if tried.len() > 1 { tried.get(tried.len() - 2).cloned() } else { None };
                let body = stream_response(state.clone(), deployment.clone(), chunk_stream, alias.clone(), policy, t0, fallback_from);

                return (StatusCode::OK, headers, Body::from_stream(body)).into_response();
            }
            Err(err) => {
                last_error = Some(err);
            }
        }
    }

    let latency = latency_ms(t0);
    let err = last_error.expect("fallback loop exhausted with no attempts recorded");
    record_exhaustion(&state, &alias, policy, latency, &tried, true, err).await;
    exhausted_response(&alias, latency, &tried)
}

/// Build the SSE body stream: forward each upstream chunk as a `data: ` frame,
/// emit an inline error frame on mid-stream failure, always terminate with
/// `data: [DONE]\n\n`, and record exactly one [`RequestRecord`] once the
/// stream ends (spec §4.3's "Metrics emission").
fn stream_response(
    state: Arc<PipelineState>,
    deployment: Deployment,
    mut chunks: crate::upstream::ChunkStream,
    alias: String,
    policy: Policy,
    t0: Instant,
    fallback_from: Option<String>,
) -> impl futures_util::Stream<Item = Result<bytes::Bytes, std::convert::Infallible>> {
    async_stream::stream! {
        let mut succeeded = true;
        let mut error_type: Option<String> = None;
        let mut error_message: Option<String> = None;

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    yield Ok(bytes::Bytes::from(format!("data: {}\n\n", chunk.0)));
                }
                Err(err) => {
                    succeeded = false;
                    error_type = Some(err.canonical_name().to_string());
                    error_message = Some(err.to_string());
                    let frame = json!({ "error": { "message": err.to_string(), "type": "stream_error" } });
                    yield Ok(bytes::Bytes::from(format!("data: {frame}\n\n")));
                    break;
                }
            }
        }

        yield Ok(bytes::Bytes::from_static(b"data: [DONE]\n\n"));

        let latency = latency_ms(t0);
        let record = RequestRecord {
            timestamp: chrono::Utc::now(),
            model_alias: alias,
            upstream: deployment.route_info.upstream.clone(),
            route: deployment.route_info.route.to_string(),
            actual_model: deployment.route_info.model.clone(),
            policy: policy.to_string(),
            latency_ms: latency,
            success: succeeded,
            status_code: 200,
            is_stream: true,
            input_tokens: 0,
            output_tokens: 0,
            error_type,
            error_message,
            fallback_from,
        };
        state.metrics.record(record).await;
    }
}

fn success_headers(deployment: &Deployment, latency: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-rainymodel-route", HeaderValue::from_static(deployment.route_info.route));
    if let Ok(v) = HeaderValue::from_str(&deployment.route_info.upstream) {
        headers.insert("x-rainymodel-upstream", v);
    }
    if let Ok(v) = HeaderValue::from_str(&deployment.route_info.model) {
        headers.insert("x-rainymodel-model", v);
    }
    headers.insert("x-rainymodel-latency-ms", HeaderValue::from_str(&latency.to_string()).unwrap());
    headers
}

fn exhausted_response(alias: &str, latency: u64, tried: &[String]) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("x-rainymodel-route", HeaderValue::from_static("error"));
    headers.insert("x-rainymodel-upstream", HeaderValue::from_static("none"));
    if let Ok(v) = HeaderValue::from_str(alias) {
        headers.insert("x-rainymodel-model", v);
    }
    headers.insert("x-rainymodel-latency-ms", HeaderValue::from_str(&latency.to_string()).unwrap());
    if let Ok(v) = HeaderValue::from_str(&tried.join(",")) {
        headers.insert("x-rainymodel-tried", v);
    }

    let body = json!({ "error": { "message": "All configured upstreams failed or no deployment is configured for this alias.", "type": "upstream_error" } });
    (StatusCode::BAD_GATEWAY, headers, axum::Json(body)).into_response()
}

#[allow(clippy::too_many_arguments)]
async fn record_success(
    state: &PipelineState,
    deployment: &Deployment,
    alias: &str,
    policy: Policy,
    latency_ms: u64,
    is_stream: bool,
    input_tokens: u64,
    output_tokens: u64,
    fallback_from: Option<String>,
) {
    state
        .metrics
        .record(RequestRecord {
            timestamp: chrono::Utc::now(),
            model_alias: alias.to_string(),
            upstream: deployment.route_info.upstream.clone(),
            route: deployment.route_info.route.to_string(),
            actual_model: deployment.route_info.model.clone(),
            policy: policy.to_string(),
            latency_ms,
            success: true,
            status_code: 200,
            is_stream,
            input_tokens,
            output_tokens,
            error_type: None,
            error_message: None,
            fallback_from,
        })
        .await;
    state
        .metrics
        .log("info", "chat_completion_success", json_map([
            ("alias", json!(alias)),
            ("upstream", json!(deployment.route_info.upstream)),
            ("latency_ms", json!(latency_ms)),
        ]))
        .await;
}

/// One structured audit-log entry per request phase, fed into the Metrics
/// Collector's system log — the original's `_audit_log` calls at
/// `chat_completion_request`/`chat_completion_success`/
/// `chat_completion_failure`/`rate_limited`/`list_providers`/`auto_config`.
async fn audit_log(state: &PipelineState, event: &str, alias: &str, policy: Policy, is_stream: bool) {
    state
        .metrics
        .log("info", event, json_map([
            ("alias", json!(alias)),
            ("policy", json!(policy.to_string())),
            ("stream", json!(is_stream)),
        ]))
        .await;
}

fn json_map<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

async fn record_exhaustion(
    state: &PipelineState,
    alias: &str,
    policy: Policy,
    latency_ms: u64,
    tried: &[String],
    is_stream: bool,
    err: RoutingError,
) {
    let fallback_from = if tried.len() > 1 { tried.get(tried.len() - 2).cloned() } else { None };
    let upstream = tried.last().cloned().unwrap_or_else(|| "none".to_string());
    state
        .metrics
        .record(RequestRecord {
            timestamp: chrono::Utc::now(),
            model_alias: alias.to_string(),
            upstream,
            route: "error".to_string(),
            actual_model: alias.to_string(),
            policy: policy.to_string(),
            latency_ms,
            success: false,
            status_code: 502,
            is_stream,
            input_tokens: 0,
            output_tokens: 0,
            error_type: Some(err.canonical_name().to_string()),
            error_message: Some(err.to_string()),
            fallback_from,
        })
        .await;
    tracing::warn!(alias, tried = ?tried, error = %err, "all upstreams exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{RouteInfo, Tier};

    fn deployment(alias: &str) -> Deployment {
        Deployment {
            alias: alias.to_string(),
            upstream_params: Map::new(),
            description: String::new(),
            tier: Tier::Premium,
            route_info: RouteInfo { route: "premium", upstream: "openrouter".to_string(), model: "gpt-4o".to_string() },
        }
    }

    #[test]
    fn build_params_overwrites_messages_and_copies_passthrough_keys() {
        let d = deployment("rainymodel/chat");
        let body = json!({
            "model": "rainymodel/chat",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.5,
            "unrelated_key": "dropped",
        });
        let params = build_params(&d, &body, false);
        assert_eq!(params["messages"][0]["content"], "hi");
        assert_eq!(params["temperature"], 0.5);
        assert!(!params.contains_key("unrelated_key"));
    }

    #[test]
    fn build_params_sets_stream_flag_when_streaming() {
        let d = deployment("rainymodel/chat");
        let body = json!({ "messages": [] });
        let params = build_params(&d, &body, true);
        assert_eq!(params["stream"], true);
    }

    #[test]
    fn build_params_skips_null_passthrough_values() {
        let d = deployment("rainymodel/chat");
        let body = json!({ "messages": [], "max_tokens": Value::Null });
        let params = build_params(&d, &body, false);
        assert!(!params.contains_key("max_tokens"));
    }
}
