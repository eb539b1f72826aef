//! Deployment Catalog — classifies configured deployments into tiers and
//! indexes them by alias.
//!
//! The Catalog is built once from [`crate::config::Config`] and treated as
//! immutable for the process lifetime; hot-reload replaces the whole
//! `Arc<Catalog>` rather than mutating one in place (see `main.rs`).

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::Config;

/// Cost/trust classification of a deployment. Order here is declaration
/// order only — planning order is a property of [`crate::planner::Policy`],
/// not of this enum's variant order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    FreeHf,
    FreeOllamaFree,
    Internal,
    DirectDeepseek,
    DirectGemini,
    DirectOpenai,
    DirectXai,
    DirectClaude,
    Premium,
}

impl Tier {
    /// Coarse category surfaced to clients in `x-rainymodel-route`.
    pub fn route(self) -> &'static str {
        match self {
            Tier::FreeHf | Tier::FreeOllamaFree => "free",
            Tier::Internal => "internal",
            Tier::DirectDeepseek
            | Tier::DirectGemini
            | Tier::DirectOpenai
            | Tier::DirectXai
            | Tier::DirectClaude => "direct",
            Tier::Premium => "premium",
        }
    }
}

/// `{route, upstream, model}` triple surfaced to clients via response
/// headers. A pure function of `(tier, upstream_params)` — never mutated
/// after a [`Deployment`] is constructed.
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub route: &'static str,
    pub upstream: String,
    pub model: String,
}

/// An individual upstream target bound to one alias.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub alias: String,
    /// Opaque parameter bag handed to the Upstream Adapter verbatim (plus
    /// request-derived overrides applied by the Pipeline).
    pub upstream_params: Map<String, Value>,
    pub description: String,
    pub tier: Tier,
    pub route_info: RouteInfo,
}

impl Deployment {
    fn from_entry(entry: &crate::config::ModelListEntry, ollama_hosts: &[String]) -> Self {
        let model = entry
            .litellm_params
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let api_base = entry
            .litellm_params
            .get("api_base")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let description = entry.model_info.description.clone();

        let (tier, upstream) = classify(&api_base, &model, &description, ollama_hosts);

        Deployment {
            alias: entry.model_name.clone(),
            upstream_params: entry.litellm_params.clone(),
            description,
            tier,
            route_info: RouteInfo {
                route: tier.route(),
                upstream,
                model,
            },
        }
    }
}

/// First-match classification rules over `(api_base, model, description)`.
///
/// Returns the tier plus the vendor short name used as `route_info.upstream`
/// — derived alongside the tier since both come from the same substring
/// matches (keeping this one function avoids classifying twice).
fn classify(
    api_base: &str,
    model: &str,
    description: &str,
    ollama_hosts: &[String],
) -> (Tier, String) {
    let api_base_l = api_base.to_lowercase();
    let model_l = model.to_lowercase();
    let desc_l = description.to_lowercase();

    if api_base_l.contains("ollamafreeapi") || desc_l.contains("ollamafree") {
        return (Tier::FreeOllamaFree, "ollamafreeapi".to_string());
    }
    if api_base_l.contains("huggingface")
        || desc_l.contains(" hf ")
        || desc_l.contains("hf")
        || model_l.starts_with("huggingface/")
    {
        return (Tier::FreeHf, "hf".to_string());
    }
    if model_l.starts_with("deepseek/") || desc_l.contains("deepseek") {
        return (Tier::DirectDeepseek, "deepseek".to_string());
    }
    if model_l.starts_with("gemini/") || desc_l.contains("gemini") {
        return (Tier::DirectGemini, "gemini".to_string());
    }
    if model_l.starts_with("gpt-")
        || model_l.starts_with("o1")
        || model_l.starts_with("o3")
        || desc_l.contains("openai-direct")
    {
        return (Tier::DirectOpenai, "openai".to_string());
    }
    if model_l.starts_with("claude-")
        || model_l.starts_with("anthropic/")
        || desc_l.contains("claude-direct")
    {
        return (Tier::DirectClaude, "anthropic".to_string());
    }
    if model_l.starts_with("xai/") || desc_l.contains("xai-direct") {
        return (Tier::DirectXai, "xai".to_string());
    }
    if model_l.contains("openrouter") || desc_l.contains("premium") {
        return (Tier::Premium, "openrouter".to_string());
    }
    if ollama_hosts
        .iter()
        .any(|host| !host.is_empty() && api_base_l.contains(host.as_str()))
        || desc_l.contains("internal")
        || desc_l.contains("ollama")
    {
        return (Tier::Internal, "ollama".to_string());
    }

    (Tier::Premium, "openrouter".to_string())
}

/// Read the configured Ollama host substrings from the environment, lower-cased.
/// Empty/unset variables are dropped.
pub fn ollama_host_substrings() -> Vec<String> {
    ["OLLAMA_PRIMARY_URL", "OLLAMA_SECONDARY_URL", "OLLAMA_BASE_URL"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|url| url.to_lowercase())
        .filter(|url| !url.is_empty())
        .collect()
}

/// Immutable mapping from alias to its ordered (catalog-order) sequence of
/// deployments. Built once at startup; re-initialisation happens only by
/// constructing and swapping in a new `Catalog`.
#[derive(Debug, Clone)]
pub struct Catalog {
    by_alias: HashMap<String, Vec<Deployment>>,
}

impl Catalog {
    /// Classify every `model_list` entry and index by alias.
    pub fn build(config: &Config) -> Self {
        let ollama_hosts = ollama_host_substrings();
        let mut by_alias: HashMap<String, Vec<Deployment>> = HashMap::new();
        for entry in &config.model_list {
            let deployment = Deployment::from_entry(entry, &ollama_hosts);
            by_alias
                .entry(deployment.alias.clone())
                .or_default()
                .push(deployment);
        }
        Catalog { by_alias }
    }

    /// Raw, policy-unordered sequence of deployments bound to `alias`.
    pub fn deployments_for(&self, alias: &str) -> &[Deployment] {
        self.by_alias
            .get(alias)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All aliases with at least one deployment, for `/v1/models` and
    /// `/v1/auto/config`-style introspection.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.by_alias.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(model_name: &str, model: &str, api_base: &str, description: &str) -> crate::config::ModelListEntry {
        let mut litellm_params = Map::new();
        litellm_params.insert("model".into(), Value::String(model.into()));
        if !api_base.is_empty() {
            litellm_params.insert("api_base".into(), Value::String(api_base.into()));
        }
        crate::config::ModelListEntry {
            model_name: model_name.to_string(),
            litellm_params,
            model_info: crate::config::ModelInfo {
                description: description.to_string(),
                extra: Map::new(),
            },
        }
    }

    #[test]
    fn classifies_ollamafree_before_anything_else() {
        let (tier, upstream) = classify(
            "https://ollamafreeapi.example.com",
            "huggingface/some-model",
            "looks like hf",
            &[],
        );
        assert_eq!(tier, Tier::FreeOllamaFree);
        assert_eq!(upstream, "ollamafreeapi");
    }

    #[test]
    fn classifies_huggingface_by_model_prefix() {
        let (tier, upstream) = classify("", "huggingface/Qwen/Qwen2.5-72B-Instruct", "", &[]);
        assert_eq!(tier, Tier::FreeHf);
        assert_eq!(upstream, "hf");
    }

    #[test]
    fn classifies_deepseek_direct() {
        let (tier, _) = classify("", "deepseek/deepseek-chat", "", &[]);
        assert_eq!(tier, Tier::DirectDeepseek);
    }

    #[test]
    fn classifies_openai_direct_by_gpt_prefix() {
        let (tier, upstream) = classify("", "gpt-4o", "", &[]);
        assert_eq!(tier, Tier::DirectOpenai);
        assert_eq!(upstream, "openai");
    }

    #[test]
    fn classifies_claude_direct_by_prefix() {
        let (tier, upstream) = classify("", "claude-3-5-sonnet-20241022", "", &[]);
        assert_eq!(tier, Tier::DirectClaude);
        assert_eq!(upstream, "anthropic");
    }

    #[test]
    fn classifies_openrouter_as_premium() {
        let (tier, upstream) = classify("", "openrouter/anthropic/claude-3.5-sonnet", "", &[]);
        assert_eq!(tier, Tier::Premium);
        assert_eq!(upstream, "openrouter");
    }

    #[test]
    fn classifies_internal_by_configured_ollama_host() {
        let hosts = vec!["10.0.0.5:11434".to_string()];
        let (tier, upstream) = classify("http://10.0.0.5:11434", "qwen2.5:7b", "", &hosts);
        assert_eq!(tier, Tier::Internal);
        assert_eq!(upstream, "ollama");
    }

    #[test]
    fn defaults_to_premium_when_nothing_matches() {
        let (tier, upstream) = classify("", "some-vendor/mystery-model", "", &[]);
        assert_eq!(tier, Tier::Premium);
        assert_eq!(upstream, "openrouter");
    }

    #[test]
    fn classification_is_idempotent() {
        let first = classify("https://router.huggingface.co", "huggingface/x", "hf tier", &[]);
        let second = classify("https://router.huggingface.co", "huggingface/x", "hf tier", &[]);
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn route_info_route_is_a_pure_function_of_tier() {
        assert_eq!(Tier::FreeHf.route(), "free");
        assert_eq!(Tier::FreeOllamaFree.route(), "free");
        assert_eq!(Tier::Internal.route(), "internal");
        assert_eq!(Tier::DirectDeepseek.route(), "direct");
        assert_eq!(Tier::DirectClaude.route(), "direct");
        assert_eq!(Tier::Premium.route(), "premium");
    }

    #[test]
    fn deployments_for_groups_by_alias_in_catalog_order() {
        let config = Config {
            server: Default::default(),
            model_list: vec![
                entry("rainymodel/chat", "huggingface/a", "", "hf free"),
                entry("rainymodel/chat", "openrouter/anthropic/claude-3.5-sonnet", "", "premium fallback"),
                entry("rainymodel/code", "deepseek/deepseek-coder", "", ""),
            ],
            router_settings: Default::default(),
        };
        let catalog = Catalog::build(&config);
        let chat = catalog.deployments_for("rainymodel/chat");
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[0].tier, Tier::FreeHf);
        assert_eq!(chat[1].tier, Tier::Premium);

        let code = catalog.deployments_for("rainymodel/code");
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].tier, Tier::DirectDeepseek);

        assert!(catalog.deployments_for("rainymodel/unknown").is_empty());
    }
}
