//! Configuration types for RainyModel.
//!
//! Config is loaded once at startup from a YAML file and validated before
//! the server opens its port. Invalid configs are rejected with a clear
//! error rather than silently falling back to defaults — matching the
//! "fail loudly" contract around `ConfigError`.
//!
//! # Example
//! ```yaml
//! model_list:
//!   - model_name: rainymodel/chat
//!     litellm_params:
//!       model: huggingface/Qwen/Qwen2.5-72B-Instruct
//!       api_base: https://router.huggingface.co/v1
//!       api_key: ${HF_TOKEN}
//!     model_info:
//!       description: "HF free tier"
//!
//! router_settings:
//!   num_retries: 3
//!   timeout: 120
//!   retry_after: 5
//!   allowed_fails: 2
//!   cooldown_time: 60
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level RainyModel configuration.
///
/// `model_list` and `router_settings` are the config file's two real keys;
/// `server` is ambient (port, in-memory store capacity, rate limiting) and
/// isn't part of the upstream-facing wire contract, but is needed to run the
/// service at all.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Declarative deployment list. Each entry becomes one [`crate::catalog::Deployment`].
    #[serde(default)]
    pub model_list: Vec<ModelListEntry>,

    #[serde(default)]
    pub router_settings: RouterSettings,
}

impl Config {
    /// Load, expand `${VAR}`/`${VAR:-default}` references, and validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw)
    }

    /// Parse a YAML document already read into memory — used by tests and by
    /// the hot-reload watcher, which re-reads the file on every tick.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(raw).context("parsing config YAML")?;
        let expanded = expand_env(value);
        let config: Self =
            serde_yaml::from_value(expanded).context("deserializing expanded config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for entry in &self.model_list {
            anyhow::ensure!(
                !entry.model_name.is_empty(),
                "model_list entry has an empty model_name"
            );
            anyhow::ensure!(
                entry.litellm_params.get("model").is_some(),
                "model_list entry `{}` is missing litellm_params.model",
                entry.model_name
            );
        }
        anyhow::ensure!(
            self.router_settings.num_retries <= 10,
            "router_settings.num_retries is unreasonably large ({})",
            self.router_settings.num_retries
        );
        Ok(())
    }
}

/// Ambient server settings — port, in-memory store capacity, rate limiting.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port the HTTP surface listens on (chat completions + dashboard API
    /// share one listener, unlike the teacher's dual client/admin ports).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Maximum `RequestRecord`s retained (default 50 000).
    #[serde(default = "defaults::max_records")]
    pub max_records: usize,

    /// Maximum `LogEntry`s retained (default 10 000).
    #[serde(default = "defaults::max_logs")]
    pub max_logs: usize,

    /// Sliding-window requests-per-minute cap per caller key (default 60).
    /// Set to 0 to disable rate limiting.
    #[serde(default = "defaults::rate_limit_rpm")]
    pub rate_limit_rpm: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            max_records: defaults::max_records(),
            max_logs: defaults::max_logs(),
            rate_limit_rpm: defaults::rate_limit_rpm(),
        }
    }
}

/// One `model_list` entry — the input contract the Catalog classifies.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelListEntry {
    pub model_name: String,

    /// Opaque upstream parameter bag. The Catalog only reads `model` and
    /// `api_base` for classification; the Upstream Adapter owns the rest
    /// (api_key, extra headers, provider-specific knobs).
    #[serde(default)]
    pub litellm_params: Map<String, Value>,

    #[serde(default)]
    pub model_info: ModelInfo,
}

/// Free-form deployment metadata. `description` drives tier classification;
/// any other keys are preserved but unused by the core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub description: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Adapter construction settings shared by every deployment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterSettings {
    /// Additional attempts after the first failure, within a single deployment.
    #[serde(default = "defaults::num_retries")]
    pub num_retries: u32,

    /// Per-call timeout in seconds — no single attempt may hold a task longer.
    #[serde(default = "defaults::timeout")]
    pub timeout: u64,

    /// Delay between retry attempts, in seconds.
    #[serde(default = "defaults::retry_after")]
    pub retry_after: u64,

    /// Consecutive failures within the cooldown window before a deployment
    /// is temporarily marked ineligible.
    #[serde(default = "defaults::allowed_fails")]
    pub allowed_fails: u32,

    /// Cooldown duration in seconds once `allowed_fails` is exceeded.
    #[serde(default = "defaults::cooldown_time")]
    pub cooldown_time: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            num_retries: defaults::num_retries(),
            timeout: defaults::timeout(),
            retry_after: defaults::retry_after(),
            allowed_fails: defaults::allowed_fails(),
            cooldown_time: defaults::cooldown_time(),
        }
    }
}

mod defaults {
    pub fn port() -> u16 {
        8080
    }
    pub fn max_records() -> usize {
        50_000
    }
    pub fn max_logs() -> usize {
        10_000
    }
    pub fn rate_limit_rpm() -> u32 {
        60
    }
    pub fn num_retries() -> u32 {
        3
    }
    pub fn timeout() -> u64 {
        120
    }
    pub fn retry_after() -> u64 {
        5
    }
    pub fn allowed_fails() -> u32 {
        2
    }
    pub fn cooldown_time() -> u64 {
        60
    }
}

/// Recursively expand `${VAR}` and `${VAR:-default}` references against the
/// process environment. Only string scalars are rewritten; the tree shape
/// is otherwise preserved.
fn expand_env(value: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value as Y;
    match value {
        Y::String(s) => Y::String(expand_env_str(&s)),
        Y::Sequence(seq) => Y::Sequence(seq.into_iter().map(expand_env).collect()),
        Y::Mapping(map) => {
            let expanded = map
                .into_iter()
                .map(|(k, v)| (expand_env(k), expand_env(v)))
                .collect();
            Y::Mapping(expanded)
        }
        other => other,
    }
}

fn expand_env_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated `${` — emit the rest verbatim rather than looping forever.
            out.push_str(&rest[start..]);
            return out;
        };
        let token = &after[..end];
        let (var_name, default) = match token.split_once(":-") {
            Some((name, default)) => (name, default),
            None => (token, ""),
        };
        out.push_str(&std::env::var(var_name).unwrap_or_else(|_| default.to_string()));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
model_list:
  - model_name: rainymodel/chat
    litellm_params:
      model: huggingface/Qwen/Qwen2.5-72B-Instruct
      api_base: https://router.huggingface.co/v1
    model_info:
      description: "HF free tier"
  - model_name: rainymodel/chat
    litellm_params:
      model: openrouter/anthropic/claude-3.5-sonnet
    model_info:
      description: "premium fallback"

router_settings:
  num_retries: 2
  timeout: 60
  retry_after: 3
  allowed_fails: 1
  cooldown_time: 30
"#
    }

    #[test]
    fn parses_minimal_config() {
        let config = Config::parse(minimal_yaml()).expect("should parse");
        assert_eq!(config.model_list.len(), 2);
        assert_eq!(config.router_settings.num_retries, 2);
    }

    #[test]
    fn server_defaults_apply_when_section_absent() {
        let config = Config::parse(minimal_yaml()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_records, 50_000);
        assert_eq!(config.server.rate_limit_rpm, 60);
    }

    #[test]
    fn rejects_entry_without_model_field() {
        let yaml = r#"
model_list:
  - model_name: rainymodel/chat
    litellm_params: {}
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn expands_simple_env_var() {
        unsafe { std::env::set_var("RAINYMODEL_TEST_KEY_1", "sk-resolved") };
        let yaml = r#"
model_list:
  - model_name: rainymodel/chat
    litellm_params:
      model: openai/gpt-4o
      api_key: ${RAINYMODEL_TEST_KEY_1}
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(
            config.model_list[0].litellm_params["api_key"],
            "sk-resolved"
        );
        unsafe { std::env::remove_var("RAINYMODEL_TEST_KEY_1") };
    }

    #[test]
    fn expands_default_when_var_unset() {
        unsafe { std::env::remove_var("RAINYMODEL_TEST_KEY_UNSET_2") };
        let yaml = r#"
model_list:
  - model_name: rainymodel/chat
    litellm_params:
      model: openai/gpt-4o
      api_base: ${RAINYMODEL_TEST_KEY_UNSET_2:-https://api.openai.com/v1}
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(
            config.model_list[0].litellm_params["api_base"],
            "https://api.openai.com/v1"
        );
    }

    #[test]
    fn expand_env_str_handles_multiple_tokens() {
        unsafe { std::env::set_var("RAINYMODEL_TEST_A", "foo") };
        unsafe { std::env::set_var("RAINYMODEL_TEST_B", "bar") };
        let out = expand_env_str("${RAINYMODEL_TEST_A}-${RAINYMODEL_TEST_B}");
        assert_eq!(out, "foo-bar");
        unsafe { std::env::remove_var("RAINYMODEL_TEST_A") };
        unsafe { std::env::remove_var("RAINYMODEL_TEST_B") };
    }
}
