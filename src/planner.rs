//! Policy Planner — turns `(alias, policy)` into an ordered fallback list.

use crate::catalog::{Catalog, Deployment, Tier};
use crate::hf_gate::HfGate;

/// Client-supplied tier-ordering preference. Unknown values are treated as
/// [`Policy::Auto`] (spec boundary: `policy = "banana"` → `auto`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Auto,
    Free,
    Premium,
    Uncensored,
}

impl Policy {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "free" => Policy::Free,
            "premium" => Policy::Premium,
            "uncensored" => Policy::Uncensored,
            "auto" => Policy::Auto,
            _ => Policy::Auto,
        }
    }

    fn tier_order(self) -> &'static [Tier] {
        use Tier::*;
        match self {
            Policy::Auto => &[
                FreeHf,
                FreeOllamaFree,
                Internal,
                DirectDeepseek,
                DirectGemini,
                DirectOpenai,
                DirectXai,
                DirectClaude,
                Premium,
            ],
            Policy::Free => &[
                FreeHf,
                FreeOllamaFree,
                Internal,
                DirectDeepseek,
                DirectGemini,
                DirectOpenai,
                DirectXai,
                DirectClaude,
                Premium,
            ],
            Policy::Premium => &[
                DirectClaude,
                DirectOpenai,
                DirectXai,
                DirectGemini,
                DirectDeepseek,
                Premium,
                FreeHf,
                FreeOllamaFree,
                Internal,
            ],
            Policy::Uncensored => &[
                Internal,
                FreeOllamaFree,
                DirectDeepseek,
                DirectXai,
                FreeHf,
                DirectGemini,
                DirectOpenai,
                DirectClaude,
                Premium,
            ],
        }
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Policy::Auto => "auto",
            Policy::Free => "free",
            Policy::Premium => "premium",
            Policy::Uncensored => "uncensored",
        })
    }
}

/// Produce the ordered candidate list of deployments for `(alias, policy)`.
///
/// Guarantees: a permutation of `catalog.deployments_for(alias)` — no drops,
/// no duplicates — with `free-hf` deployments skipped while `gate` is active.
pub fn plan<'a>(
    catalog: &'a Catalog,
    gate: &HfGate,
    alias: &str,
    policy: Policy,
) -> Vec<&'a Deployment> {
    let deployments = catalog.deployments_for(alias);
    if deployments.is_empty() {
        return Vec::new();
    }

    let mut included = vec![false; deployments.len()];
    let mut result = Vec::with_capacity(deployments.len());

    for &tier in policy.tier_order() {
        if tier == Tier::FreeHf && gate.is_active() {
            continue;
        }
        for (idx, d) in deployments.iter().enumerate() {
            if !included[idx] && d.tier == tier {
                included[idx] = true;
                result.push(d);
            }
        }
    }

    // Anything not yet placed — including free-hf while the gate is active —
    // is appended in catalog order so no deployment is silently dropped.
    for (idx, d) in deployments.iter().enumerate() {
        if !included[idx] {
            result.push(d);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ModelInfo, ModelListEntry};
    use serde_json::{Map, Value};

    fn entry(alias: &str, model: &str, description: &str) -> ModelListEntry {
        let mut litellm_params = Map::new();
        litellm_params.insert("model".into(), Value::String(model.into()));
        ModelListEntry {
            model_name: alias.to_string(),
            litellm_params,
            model_info: ModelInfo {
                description: description.to_string(),
                extra: Map::new(),
            },
        }
    }

    fn catalog_with(entries: Vec<ModelListEntry>) -> Catalog {
        Catalog::build(&Config {
            server: Default::default(),
            model_list: entries,
            router_settings: Default::default(),
        })
    }

    #[test]
    fn unknown_policy_behaves_like_auto() {
        assert_eq!(Policy::parse("banana").tier_order(), Policy::Auto.tier_order());
    }

    #[test]
    fn plan_is_permutation_of_deployments_for_alias() {
        let catalog = catalog_with(vec![
            entry("rainymodel/auto", "huggingface/a", "hf"),
            entry("rainymodel/auto", "openrouter/anthropic/claude-3.5-sonnet", "premium"),
            entry("rainymodel/auto", "deepseek/deepseek-chat", ""),
        ]);
        let gate = HfGate::new();
        for policy in [Policy::Auto, Policy::Free, Policy::Premium, Policy::Uncensored] {
            let plan = plan(&catalog, &gate, "rainymodel/auto", policy);
            assert_eq!(plan.len(), 3);
            let d = catalog.deployments_for("rainymodel/auto");
            for dep in d {
                assert_eq!(plan.iter().filter(|p| std::ptr::eq(**p, dep)).count(), 1);
            }
        }
    }

    #[test]
    fn empty_alias_yields_empty_plan() {
        let catalog = catalog_with(vec![]);
        let gate = HfGate::new();
        assert!(plan(&catalog, &gate, "rainymodel/unknown", Policy::Auto).is_empty());
    }

    #[test]
    fn auto_policy_prefers_free_hf_first() {
        let catalog = catalog_with(vec![
            entry("rainymodel/chat", "openrouter/anthropic/claude-3.5-sonnet", "premium"),
            entry("rainymodel/chat", "huggingface/a", "hf"),
        ]);
        let gate = HfGate::new();
        let plan = plan(&catalog, &gate, "rainymodel/chat", Policy::Auto);
        assert_eq!(plan[0].tier, Tier::FreeHf);
        assert_eq!(plan[1].tier, Tier::Premium);
    }

    #[test]
    fn premium_policy_prefers_direct_claude_first() {
        let catalog = catalog_with(vec![
            entry("rainymodel/chat", "huggingface/a", "hf"),
            entry("rainymodel/chat", "claude-3-5-sonnet-20241022", ""),
        ]);
        let gate = HfGate::new();
        let plan = plan(&catalog, &gate, "rainymodel/chat", Policy::Premium);
        assert_eq!(plan[0].tier, Tier::DirectClaude);
        assert_eq!(plan[1].tier, Tier::FreeHf);
    }

    #[test]
    fn hf_gate_suppresses_free_hf_but_keeps_it_in_plan_at_the_end() {
        let catalog = catalog_with(vec![entry("rainymodel/chat", "huggingface/a", "hf")]);
        let gate = HfGate::new();
        gate.mark_hf_credits_exhausted(std::time::Duration::from_secs(3600));
        let plan = plan(&catalog, &gate, "rainymodel/chat", Policy::Auto);
        // Only deployment is free-hf; gate suppresses it from the ordered
        // pass but the non-tier fallback still appends it so nothing is dropped.
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].tier, Tier::FreeHf);
    }

    #[test]
    fn hf_gate_lets_other_tiers_go_first() {
        let catalog = catalog_with(vec![
            entry("rainymodel/chat", "huggingface/a", "hf"),
            entry("rainymodel/chat", "openrouter/anthropic/claude-3.5-sonnet", "premium"),
        ]);
        let gate = HfGate::new();
        gate.mark_hf_credits_exhausted(std::time::Duration::from_secs(3600));
        let plan = plan(&catalog, &gate, "rainymodel/chat", Policy::Auto);
        assert_eq!(plan[0].tier, Tier::Premium);
        assert_eq!(plan[1].tier, Tier::FreeHf);
    }

    #[test]
    fn plan_is_idempotent_for_unchanged_catalog_and_gate() {
        let catalog = catalog_with(vec![
            entry("rainymodel/chat", "huggingface/a", "hf"),
            entry("rainymodel/chat", "deepseek/deepseek-chat", ""),
        ]);
        let gate = HfGate::new();
        let first = plan(&catalog, &gate, "rainymodel/chat", Policy::Auto);
        let second = plan(&catalog, &gate, "rainymodel/chat", Policy::Auto);
        assert_eq!(
            first.iter().map(|d| d.tier).collect::<Vec<_>>(),
            second.iter().map(|d| d.tier).collect::<Vec<_>>()
        );
    }
}
