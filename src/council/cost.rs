//! Running cost accounting for the session.
//!
//! Every completed provider call reports a [`TokenUsage`]; the tracker
//! accumulates per-agent tallies plus a USD estimate from a static pricing
//! table keyed by model-identifier prefix.  Models without a table entry
//! still have their tokens counted — the `pricing_available` flag records
//! whether at least one priced usage was ever seen, so hosts can label the
//! USD figure as partial.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::council::state::{AgentId, TokenUsage};

/// USD per million tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Longest-prefix pricing lookup (February 2026 snapshot).
pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    const TABLE: &[(&str, ModelPricing)] = &[
        ("gpt-5-mini", ModelPricing { input_per_mtok: 0.25, output_per_mtok: 2.0 }),
        ("gpt-5-nano", ModelPricing { input_per_mtok: 0.05, output_per_mtok: 0.40 }),
        ("gpt-5", ModelPricing { input_per_mtok: 1.25, output_per_mtok: 10.0 }),
        ("gpt-4.1", ModelPricing { input_per_mtok: 2.0, output_per_mtok: 8.0 }),
        ("gpt-4o", ModelPricing { input_per_mtok: 2.5, output_per_mtok: 10.0 }),
        ("claude-opus", ModelPricing { input_per_mtok: 15.0, output_per_mtok: 75.0 }),
        ("claude-sonnet", ModelPricing { input_per_mtok: 3.0, output_per_mtok: 15.0 }),
        ("claude-haiku", ModelPricing { input_per_mtok: 0.80, output_per_mtok: 4.0 }),
        ("gemini-2.5-pro", ModelPricing { input_per_mtok: 1.25, output_per_mtok: 10.0 }),
        ("gemini-2.5-flash", ModelPricing { input_per_mtok: 0.30, output_per_mtok: 2.50 }),
        ("deepseek-reasoner", ModelPricing { input_per_mtok: 0.55, output_per_mtok: 2.19 }),
        ("deepseek-chat", ModelPricing { input_per_mtok: 0.27, output_per_mtok: 1.10 }),
        ("kimi", ModelPricing { input_per_mtok: 0.60, output_per_mtok: 2.50 }),
        ("moonshot", ModelPricing { input_per_mtok: 0.60, output_per_mtok: 2.50 }),
    ];

    TABLE
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, pricing)| *pricing)
}

/// Tokens and dollars attributed to one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCost {
    pub usage: TokenUsage,
    pub usd: f64,
}

/// The session-wide ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    #[serde(default)]
    pub per_agent: HashMap<AgentId, AgentCost>,
    #[serde(default)]
    pub total_usage: TokenUsage,
    #[serde(default)]
    pub total_usd: f64,
    /// True once any recorded usage had a known pricing entry.
    #[serde(default)]
    pub pricing_available: bool,
}

impl CostBreakdown {
    /// Record one completed call.  Reasoning tokens are billed at the
    /// output rate, matching how the providers invoice them.
    pub fn record(&mut self, agent: AgentId, model: &str, usage: TokenUsage) {
        let entry = self.per_agent.entry(agent).or_default();
        entry.usage.input_tokens += usage.input_tokens;
        entry.usage.output_tokens += usage.output_tokens;
        entry.usage.reasoning_tokens += usage.reasoning_tokens;

        self.total_usage.input_tokens += usage.input_tokens;
        self.total_usage.output_tokens += usage.output_tokens;
        self.total_usage.reasoning_tokens += usage.reasoning_tokens;

        if let Some(pricing) = pricing_for(model) {
            let usd = usage.input_tokens as f64 * pricing.input_per_mtok / 1_000_000.0
                + (usage.output_tokens + usage.reasoning_tokens) as f64
                    * pricing.output_per_mtok
                    / 1_000_000.0;
            entry.usd += usd;
            self.total_usd += usd;
            self.pricing_available = true;
        }
    }

    pub fn usd_for(&self, agent: AgentId) -> f64 {
        self.per_agent.get(&agent).map(|c| c.usd).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_track_per_agent_sums() {
        let mut cost = CostBreakdown::default();
        cost.record(
            AgentId::G,
            "gpt-5-mini",
            TokenUsage {
                input_tokens: 120,
                output_tokens: 80,
                reasoning_tokens: 0,
            },
        );
        cost.record(
            AgentId::G,
            "gpt-5-mini",
            TokenUsage {
                input_tokens: 60,
                output_tokens: 40,
                reasoning_tokens: 0,
            },
        );

        assert_eq!(cost.total_usage.input_tokens, 180);
        assert_eq!(cost.total_usage.output_tokens, 120);
        let g = &cost.per_agent[&AgentId::G];
        assert_eq!(g.usage.input_tokens, 180);
        assert_eq!(g.usage.output_tokens, 120);
        assert!((cost.total_usd - g.usd).abs() < 1e-12);
        assert!(cost.pricing_available);
    }

    #[test]
    fn pricing_flag_flips_only_on_known_models() {
        let mut cost = CostBreakdown::default();
        cost.record(
            AgentId::S,
            "totally-private-model",
            TokenUsage {
                input_tokens: 50,
                output_tokens: 50,
                reasoning_tokens: 0,
            },
        );
        assert!(!cost.pricing_available);
        assert_eq!(cost.total_usd, 0.0);
        assert_eq!(cost.total_usage.total(), 100);

        cost.record(
            AgentId::S,
            "deepseek-chat",
            TokenUsage {
                input_tokens: 1_000_000,
                output_tokens: 0,
                reasoning_tokens: 0,
            },
        );
        assert!(cost.pricing_available);
        assert!((cost.total_usd - 0.27).abs() < 1e-9);
    }

    #[test]
    fn prefix_lookup_prefers_longest_match() {
        let mini = pricing_for("gpt-5-mini-2025").unwrap();
        assert_eq!(mini.input_per_mtok, 0.25);
        let full = pricing_for("gpt-5").unwrap();
        assert_eq!(full.input_per_mtok, 1.25);
        assert!(pricing_for("mystery-model").is_none());
    }

    #[test]
    fn reasoning_tokens_billed_as_output() {
        let mut cost = CostBreakdown::default();
        cost.record(
            AgentId::G,
            "gpt-5",
            TokenUsage {
                input_tokens: 0,
                output_tokens: 0,
                reasoning_tokens: 1_000_000,
            },
        );
        assert!((cost.total_usd - 10.0).abs() < 1e-9);
    }
}
