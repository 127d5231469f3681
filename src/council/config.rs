//! Session configuration and provider credentials.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::council::providers::ProviderKind;

/// Tunables for one council session.
///
/// Everything defaults to the values the engine was tuned with; hosts
/// override selectively through the `with_*` builders or by patching the
/// deserialised struct.  All fields default on import so old exports stay
/// readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CouncilConfig {
    /// Discussion topic; set by `start`.
    pub topic: String,
    /// Turn budget for the autonomous loop.
    pub max_turns: usize,
    /// Ceiling of the uniform random term added to every final bid score.
    pub bid_random_max: f64,
    /// Wall-clock bound on one bidding round, milliseconds.
    pub bidding_timeout_ms: u64,
    /// Optional USD ceiling; the session completes cleanly when reached.
    pub budget_usd: Option<f64>,
    /// Keep producing turns without host prompting.
    pub auto: bool,
    /// Fairness sliding-window size.
    pub fairness_window: usize,
    /// Per-window speaking cap before the -80 adjustment kicks in.
    pub fairness_cap: usize,
    /// Number of recent agent messages scanned for pairwise tension.
    pub conflict_window: usize,
    /// Activation threshold on the 0..100 conflict scale.
    pub conflict_threshold: f64,
    /// Length of a dyadic exchange, in turns.
    pub exchange_turns: u32,
    /// How many trailing transcript messages feed each provider context.
    pub context_tail: usize,
    /// Pause between turns so the stream reads at a human pace.
    pub turn_pacing_ms: u64,
    /// Per-call oracle timeout, milliseconds.
    pub tool_timeout_ms: u64,
    /// Upper bound on parallel tool calls dispatched per iteration.
    pub max_tool_calls_per_iteration: usize,
    /// Upper bound on tool-call/completion rounds within one turn.
    pub max_tool_iterations: usize,
    /// Overall HTTP deadline, seconds.
    pub overall_timeout_secs: u64,
    /// Inter-chunk idle deadline, seconds.
    pub idle_timeout_secs: u64,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            max_turns: 24,
            bid_random_max: 10.0,
            bidding_timeout_ms: 5_000,
            budget_usd: None,
            auto: true,
            fairness_window: 10,
            fairness_cap: 3,
            conflict_window: 8,
            conflict_threshold: 50.0,
            exchange_turns: 3,
            context_tail: 16,
            turn_pacing_ms: 500,
            tool_timeout_ms: 12_000,
            max_tool_calls_per_iteration: 3,
            max_tool_iterations: 2,
            overall_timeout_secs: 180,
            idle_timeout_secs: 120,
        }
    }
}

impl CouncilConfig {
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_max_turns(mut self, turns: usize) -> Self {
        self.max_turns = turns;
        self
    }

    pub fn with_budget_usd(mut self, ceiling: f64) -> Self {
        self.budget_usd = Some(ceiling);
        self
    }

    pub fn with_turn_pacing_ms(mut self, pacing: u64) -> Self {
        self.turn_pacing_ms = pacing;
        self
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

/// API keys and endpoint overrides for the five providers.
///
/// Persisting credentials is the host's business; the engine only holds
/// them in memory for the lifetime of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialStore {
    #[serde(default)]
    api_keys: HashMap<ProviderKind, String>,
    #[serde(default)]
    base_urls: HashMap<ProviderKind, String>,
}

impl CredentialStore {
    pub fn api_key(&self, provider: ProviderKind) -> Option<&str> {
        self.api_keys.get(&provider).map(String::as_str)
    }

    pub fn base_url(&self, provider: ProviderKind) -> Option<&str> {
        self.base_urls.get(&provider).map(String::as_str)
    }

    pub fn set_api_key(&mut self, provider: ProviderKind, key: impl Into<String>) {
        self.api_keys.insert(provider, key.into());
    }

    pub fn set_base_url(&mut self, provider: ProviderKind, url: impl Into<String>) {
        self.base_urls.insert(provider, url.into());
    }

    /// True when the provider has a non-empty key.
    pub fn is_configured(&self, provider: ProviderKind) -> bool {
        self.api_key(provider)
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn apply(&mut self, patch: CredentialPatch) {
        for (provider, key) in patch.api_keys {
            match key {
                Some(key) => {
                    self.api_keys.insert(provider, key);
                }
                None => {
                    self.api_keys.remove(&provider);
                }
            }
        }
        for (provider, url) in patch.base_urls {
            match url {
                Some(url) => {
                    self.base_urls.insert(provider, url);
                }
                None => {
                    self.base_urls.remove(&provider);
                }
            }
        }
    }
}

/// Partial credential update; `None` entries clear the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialPatch {
    #[serde(default)]
    pub api_keys: HashMap<ProviderKind, Option<String>>,
    #[serde(default)]
    pub base_urls: HashMap<ProviderKind, Option<String>>,
}

impl CredentialPatch {
    pub fn api_key(mut self, provider: ProviderKind, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider, Some(key.into()));
        self
    }

    pub fn clear_api_key(mut self, provider: ProviderKind) -> Self {
        self.api_keys.insert(provider, None);
        self
    }

    pub fn base_url(mut self, provider: ProviderKind, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, Some(url.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_tuning() {
        let config = CouncilConfig::default();
        assert_eq!(config.max_turns, 24);
        assert_eq!(config.fairness_window, 10);
        assert_eq!(config.fairness_cap, 3);
        assert_eq!(config.conflict_threshold, 50.0);
        assert_eq!(config.exchange_turns, 3);
        assert_eq!(config.max_tool_calls_per_iteration, 3);
        assert_eq!(config.max_tool_iterations, 2);
        assert_eq!(config.overall_timeout(), Duration::from_secs(180));
        assert_eq!(config.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.tool_timeout(), Duration::from_millis(12_000));
    }

    #[test]
    fn credential_patch_sets_and_clears() {
        let mut store = CredentialStore::default();
        store.set_api_key(ProviderKind::OpenAi, "sk-old");
        store.set_api_key(ProviderKind::Kimi, "mk-1");

        store.apply(
            CredentialPatch::default()
                .api_key(ProviderKind::OpenAi, "sk-new")
                .clear_api_key(ProviderKind::Kimi)
                .base_url(ProviderKind::DeepSeek, "https://proxy.local/v1"),
        );

        assert_eq!(store.api_key(ProviderKind::OpenAi), Some("sk-new"));
        assert!(!store.is_configured(ProviderKind::Kimi));
        assert_eq!(
            store.base_url(ProviderKind::DeepSeek),
            Some("https://proxy.local/v1")
        );
    }

    #[test]
    fn config_deserialises_from_partial_json() {
        let config: CouncilConfig =
            serde_json::from_str(r#"{"topic": "x", "max_turns": 3}"#).unwrap();
        assert_eq!(config.max_turns, 3);
        assert_eq!(config.fairness_window, 10);
    }
}
