//! Core data model: agents, messages, and the serialisable session state.
//!
//! The transcript is append-only.  Streaming chunks are delivered to
//! subscribers as events and coalesced before the final immutable
//! [`Message`] is appended, so a message handed to a subscriber is never
//! mutated afterwards.  Content is stored as `Arc<str>` so histories and
//! snapshots clone cheaply.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::council::config::CouncilConfig;
use crate::council::conflict::{ConflictRecord, DyadicExchange};
use crate::council::cost::CostBreakdown;
use crate::council::providers::ProviderKind;
use crate::council::whisper::WhisperState;

/// The five stable agent symbols.
///
/// The nicknames are presentation sugar; nothing in scheduling or scoring
/// keys off them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AgentId {
    G,
    C,
    F,
    S,
    H,
}

impl AgentId {
    pub const ALL: [AgentId; 5] = [AgentId::G, AgentId::C, AgentId::F, AgentId::S, AgentId::H];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::G => "G",
            AgentId::C => "C",
            AgentId::F => "F",
            AgentId::S => "S",
            AgentId::H => "H",
        }
    }

    pub fn nickname(&self) -> &'static str {
        match self {
            AgentId::G => "George",
            AgentId::C => "Cathy",
            AgentId::F => "Grace",
            AgentId::S => "Douglas",
            AgentId::H => "Kate",
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a transcript message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Agent(AgentId),
    User,
    System,
    Tool,
}

impl Source {
    /// The agent id when this message was spoken by a council member.
    pub fn agent(&self) -> Option<AgentId> {
        match self {
            Source::Agent(id) => Some(*id),
            _ => None,
        }
    }

    /// Speaker-attribution prefix used when presenting foreign turns.
    pub fn label(&self) -> &'static str {
        match self {
            Source::Agent(id) => id.nickname(),
            Source::User => "User",
            Source::System => "System",
            Source::Tool => "Tool",
        }
    }
}

/// Token accounting for one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    #[serde(default)]
    pub reasoning_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens + self.reasoning_tokens
    }
}

/// Optional provenance attached to agent messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Adjusted bid score that earned this turn.
    #[serde(default)]
    pub bid_score: Option<f64>,
}

/// One immutable transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub source: Source,
    pub content: Arc<str>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub meta: Option<MessageMeta>,
}

impl Message {
    pub fn new(source: Source, content: impl AsRef<str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            content: Arc::from(content.as_ref()),
            timestamp: Utc::now(),
            usage: None,
            meta: None,
        }
    }

    pub fn system(content: impl AsRef<str>) -> Self {
        Self::new(Source::System, content)
    }

    pub fn user(content: impl AsRef<str>) -> Self {
        Self::new(Source::User, content)
    }

    pub fn tool(content: impl AsRef<str>) -> Self {
        Self::new(Source::Tool, content)
    }

    pub fn from_agent(agent: AgentId, content: impl AsRef<str>) -> Self {
        Self::new(Source::Agent(agent), content)
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_meta(mut self, meta: MessageMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// One council member: a stable symbol bound to a provider and model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub provider: ProviderKind,
    pub model: String,
    pub system_prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

impl AgentProfile {
    pub fn new(id: AgentId, provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            id,
            provider,
            model: model.into(),
            system_prompt: default_persona(id),
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    /// Throwaway profile used by connection tests.
    pub fn probe(provider: ProviderKind, model: &str) -> Self {
        Self {
            id: AgentId::G,
            provider,
            model: model.to_string(),
            system_prompt: String::new(),
            temperature: None,
            max_output_tokens: None,
        }
    }

    /// The default five-member roster, one distinct provider per agent.
    pub fn default_roster() -> Vec<AgentProfile> {
        vec![
            AgentProfile::new(AgentId::G, ProviderKind::OpenAi, "gpt-5-mini"),
            AgentProfile::new(AgentId::C, ProviderKind::Anthropic, "claude-sonnet-4-0"),
            AgentProfile::new(AgentId::F, ProviderKind::Gemini, "gemini-2.5-flash"),
            AgentProfile::new(AgentId::S, ProviderKind::DeepSeek, "deepseek-chat"),
            AgentProfile::new(AgentId::H, ProviderKind::Kimi, "kimi-latest"),
        ]
    }
}

fn default_persona(id: AgentId) -> String {
    let flavour = match id {
        AgentId::G => "You argue from first principles and like concrete numbers.",
        AgentId::C => "You weigh ethical and social consequences before practicality.",
        AgentId::F => "You look for synthesis and name the strongest version of each side.",
        AgentId::S => "You are the skeptic: probe weak evidence and hidden assumptions.",
        AgentId::H => "You bring historical precedent and real-world case studies.",
    };
    format!(
        "You are {}, one of five voices in a round-table debate. {} Speak in your own voice, \
         address the others by name, and keep each contribution under three paragraphs.",
        id.nickname(),
        flavour
    )
}

/// Partial update applied to a roster entry via the host surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPatch {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

impl AgentPatch {
    pub fn apply(&self, profile: &mut AgentProfile) {
        if let Some(model) = &self.model {
            profile.model = model.clone();
        }
        if let Some(prompt) = &self.system_prompt {
            profile.system_prompt = prompt.clone();
        }
        if let Some(temperature) = self.temperature {
            profile.temperature = Some(temperature);
        }
        if let Some(tokens) = self.max_output_tokens {
            profile.max_output_tokens = Some(tokens);
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
}

fn schema_version_default() -> u32 {
    1
}

/// The whole serialisable session.
///
/// Everything a host needs to persist and restore a council lives here;
/// derived machinery (fairness window, adapters) is rebuilt on import.
/// Fields default when absent so newer readers tolerate older exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilState {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    pub session_id: Uuid,
    pub config: CouncilConfig,
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub turn: usize,
    #[serde(default)]
    pub cost: CostBreakdown,
    #[serde(default)]
    pub conflict: Option<ConflictRecord>,
    #[serde(default)]
    pub exchange: Option<DyadicExchange>,
    #[serde(default)]
    pub whisper: WhisperState,
    #[serde(default)]
    pub status: Lifecycle,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CouncilState {
    pub fn new(config: CouncilConfig, agents: Vec<AgentProfile>) -> Self {
        Self {
            schema_version: schema_version_default(),
            session_id: Uuid::new_v4(),
            config,
            agents,
            messages: Vec::new(),
            turn: 0,
            cost: CostBreakdown::default(),
            conflict: None,
            exchange: None,
            whisper: WhisperState::default(),
            status: Lifecycle::Idle,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn agent_mut(&mut self, id: AgentId) -> Option<&mut AgentProfile> {
        self.agents.iter_mut().find(|a| a.id == id)
    }

    /// Number of agent-sourced transcript entries; always equals `turn`.
    pub fn agent_message_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.source.agent().is_some())
            .count()
    }
}
