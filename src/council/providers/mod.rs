//! Provider adapters behind one completion contract.
//!
//! Each remote provider gets one adapter that shapes requests into its wire
//! schema, frames its streaming responses, and reports token usage in a
//! uniform [`CompletionResult`].  The provider set is closed by design: the
//! five variants of [`ProviderKind`] each own their request/response schema
//! rather than hanging off open inheritance.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use socratic_council::council::providers::{
//!     adapter_for, ChatTurn, CompletionOptions, ProviderKind,
//! };
//! use socratic_council::council::transport::HttpTransport;
//! use socratic_council::{AgentId, AgentProfile, CredentialStore};
//!
//! # async {
//! let mut credentials = CredentialStore::default();
//! credentials.set_api_key(ProviderKind::DeepSeek, "sk-...");
//!
//! let transport = Arc::new(HttpTransport::new());
//! let adapter = adapter_for(ProviderKind::DeepSeek, &credentials, transport).unwrap();
//!
//! let agent = AgentProfile::new(AgentId::S, ProviderKind::DeepSeek, "deepseek-chat");
//! let conversation = vec![ChatTurn::user("Summarise the topic so far.")];
//! let result = adapter
//!     .complete(&agent, &conversation, &CompletionOptions::default())
//!     .await
//!     .unwrap();
//! println!("{}", result.content);
//! # };
//! ```

pub mod anthropic;
pub mod compat;
pub mod deepseek;
pub mod gemini;
pub mod kimi;
pub mod openai;
pub mod sse;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::council::config::CredentialStore;
use crate::council::state::{AgentProfile, TokenUsage};
use crate::council::transport::{Transport, TransportError};

/// The closed set of remote providers the council can bind agents to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    DeepSeek,
    Kimi,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
        ProviderKind::DeepSeek,
        ProviderKind::Kimi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Kimi => "kimi",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of one conversation entry presented to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One entry of the unified conversation an adapter projects into its wire
/// schema.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: Arc<str>,
}

impl ChatTurn {
    pub fn new(role: ChatRole, text: impl AsRef<str>) -> Self {
        Self {
            role,
            text: Arc::from(text.as_ref()),
        }
    }

    pub fn system(text: impl AsRef<str>) -> Self {
        Self::new(ChatRole::System, text)
    }

    pub fn user(text: impl AsRef<str>) -> Self {
        Self::new(ChatRole::User, text)
    }

    pub fn assistant(text: impl AsRef<str>) -> Self {
        Self::new(ChatRole::Assistant, text)
    }
}

/// Per-call knobs resolved by the orchestrator before invoking an adapter.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// Effort hint for reasoning-class OpenAI models (`low`/`medium`/`high`).
    pub reasoning_effort: Option<String>,
    /// Token budget for Gemini thinking-capable models.
    pub thinking_budget: Option<u32>,
    /// Ask Kimi to run its built-in web search alongside the completion.
    pub use_search: bool,
    pub overall_timeout: std::time::Duration,
    pub idle_timeout: std::time::Duration,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            max_output_tokens: None,
            reasoning_effort: None,
            thinking_budget: None,
            use_search: false,
            overall_timeout: crate::council::transport::DEFAULT_OVERALL_TIMEOUT,
            idle_timeout: crate::council::transport::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

/// Unified result of one completed provider call.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub content: String,
    pub usage: TokenUsage,
    pub finish: FinishReason,
    pub latency_ms: u64,
}

/// Errors raised by provider adapters.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} returned HTTP {status}: {message}")]
    Http {
        provider: ProviderKind,
        status: u16,
        message: String,
    },

    #[error("malformed {provider} response: {detail}")]
    Malformed {
        provider: ProviderKind,
        detail: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProviderError {
    /// True for the 404 family of "model not found" failures that trigger
    /// the orchestrator's Anthropic opus fallback.
    pub fn is_model_not_found(&self) -> bool {
        match self {
            ProviderError::Http {
                status, message, ..
            } => {
                *status == 404
                    || message.contains("model_not_found")
                    || (message.contains("model") && message.contains("not found"))
            }
            ProviderError::Transport(TransportError::HttpError { status, body }) => {
                *status == 404 || body.contains("model_not_found")
            }
            _ => false,
        }
    }

    /// True when the failure was an external abort rather than a provider
    /// problem.
    pub fn is_aborted(&self) -> bool {
        matches!(self, ProviderError::Transport(TransportError::Aborted))
    }
}

/// Chunk handler used by streaming completions.
pub type ChunkSink<'a> = &'a mut (dyn for<'r> FnMut(&'r str) + Send);

/// The unified capability set every provider implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Full request/response completion.
    async fn complete(
        &self,
        agent: &AgentProfile,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError>;

    /// Streaming completion; deltas are pushed into `on_chunk` and the
    /// coalesced result is returned once the stream finishes.
    async fn complete_stream(
        &self,
        agent: &AgentProfile,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
        on_chunk: ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResult, ProviderError>;

    /// Minimal low-cost request; true iff the provider answered 2xx.
    async fn test_connection(&self) -> bool;
}

/// Join a base URL and the provider's expected path suffix.
///
/// If the (already trailing-slash-stripped) base ends with the suffix it is
/// used verbatim; otherwise the suffix is appended.  This lets one override
/// point either at a provider root or at a full endpoint.
pub fn resolve_endpoint(base: &str, suffix: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with(suffix) {
        base.to_string()
    } else {
        format!("{}{}", base, suffix)
    }
}

/// Merge consecutive same-role turns into one entry.
///
/// The Anthropic and Gemini wire schemas expect alternating speakers, while
/// the council routinely attributes several foreign turns to the user role
/// in a row.
pub(crate) fn coalesce_turns(conversation: &[ChatTurn]) -> Vec<(ChatRole, String)> {
    let mut merged: Vec<(ChatRole, String)> = Vec::with_capacity(conversation.len());
    for turn in conversation {
        match merged.last_mut() {
            Some((role, text)) if *role == turn.role => {
                text.push_str("\n\n");
                text.push_str(&turn.text);
            }
            _ => merged.push((turn.role, turn.text.to_string())),
        }
    }
    merged
}

/// Construct the adapter for `kind`, or `None` when no API key is
/// configured for it.
pub fn adapter_for(
    kind: ProviderKind,
    credentials: &CredentialStore,
    transport: Arc<dyn Transport>,
) -> Option<Arc<dyn ProviderAdapter>> {
    let api_key = credentials.api_key(kind)?.to_string();
    let base_url = credentials.base_url(kind).map(str::to_string);

    Some(match kind {
        ProviderKind::OpenAi => Arc::new(openai::OpenAiAdapter::new(api_key, base_url, transport)),
        ProviderKind::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(
            api_key, base_url, transport,
        )),
        ProviderKind::Gemini => Arc::new(gemini::GeminiAdapter::new(api_key, base_url, transport)),
        ProviderKind::DeepSeek => {
            Arc::new(deepseek::DeepSeekAdapter::new(api_key, base_url, transport))
        }
        ProviderKind::Kimi => Arc::new(kimi::KimiAdapter::new(api_key, base_url, transport)),
    })
}
