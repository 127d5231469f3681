//! DeepSeek adapter routed through the chat-completions compatibility layer.
//!
//! DeepSeek exposes an OpenAI-shaped surface, so this wrapper only pins the
//! base URL, the provider's [0, 2] temperature range, and bearer auth.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::council::providers::compat::{ChatCompat, CompatProfile};
use crate::council::providers::{
    ChatTurn, ChunkSink, CompletionOptions, CompletionResult, ProviderAdapter, ProviderError,
    ProviderKind,
};
use crate::council::state::AgentProfile;
use crate::council::transport::Transport;

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";

pub struct DeepSeekAdapter {
    delegate: ChatCompat,
}

impl DeepSeekAdapter {
    pub fn new(api_key: String, base_url: Option<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            delegate: ChatCompat::new(
                CompatProfile {
                    provider: ProviderKind::DeepSeek,
                    default_base: DEFAULT_BASE_URL,
                    temperature_range: (0.0, 2.0),
                },
                api_key,
                base_url,
                transport,
            ),
        }
    }
}

#[async_trait]
impl ProviderAdapter for DeepSeekAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DeepSeek
    }

    async fn complete(
        &self,
        agent: &AgentProfile,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        self.delegate
            .complete(&agent.model, conversation, options, &|_| {})
            .await
    }

    async fn complete_stream(
        &self,
        agent: &AgentProfile,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
        on_chunk: ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResult, ProviderError> {
        self.delegate
            .complete_stream(&agent.model, conversation, options, on_chunk, cancel, &|_| {})
            .await
    }

    async fn test_connection(&self) -> bool {
        self.delegate.test_connection("deepseek-chat").await
    }
}
