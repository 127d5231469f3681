//! Moonshot Kimi adapter routed through the chat-completions compatibility
//! layer.
//!
//! Kimi narrows temperature to [0, 1] and accepts an optional `use_search`
//! flag that lets the model consult Moonshot's built-in web search before
//! answering.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::council::providers::compat::{ChatCompat, CompatProfile};
use crate::council::providers::{
    ChatTurn, ChunkSink, CompletionOptions, CompletionResult, ProviderAdapter, ProviderError,
    ProviderKind,
};
use crate::council::state::AgentProfile;
use crate::council::transport::Transport;

const DEFAULT_BASE_URL: &str = "https://api.moonshot.ai/v1";

pub struct KimiAdapter {
    delegate: ChatCompat,
}

impl KimiAdapter {
    pub fn new(api_key: String, base_url: Option<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            delegate: ChatCompat::new(
                CompatProfile {
                    provider: ProviderKind::Kimi,
                    default_base: DEFAULT_BASE_URL,
                    temperature_range: (0.0, 1.0),
                },
                api_key,
                base_url,
                transport,
            ),
        }
    }

    fn extra(options: &CompletionOptions) -> impl Fn(&mut Value) {
        let use_search = options.use_search;
        move |body: &mut Value| {
            if use_search {
                body["use_search"] = json!(true);
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for KimiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kimi
    }

    async fn complete(
        &self,
        agent: &AgentProfile,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        self.delegate
            .complete(&agent.model, conversation, options, &Self::extra(options))
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
            .complete_stream(
                &agent.model,
                conversation,
                options,
                on_chunk,
                cancel,
                &Self::extra(options),
            )
            .await
    }

    async fn test_connection(&self) -> bool {
        self.delegate.test_connection("kimi-latest").await
    }
}
