//! Anthropic adapter speaking the Messages API.
//!
//! System turns are extracted to the top-level `system` field, the remaining
//! turns are mapped onto alternating `{user|assistant}` entries (consecutive
//! same-role turns are merged, which the council's speaker-attributed
//! context produces routinely), `max_tokens` is always supplied, and the
//! temperature is clamped to Anthropic's [0, 1] range.
//!
//! Authentication uses `x-api-key` plus the pinned `anthropic-version`
//! header rather than a bearer token.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::council::providers::sse::SseParser;
use crate::council::providers::{
    coalesce_turns, resolve_endpoint, ChatRole, ChatTurn, ChunkSink, CompletionOptions,
    CompletionResult, FinishReason, ProviderAdapter, ProviderError, ProviderKind,
};
use crate::council::state::{AgentProfile, TokenUsage};
use crate::council::transport::{stream_with_fallback, Transport, TransportRequest};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const MESSAGES_SUFFIX: &str = "/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Canonical model the orchestrator rewrites an unknown opus-family
/// identifier to before its single retry.
pub const OPUS_FALLBACK_MODEL: &str = "claude-opus-4-1";

/// True for Anthropic opus-family model identifiers.
pub fn is_opus_family(model: &str) -> bool {
    model.starts_with("claude") && model.contains("opus")
}

pub struct AnthropicAdapter {
    api_key: String,
    base_url: Option<String>,
    transport: Arc<dyn Transport>,
}

impl AnthropicAdapter {
    pub fn new(api_key: String, base_url: Option<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            api_key,
            base_url,
            transport,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        resolve_endpoint(base, MESSAGES_SUFFIX)
    }

    fn body(
        &self,
        model: &str,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
        stream: bool,
    ) -> Value {
        let system: Vec<&str> = conversation
            .iter()
            .filter(|t| t.role == ChatRole::System)
            .map(|t| t.text.as_ref())
            .collect();

        let non_system: Vec<ChatTurn> = conversation
            .iter()
            .filter(|t| t.role != ChatRole::System)
            .cloned()
            .collect();
        let messages: Vec<Value> = coalesce_turns(&non_system)
            .into_iter()
            .map(|(role, text)| {
                let role = match role {
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                };
                json!({"role": role, "content": text})
            })
            .collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": options.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature.clamp(0.0, 1.0));
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn request(&self, body: &Value, options: &CompletionOptions) -> TransportRequest {
        TransportRequest::post(self.endpoint())
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", API_VERSION)
            .json_body(body)
            .timeouts(options.overall_timeout, options.idle_timeout)
    }

    fn finish_from(stop_reason: Option<&str>) -> FinishReason {
        match stop_reason {
            Some("max_tokens") => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn complete(
        &self,
        agent: &AgentProfile,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        let body = self.body(&agent.model, conversation, options, false);
        let request = self.request(&body, options);
        let started = Instant::now();

        let response = self.transport.fetch(&request).await?;
        if !response.is_success() {
            return Err(ProviderError::Http {
                provider: ProviderKind::Anthropic,
                status: response.status,
                message: response.body,
            });
        }

        let parsed: Value =
            serde_json::from_str(&response.body).map_err(|e| ProviderError::Malformed {
                provider: ProviderKind::Anthropic,
                detail: e.to_string(),
            })?;

        let mut content = String::new();
        for block in parsed["content"].as_array().into_iter().flatten() {
            if block["type"].as_str() == Some("text") {
                if let Some(text) = block["text"].as_str() {
                    content.push_str(text);
                }
            }
        }
        if content.is_empty() {
            return Err(ProviderError::Malformed {
                provider: ProviderKind::Anthropic,
                detail: "no text content blocks".to_string(),
            });
        }

        Ok(CompletionResult {
            content,
            usage: TokenUsage {
                input_tokens: parsed["usage"]["input_tokens"].as_u64().unwrap_or(0) as usize,
                output_tokens: parsed["usage"]["output_tokens"].as_u64().unwrap_or(0) as usize,
                reasoning_tokens: 0,
            },
            finish: Self::finish_from(parsed["stop_reason"].as_str()),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn complete_stream(
        &self,
        agent: &AgentProfile,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
        on_chunk: ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResult, ProviderError> {
        let body = self.body(&agent.model, conversation, options, true);
        let request = self.request(&body, options);
        let started = Instant::now();

        let mut parser = SseParser::new();
        let mut content = String::new();
        let mut usage = TokenUsage::default();
        let mut finish = FinishReason::Stop;

        {
            let mut handle = |chunk: &str| {
                for event in parser.push(chunk) {
                    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                        continue;
                    };
                    match value["type"].as_str() {
                        // Input tokens arrive up front on message_start.
                        Some("message_start") => {
                            usage.input_tokens = value["message"]["usage"]["input_tokens"]
                                .as_u64()
                                .unwrap_or(0)
                                as usize;
                        }
                        Some("content_block_delta") => {
                            if value["delta"]["type"].as_str() == Some("text_delta") {
                                if let Some(delta) = value["delta"]["text"].as_str() {
                                    if !delta.is_empty() {
                                        content.push_str(delta);
                                        on_chunk(delta);
                                    }
                                }
                            }
                        }
                        // Output tokens and the stop reason ride the
                        // terminal message_delta.
                        Some("message_delta") => {
                            if let Some(tokens) = value["usage"]["output_tokens"].as_u64() {
                                usage.output_tokens = tokens as usize;
                            }
                            if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                                finish = Self::finish_from(Some(reason));
                            }
                        }
                        _ => {}
                    }
                }
            };
            stream_with_fallback(&*self.transport, &request, &mut handle, cancel, None).await?;
        }

        Ok(CompletionResult {
            content,
            usage,
            finish,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn test_connection(&self) -> bool {
        let agent = AgentProfile::probe(ProviderKind::Anthropic, "claude-haiku-3-5-haiku-latest");
        let options = CompletionOptions {
            max_output_tokens: Some(16),
            ..Default::default()
        };
        self.complete(&agent, &[ChatTurn::user("ping")], &options)
            .await
            .is_ok()
    }
}
