//! Shared OpenAI chat-completions wire shaping.
//!
//! DeepSeek and Kimi speak the chat-completions dialect, so their adapters
//! delegate the HTTP plumbing here and only contribute their base URL,
//! temperature range, and provider-specific extras.  The delegation mirrors
//! how the other adapters each own their schema while reusing the same
//! transport and SSE machinery.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::council::providers::sse::SseParser;
use crate::council::providers::{
    ChatRole, ChatTurn, ChunkSink, CompletionOptions, CompletionResult, FinishReason,
    ProviderError, ProviderKind,
};
use crate::council::state::TokenUsage;
use crate::council::transport::{stream_with_fallback, Transport, TransportRequest};

const CHAT_SUFFIX: &str = "/chat/completions";

/// Provider-specific knobs applied on top of the shared shaping.
pub(crate) struct CompatProfile {
    pub provider: ProviderKind,
    pub default_base: &'static str,
    /// Inclusive temperature range accepted by the provider.
    pub temperature_range: (f32, f32),
}

/// One chat-completions endpoint bound to an API key.
pub(crate) struct ChatCompat {
    profile: CompatProfile,
    api_key: String,
    base_url: Option<String>,
    transport: Arc<dyn Transport>,
}

impl ChatCompat {
    pub(crate) fn new(
        profile: CompatProfile,
        api_key: String,
        base_url: Option<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            profile,
            api_key,
            base_url,
            transport,
        }
    }

    pub(crate) fn provider(&self) -> ProviderKind {
        self.profile.provider
    }

    fn endpoint(&self) -> String {
        let base = self.base_url.as_deref().unwrap_or(self.profile.default_base);
        super::resolve_endpoint(base, CHAT_SUFFIX)
    }

    fn clamp_temperature(&self, temperature: f32) -> f32 {
        let (lo, hi) = self.profile.temperature_range;
        temperature.clamp(lo, hi)
    }

    fn body(
        &self,
        model: &str,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
        stream: bool,
        extra: &(dyn Fn(&mut Value) + Send + Sync),
    ) -> Value {
        let messages: Vec<Value> = conversation
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                };
                json!({"role": role, "content": turn.text.as_ref()})
            })
            .collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(self.clamp_temperature(temperature));
        }
        if let Some(max) = options.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        extra(&mut body);
        body
    }

    fn request(&self, body: &Value, options: &CompletionOptions) -> TransportRequest {
        TransportRequest::post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json_body(body)
            .timeouts(options.overall_timeout, options.idle_timeout)
    }

    fn usage_from(&self, value: &Value) -> TokenUsage {
        let usage = &value["usage"];
        TokenUsage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as usize,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as usize,
            reasoning_tokens: usage["completion_tokens_details"]["reasoning_tokens"]
                .as_u64()
                .unwrap_or(0) as usize,
        }
    }

    fn finish_from(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("length") => FinishReason::Length,
            Some("stop") | None => FinishReason::Stop,
            Some(_) => FinishReason::Stop,
        }
    }

    pub(crate) async fn complete(
        &self,
        model: &str,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
        extra: &(dyn Fn(&mut Value) + Send + Sync),
    ) -> Result<CompletionResult, ProviderError> {
        let body = self.body(model, conversation, options, false, extra);
        let request = self.request(&body, options);
        let started = Instant::now();

        let response = self.transport.fetch(&request).await?;
        if !response.is_success() {
            return Err(ProviderError::Http {
                provider: self.provider(),
                status: response.status,
                message: response.body,
            });
        }

        let parsed: Value = serde_json::from_str(&response.body).map_err(|e| {
            ProviderError::Malformed {
                provider: self.provider(),
                detail: e.to_string(),
            }
        })?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed {
                provider: self.provider(),
                detail: "no choices[0].message.content".to_string(),
            })?
            .to_string();

        Ok(CompletionResult {
            content,
            usage: self.usage_from(&parsed),
            finish: Self::finish_from(parsed["choices"][0]["finish_reason"].as_str()),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    pub(crate) async fn complete_stream(
        &self,
        model: &str,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
        on_chunk: ChunkSink<'_>,
        cancel: &CancellationToken,
        extra: &(dyn Fn(&mut Value) + Send + Sync),
    ) -> Result<CompletionResult, ProviderError> {
        let body = self.body(model, conversation, options, true, extra);
        let request = self.request(&body, options);
        let started = Instant::now();

        let mut parser = SseParser::new();
        let mut content = String::new();
        let mut usage = TokenUsage::default();
        let mut finish = FinishReason::Stop;

        {
            let mut handle = |chunk: &str| {
                for event in parser.push(chunk) {
                    if event.is_done() {
                        continue;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                        continue;
                    };
                    if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                        if !delta.is_empty() {
                            content.push_str(delta);
                            on_chunk(delta);
                        }
                    }
                    if let Some(reason) = value["choices"][0]["finish_reason"].as_str() {
                        finish = Self::finish_from(Some(reason));
                    }
                    // The final chunk (often with an empty choices array)
                    // carries the usage block when include_usage is set.
                    if value["usage"].is_object() {
                        usage = self.usage_from(&value);
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

    pub(crate) async fn test_connection(&self, model: &str) -> bool {
        let probe = [ChatTurn::user("ping")];
        let options = CompletionOptions {
            max_output_tokens: Some(8),
            ..Default::default()
        };
        self.complete(model, &probe, &options, &|_| {}).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::council::transport::{TransportError, UnaryResponse};
    use async_trait::async_trait;

    struct CannedTransport {
        body: String,
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn fetch(&self, _req: &TransportRequest) -> Result<UnaryResponse, TransportError> {
            Ok(UnaryResponse {
                status: 200,
                headers: Default::default(),
                body: self.body.clone(),
            })
        }

        async fn fetch_stream(
            &self,
            _req: &TransportRequest,
            on_chunk: &mut (dyn for<'r> FnMut(&'r str) + Send),
            _cancel: &CancellationToken,
        ) -> Result<(), TransportError> {
            on_chunk(&self.body);
            Ok(())
        }
    }

    fn compat(body: &str) -> ChatCompat {
        ChatCompat::new(
            CompatProfile {
                provider: ProviderKind::DeepSeek,
                default_base: "https://api.deepseek.com/v1",
                temperature_range: (0.0, 2.0),
            },
            "key".to_string(),
            None,
            Arc::new(CannedTransport {
                body: body.to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn unary_parses_content_and_usage() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        })
        .to_string();
        let compat = compat(&body);

        let result = compat
            .complete(
                "deepseek-chat",
                &[ChatTurn::user("hello")],
                &CompletionOptions::default(),
                &|_| {},
            )
            .await
            .unwrap();
        assert_eq!(result.content, "hi");
        assert_eq!(result.usage.input_tokens, 12);
        assert_eq!(result.usage.output_tokens, 3);
        assert_eq!(result.finish, FinishReason::Stop);
    }

    #[tokio::test]
    async fn streaming_coalesces_deltas_and_final_usage() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        let compat = compat(body);

        let mut seen = String::new();
        let cancel = CancellationToken::new();
        let result = compat
            .complete_stream(
                "deepseek-chat",
                &[ChatTurn::user("hello")],
                &CompletionOptions::default(),
                &mut |delta| seen.push_str(delta),
                &cancel,
                &|_| {},
            )
            .await
            .unwrap();

        assert_eq!(result.content, "Hello");
        assert_eq!(seen, "Hello");
        assert_eq!(result.usage.input_tokens, 7);
        assert_eq!(result.usage.output_tokens, 2);
    }

    #[test]
    fn temperature_clamped_to_profile_range() {
        let compat = compat("{}");
        let options = CompletionOptions {
            temperature: Some(3.5),
            ..Default::default()
        };
        let body = compat.body("m", &[ChatTurn::user("x")], &options, false, &|_| {});
        assert_eq!(body["temperature"].as_f64().unwrap(), 2.0);
    }
}
