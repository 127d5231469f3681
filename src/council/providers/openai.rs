//! OpenAI adapter speaking the Responses API.
//!
//! The unified conversation is projected into `input[]` entries with the
//! system turns lifted into `instructions`.  Reasoning-class models
//! (`o*`/`gpt-5*`) reject a sampling temperature, so it is suppressed for
//! them and an optional `reasoning.effort` hint is forwarded instead.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::council::providers::sse::SseParser;
use crate::council::providers::{
    resolve_endpoint, ChatRole, ChatTurn, ChunkSink, CompletionOptions, CompletionResult,
    FinishReason, ProviderAdapter, ProviderError, ProviderKind,
};
use crate::council::state::{AgentProfile, TokenUsage};
use crate::council::transport::{stream_with_fallback, Transport, TransportRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const RESPONSES_SUFFIX: &str = "/responses";

/// Models that plan before answering and reject a sampling temperature.
pub fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
        || model.starts_with("gpt-5")
}

pub struct OpenAiAdapter {
    api_key: String,
    base_url: Option<String>,
    transport: Arc<dyn Transport>,
}

impl OpenAiAdapter {
    pub fn new(api_key: String, base_url: Option<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            api_key,
            base_url,
            transport,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        resolve_endpoint(base, RESPONSES_SUFFIX)
    }

    fn body(
        &self,
        model: &str,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
        stream: bool,
    ) -> Value {
        let instructions: Vec<&str> = conversation
            .iter()
            .filter(|t| t.role == ChatRole::System)
            .map(|t| t.text.as_ref())
            .collect();
        let input: Vec<Value> = conversation
            .iter()
            .filter(|t| t.role != ChatRole::System)
            .map(|t| {
                let role = match t.role {
                    ChatRole::User => "user",
                    _ => "assistant",
                };
                json!({"role": role, "content": t.text.as_ref()})
            })
            .collect();

        let mut body = json!({
            "model": model,
            "input": input,
        });
        if !instructions.is_empty() {
            body["instructions"] = json!(instructions.join("\n\n"));
        }
        if let Some(max) = options.max_output_tokens {
            body["max_output_tokens"] = json!(max);
        }
        if is_reasoning_model(model) {
            if let Some(effort) = &options.reasoning_effort {
                body["reasoning"] = json!({"effort": effort});
            }
        } else if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn request(&self, body: &Value, options: &CompletionOptions) -> TransportRequest {
        TransportRequest::post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json_body(body)
            .timeouts(options.overall_timeout, options.idle_timeout)
    }

    fn usage_from(value: &Value) -> TokenUsage {
        let usage = &value["usage"];
        TokenUsage {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as usize,
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as usize,
            reasoning_tokens: usage["output_tokens_details"]["reasoning_tokens"]
                .as_u64()
                .unwrap_or(0) as usize,
        }
    }

    fn finish_from(response: &Value) -> FinishReason {
        match response["incomplete_details"]["reason"].as_str() {
            Some("max_output_tokens") => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }

    /// Collect the assistant text out of the `output[]` items.
    fn text_from(response: &Value) -> Option<String> {
        let output = response["output"].as_array()?;
        let mut text = String::new();
        for item in output {
            if item["type"].as_str() != Some("message") {
                continue;
            }
            for part in item["content"].as_array().into_iter().flatten() {
                if part["type"].as_str() == Some("output_text") {
                    if let Some(chunk) = part["text"].as_str() {
                        text.push_str(chunk);
                    }
                }
            }
        }
        (!text.is_empty()).then_some(text)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
                provider: ProviderKind::OpenAi,
                status: response.status,
                message: response.body,
            });
        }

        let parsed: Value =
            serde_json::from_str(&response.body).map_err(|e| ProviderError::Malformed {
                provider: ProviderKind::OpenAi,
                detail: e.to_string(),
            })?;
        let content = Self::text_from(&parsed).ok_or_else(|| ProviderError::Malformed {
            provider: ProviderKind::OpenAi,
            detail: "no output_text in response".to_string(),
        })?;

        Ok(CompletionResult {
            content,
            usage: Self::usage_from(&parsed),
            finish: Self::finish_from(&parsed),
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
                    if event.is_done() {
                        continue;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                        continue;
                    };
                    // The payload type field is authoritative; the `event:`
                    // line mirrors it.
                    let kind = value["type"]
                        .as_str()
                        .map(str::to_string)
                        .or(event.event.clone());
                    match kind.as_deref() {
                        Some("response.output_text.delta") => {
                            if let Some(delta) = value["delta"].as_str() {
                                if !delta.is_empty() {
                                    content.push_str(delta);
                                    on_chunk(delta);
                                }
                            }
                        }
                        Some("response.completed") => {
                            usage = Self::usage_from(&value["response"]);
                            finish = Self::finish_from(&value["response"]);
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
        let agent = AgentProfile::probe(ProviderKind::OpenAi, "gpt-5-nano");
        let options = CompletionOptions {
            max_output_tokens: Some(16),
            ..Default::default()
        };
        self.complete(&agent, &[ChatTurn::user("ping")], &options)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_models_suppress_temperature() {
        let adapter = OpenAiAdapter::new(
            "k".into(),
            None,
            Arc::new(crate::council::transport::HttpTransport::new()),
        );
        let options = CompletionOptions {
            temperature: Some(0.9),
            reasoning_effort: Some("medium".to_string()),
            ..Default::default()
        };

        let body = adapter.body("gpt-5", &[ChatTurn::user("x")], &options, false);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["reasoning"]["effort"].as_str(), Some("medium"));

        let body = adapter.body("gpt-4.1", &[ChatTurn::user("x")], &options, false);
        assert!((body["temperature"].as_f64().unwrap() - 0.9).abs() < 1e-6);
        assert!(body.get("reasoning").is_none());
    }

    #[test]
    fn system_turns_become_instructions() {
        let adapter = OpenAiAdapter::new(
            "k".into(),
            None,
            Arc::new(crate::council::transport::HttpTransport::new()),
        );
        let conversation = vec![
            ChatTurn::system("You are Kate."),
            ChatTurn::user("Douglas: hello"),
            ChatTurn::assistant("my prior turn"),
        ];
        let body = adapter.body("gpt-4.1", &conversation, &CompletionOptions::default(), false);

        assert_eq!(body["instructions"].as_str(), Some("You are Kate."));
        let input = body["input"].as_array().unwrap();
        assert_eq!(input.len(), 2);
        assert_eq!(input[0]["role"].as_str(), Some("user"));
        assert_eq!(input[1]["role"].as_str(), Some("assistant"));
    }

    #[test]
    fn unary_text_extraction_walks_output_items() {
        let response = json!({
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "Hello "},
                    {"type": "output_text", "text": "world"}
                ]}
            ],
            "usage": {"input_tokens": 9, "output_tokens": 4,
                      "output_tokens_details": {"reasoning_tokens": 2}}
        });
        assert_eq!(
            OpenAiAdapter::text_from(&response).unwrap(),
            "Hello world"
        );
        let usage = OpenAiAdapter::usage_from(&response);
        assert_eq!(usage.input_tokens, 9);
        assert_eq!(usage.reasoning_tokens, 2);
    }
}
