//! Google Gemini adapter speaking the Generative Language API.
//!
//! Turns are remapped into `contents[]` entries (assistant becomes the
//! `"model"` role), system turns travel separately as `systemInstruction`,
//! and sampling knobs ride `generationConfig` — including an optional
//! `thinkingConfig` for thinking-capable models.  The model identifier is
//! part of the URL path rather than the body, and auth uses the
//! `x-goog-api-key` header.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::council::providers::sse::SseParser;
use crate::council::providers::{
    coalesce_turns, ChatRole, ChatTurn, ChunkSink, CompletionOptions, CompletionResult,
    FinishReason, ProviderAdapter, ProviderError, ProviderKind,
};
use crate::council::state::{AgentProfile, TokenUsage};
use crate::council::transport::{stream_with_fallback, Transport, TransportRequest};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Models that expose a controllable thinking budget.
pub fn is_thinking_capable(model: &str) -> bool {
    model.contains("gemini-2.5") || model.contains("thinking")
}

pub struct GeminiAdapter {
    api_key: String,
    base_url: Option<String>,
    transport: Arc<dyn Transport>,
}

impl GeminiAdapter {
    pub fn new(api_key: String, base_url: Option<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            api_key,
            base_url,
            transport,
        }
    }

    /// Gemini routes by model in the path, so endpoint resolution happens
    /// per call: `{base}/models/{model}:{verb}`.
    fn endpoint(&self, model: &str, stream: bool) -> String {
        let base = self
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        if stream {
            format!("{}/models/{}:streamGenerateContent?alt=sse", base, model)
        } else {
            format!("{}/models/{}:generateContent", base, model)
        }
    }

    fn body(&self, model: &str, conversation: &[ChatTurn], options: &CompletionOptions) -> Value {
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
        let contents: Vec<Value> = coalesce_turns(&non_system)
            .into_iter()
            .map(|(role, text)| {
                let role = match role {
                    ChatRole::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": text}]})
            })
            .collect();

        let mut generation_config = json!({});
        if let Some(temperature) = options.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(max) = options.max_output_tokens {
            generation_config["maxOutputTokens"] = json!(max);
        }
        if is_thinking_capable(model) {
            if let Some(budget) = options.thinking_budget {
                generation_config["thinkingConfig"] = json!({"thinkingBudget": budget});
            }
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
        }
        body
    }

    fn request(&self, url: String, body: &Value, options: &CompletionOptions) -> TransportRequest {
        TransportRequest::post(url)
            .header("x-goog-api-key", self.api_key.clone())
            .json_body(body)
            .timeouts(options.overall_timeout, options.idle_timeout)
    }

    fn text_from(value: &Value) -> String {
        let mut text = String::new();
        for part in value["candidates"][0]["content"]["parts"]
            .as_array()
            .into_iter()
            .flatten()
        {
            if let Some(chunk) = part["text"].as_str() {
                text.push_str(chunk);
            }
        }
        text
    }

    fn usage_from(value: &Value, usage: &mut TokenUsage) {
        let metadata = &value["usageMetadata"];
        if !metadata.is_object() {
            return;
        }
        if let Some(tokens) = metadata["promptTokenCount"].as_u64() {
            usage.input_tokens = tokens as usize;
        }
        if let Some(tokens) = metadata["candidatesTokenCount"].as_u64() {
            usage.output_tokens = tokens as usize;
        }
        if let Some(tokens) = metadata["thoughtsTokenCount"].as_u64() {
            usage.reasoning_tokens = tokens as usize;
        }
    }

    fn finish_from(value: &Value) -> FinishReason {
        match value["candidates"][0]["finishReason"].as_str() {
            Some("MAX_TOKENS") => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn complete(
        &self,
        agent: &AgentProfile,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        let body = self.body(&agent.model, conversation, options);
        let request = self.request(self.endpoint(&agent.model, false), &body, options);
        let started = Instant::now();

        let response = self.transport.fetch(&request).await?;
        if !response.is_success() {
            return Err(ProviderError::Http {
                provider: ProviderKind::Gemini,
                status: response.status,
                message: response.body,
            });
        }

        let parsed: Value =
            serde_json::from_str(&response.body).map_err(|e| ProviderError::Malformed {
                provider: ProviderKind::Gemini,
                detail: e.to_string(),
            })?;
        let content = Self::text_from(&parsed);
        if content.is_empty() {
            return Err(ProviderError::Malformed {
                provider: ProviderKind::Gemini,
                detail: "no candidate text parts".to_string(),
            });
        }

        let mut usage = TokenUsage::default();
        Self::usage_from(&parsed, &mut usage);

        Ok(CompletionResult {
            content,
            usage,
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
        let body = self.body(&agent.model, conversation, options);
        let request = self.request(self.endpoint(&agent.model, true), &body, options);
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
                    let delta = Self::text_from(&value);
                    if !delta.is_empty() {
                        content.push_str(&delta);
                        on_chunk(&delta);
                    }
                    // usageMetadata is cumulative and rides every chunk;
                    // the last one seen wins.
                    Self::usage_from(&value, &mut usage);
                    if value["candidates"][0]["finishReason"].is_string() {
                        finish = Self::finish_from(&value);
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
        let agent = AgentProfile::probe(ProviderKind::Gemini, "gemini-2.5-flash");
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
    use crate::council::transport::HttpTransport;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new("k".into(), None, Arc::new(HttpTransport::new()))
    }

    #[test]
    fn roles_remap_and_system_splits_out() {
        let conversation = vec![
            ChatTurn::system("You are Grace."),
            ChatTurn::user("Kate: hello"),
            ChatTurn::assistant("my answer"),
        ];
        let body = adapter().body("gemini-2.5-flash", &conversation, &CompletionOptions::default());

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"].as_str(), Some("user"));
        assert_eq!(contents[1]["role"].as_str(), Some("model"));
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"].as_str(),
            Some("You are Grace.")
        );
    }

    #[test]
    fn thinking_config_only_for_capable_models() {
        let options = CompletionOptions {
            thinking_budget: Some(2048),
            ..Default::default()
        };
        let body = adapter().body("gemini-2.5-pro", &[ChatTurn::user("x")], &options);
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"].as_u64(),
            Some(2048)
        );

        let body = adapter().body("gemini-2.0-flash", &[ChatTurn::user("x")], &options);
        assert!(body["generationConfig"].get("thinkingConfig").is_none());
    }

    #[test]
    fn stream_endpoint_places_model_in_path() {
        let url = adapter().endpoint("gemini-2.5-flash", true);
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn usage_metadata_last_chunk_wins() {
        let mut usage = TokenUsage::default();
        GeminiAdapter::usage_from(
            &json!({"usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 1}}),
            &mut usage,
        );
        GeminiAdapter::usage_from(
            &json!({"usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 9,
                                       "thoughtsTokenCount": 4}}),
            &mut usage,
        );
        assert_eq!(usage.output_tokens, 9);
        assert_eq!(usage.reasoning_tokens, 4);
    }
}
