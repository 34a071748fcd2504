//! OpenAI-compatible streaming chat-completion provider, shared by
//! OpenAI, DeepSeek, and OpenRouter (they differ only in base URL,
//! a couple of extra headers, and which delta field carries reasoning).

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;

use super::{Capabilities, GenerationChunk, GenerationRequest, ProviderError, classify_error, drain_sse_lines};
use crate::storage::{ApiConfig, ProviderKind};

pub struct OpenAiProvider {
    kind: ProviderKind,
    config: ApiConfig,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(kind: ProviderKind, config: ApiConfig) -> Self {
        Self { kind, config, client: reqwest::Client::new() }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            reasoning: matches!(self.kind, ProviderKind::DeepSeek | ProviderKind::OpenRouter),
            vision_api: false,
            max_context_window: 128_000,
            requires_polling: false,
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or_else(|| match self.kind {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            _ => "",
        })
    }

    fn build_body(&self, request: &GenerationRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt},
            ],
            "stream": stream,
            "temperature": request.settings.temperature,
        });

        let obj = body.as_object_mut().unwrap();
        if uses_max_completion_tokens(&self.config.model) {
            obj.insert("max_completion_tokens".to_string(), json!(request.settings.max_tokens));
        } else {
            obj.insert("max_tokens".to_string(), json!(request.settings.max_tokens));
        }
        if let Some(top_p) = request.settings.top_p {
            obj.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(fp) = request.settings.frequency_penalty {
            obj.insert("frequency_penalty".to_string(), json!(fp));
        }
        if let Some(pp) = request.settings.presence_penalty {
            obj.insert("presence_penalty".to_string(), json!(pp));
        }
        if !request.settings.stop_sequences.is_empty() {
            obj.insert("stop".to_string(), json!(request.settings.stop_sequences));
        }
        if matches!(self.kind, ProviderKind::OpenRouter) {
            obj.insert("route".to_string(), json!("fallback"));
        }
        body
    }

    /// Validates the config fields this provider actually needs before
    /// a request is attempted, rather than letting a blank `api_key` or
    /// `model` surface as an opaque upstream 401/404.
    pub fn validate_config(&self) -> Result<(), ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::AuthError("missing api key".to_string()));
        }
        if self.config.model.is_empty() {
            return Err(ProviderError::ApiError("missing model".to_string()));
        }
        Ok(())
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url());
        let mut req = self.client.post(&url).bearer_auth(&self.config.api_key).json(body);
        if matches!(self.kind, ProviderKind::OpenRouter) {
            req = req.header("HTTP-Referer", "https://ursceal.local").header("X-Title", "ursceal");
            if !self.config.openrouter_provider_preference.is_empty() {
                req = req.header(
                    "X-OpenRouter-Provider",
                    self.config.openrouter_provider_preference.join(","),
                );
            }
        }
        req
    }

    pub async fn generate_streaming<'a>(
        &'a self,
        request: GenerationRequest<'a>,
    ) -> Result<BoxStream<'a, Result<GenerationChunk, ProviderError>>, ProviderError> {
        let body = self.build_body(&request, true);
        let response = self.request(&body).send().await.map_err(|e| classify_error(&e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(&format!("{status}: {text}")));
        }

        let reasoning_field = reasoning_field_for(self.kind);
        let byte_stream = response.bytes_stream();
        let parsed = byte_stream.scan(String::new(), move |buffer, chunk| {
            let result: Vec<Result<GenerationChunk, ProviderError>> = match chunk {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).to_string();
                    drain_sse_lines(buffer, &text)
                        .into_iter()
                        .filter(|payload| payload != "[DONE]" && !payload.is_empty())
                        .map(|payload| parse_delta(&payload, reasoning_field))
                        .collect()
                }
                Err(e) => vec![Err(classify_error(&e.to_string()))],
            };
            futures::future::ready(Some(stream::iter(result)))
        });

        Ok(parsed.flatten().boxed())
    }

    /// Non-streaming chat completion: parses `choices[0].message.content`
    /// and, for DeepSeek/OpenRouter, the matching reasoning field.
    pub async fn generate(
        &self,
        request: GenerationRequest<'_>,
    ) -> Result<GenerationChunk, ProviderError> {
        let body = self.build_body(&request, false);
        let response = self.request(&body).send().await.map_err(|e| classify_error(&e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(&format!("{status}: {text}")));
        }

        let value: serde_json::Value =
            response.json().await.map_err(|e| ProviderError::ApiError(e.to_string()))?;
        Ok(parse_message(&value, reasoning_field_for(self.kind)))
    }
}

fn parse_message(value: &serde_json::Value, reasoning_field: &str) -> GenerationChunk {
    let message = &value["choices"][0]["message"];
    let content = message["content"].as_str().map(|s| s.to_string());
    let reasoning = if !reasoning_field.is_empty() {
        message[reasoning_field].as_str().map(|s| s.to_string())
    } else {
        None
    };
    GenerationChunk { reasoning, content, finished: true }
}

fn reasoning_field_for(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::DeepSeek => "reasoning_content",
        ProviderKind::OpenRouter => "reasoning",
        _ => "",
    }
}

fn parse_delta(payload: &str, reasoning_field: &str) -> Result<GenerationChunk, ProviderError> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| ProviderError::ApiError(e.to_string()))?;
    let choice = &value["choices"][0];
    let delta = &choice["delta"];
    let content = delta["content"].as_str().map(|s| s.to_string());
    let reasoning = if !reasoning_field.is_empty() {
        delta[reasoning_field]
            .as_str()
            .map(|s| s.to_string())
            .or_else(|| delta["reasoning_details"][0]["text"].as_str().map(|s| s.to_string()))
    } else {
        None
    };
    let finished = !choice["finish_reason"].is_null();
    Ok(GenerationChunk { reasoning, content, finished })
}

/// The `max_completion_tokens` field replaces `max_tokens` for newer
/// reasoning-family model names.
fn uses_max_completion_tokens(model: &str) -> bool {
    let lower = model.to_lowercase();
    lower.starts_with("gpt-5") || lower.starts_with("o1") || lower.starts_with("o3") || lower.starts_with("chatgpt-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_family_models_use_max_completion_tokens() {
        assert!(uses_max_completion_tokens("gpt-5-turbo"));
        assert!(uses_max_completion_tokens("o1-preview"));
        assert!(uses_max_completion_tokens("O3-mini"));
        assert!(uses_max_completion_tokens("chatgpt-4o-latest"));
        assert!(!uses_max_completion_tokens("gpt-4o"));
    }

    #[test]
    fn parses_content_delta() {
        let payload = r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":null}]}"#;
        let chunk = parse_delta(payload, "").unwrap();
        assert_eq!(chunk.content.as_deref(), Some("hi"));
        assert!(!chunk.finished);
    }

    #[test]
    fn parses_deepseek_reasoning_delta() {
        let payload = r#"{"choices":[{"delta":{"reasoning_content":"thinking"},"finish_reason":null}]}"#;
        let chunk = parse_delta(payload, "reasoning_content").unwrap();
        assert_eq!(chunk.reasoning.as_deref(), Some("thinking"));
    }

    #[test]
    fn finish_reason_present_marks_finished() {
        let payload = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let chunk = parse_delta(payload, "").unwrap();
        assert!(chunk.finished);
    }

    #[test]
    fn parses_non_streaming_message_content_and_reasoning() {
        let value = serde_json::json!({
            "choices": [{"message": {"content": "hi", "reasoning_content": "thinking"}}]
        });
        let chunk = parse_message(&value, "reasoning_content");
        assert_eq!(chunk.content.as_deref(), Some("hi"));
        assert_eq!(chunk.reasoning.as_deref(), Some("thinking"));
        assert!(chunk.finished);
    }

    #[test]
    fn validate_config_requires_api_key_and_model() {
        let provider = OpenAiProvider::new(ProviderKind::OpenAi, ApiConfig::default());
        assert!(matches!(provider.validate_config(), Err(ProviderError::AuthError(_))));

        let provider = OpenAiProvider::new(
            ProviderKind::OpenAi,
            ApiConfig { api_key: "key".to_string(), ..ApiConfig::default() },
        );
        assert!(matches!(provider.validate_config(), Err(ProviderError::ApiError(_))));

        let provider = OpenAiProvider::new(
            ProviderKind::OpenAi,
            ApiConfig { api_key: "key".to_string(), model: "gpt-4o".to_string(), ..ApiConfig::default() },
        );
        assert!(provider.validate_config().is_ok());
    }
}
