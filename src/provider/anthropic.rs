//! Anthropic Messages API provider.

use futures::stream::{self, BoxStream, StreamExt};
use log::warn;
use serde_json::json;

use super::{Capabilities, GenerationChunk, GenerationRequest, ProviderError, classify_error, drain_sse_lines};
use crate::storage::ApiConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    config: ApiConfig,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: ApiConfig) -> Self {
        Self { config, client: reqwest::Client::new() }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            reasoning: false,
            vision_api: true,
            max_context_window: 200_000,
            requires_polling: false,
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or("https://api.anthropic.com/v1")
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

    fn build_body(&self, request: &GenerationRequest, stream: bool) -> serde_json::Value {
        let temperature = clamp_temperature(request.settings.temperature);
        let mut body = json!({
            "model": self.config.model,
            "system": request.system_prompt,
            "messages": [{"role": "user", "content": request.user_prompt}],
            "max_tokens": request.settings.max_tokens,
            "temperature": temperature,
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(top_p) = request.settings.top_p {
            obj.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(top_k) = request.settings.top_k {
            obj.insert("top_k".to_string(), json!(top_k));
        }
        if !request.settings.stop_sequences.is_empty() {
            obj.insert("stop_sequences".to_string(), json!(request.settings.stop_sequences));
        }
        body
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/messages", self.base_url());
        self.client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
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

        let byte_stream = response.bytes_stream();
        let parsed = byte_stream.scan(String::new(), move |buffer, chunk| {
            let result: Vec<Result<GenerationChunk, ProviderError>> = match chunk {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).to_string();
                    drain_sse_lines(buffer, &text)
                        .into_iter()
                        .filter(|payload| !payload.is_empty())
                        .filter_map(|payload| parse_event(&payload))
                        .collect()
                }
                Err(e) => vec![Err(classify_error(&e.to_string()))],
            };
            futures::future::ready(Some(stream::iter(result)))
        });

        Ok(parsed.flatten().boxed())
    }

    /// Non-streaming Messages API call: concatenates only `type == "text"`
    /// content blocks from the response body.
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
        let content = concat_text_blocks(&value);
        Ok(GenerationChunk { reasoning: None, content: Some(content), finished: true })
    }
}

/// Values above 1.0 are logged and clamped (§4.5.2).
fn clamp_temperature(temperature: f32) -> f32 {
    if temperature > 1.0 {
        warn!("anthropic: clamping temperature {temperature} to 1.0");
        1.0
    } else if temperature < 0.0 {
        warn!("anthropic: clamping temperature {temperature} to 0.0");
        0.0
    } else {
        temperature
    }
}

fn parse_event(payload: &str) -> Option<Result<GenerationChunk, ProviderError>> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    match value["type"].as_str()? {
        "content_block_delta" if value["delta"]["type"] == "text_delta" => {
            let content = value["delta"]["text"].as_str().map(|s| s.to_string());
            Some(Ok(GenerationChunk { reasoning: None, content, finished: false }))
        }
        "message_stop" => Some(Ok(GenerationChunk { reasoning: None, content: None, finished: true })),
        _ => None,
    }
}

/// Concatenates only `type == "text"` blocks from a non-streaming
/// Messages API response body.
pub fn concat_text_blocks(response: &serde_json::Value) -> String {
    response["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_temperature_above_one() {
        assert_eq!(clamp_temperature(1.8), 1.0);
    }

    #[test]
    fn leaves_in_range_temperature_untouched() {
        assert_eq!(clamp_temperature(0.6), 0.6);
    }

    #[test]
    fn parses_text_delta_event() {
        let payload = r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}"#;
        let chunk = parse_event(payload).unwrap().unwrap();
        assert_eq!(chunk.content.as_deref(), Some("hi"));
    }

    #[test]
    fn message_stop_marks_finished() {
        let payload = r#"{"type":"message_stop"}"#;
        let chunk = parse_event(payload).unwrap().unwrap();
        assert!(chunk.finished);
    }

    #[test]
    fn concatenates_only_text_blocks() {
        let response = json!({
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "tool_use", "text": "ignored"},
                {"type": "text", "text": "world"},
            ]
        });
        assert_eq!(concat_text_blocks(&response), "Hello world");
    }

    #[test]
    fn validate_config_requires_api_key_and_model() {
        let provider = AnthropicProvider::new(ApiConfig::default());
        assert!(matches!(provider.validate_config(), Err(ProviderError::AuthError(_))));

        let provider =
            AnthropicProvider::new(ApiConfig { api_key: "key".to_string(), ..ApiConfig::default() });
        assert!(matches!(provider.validate_config(), Err(ProviderError::ApiError(_))));

        let provider = AnthropicProvider::new(ApiConfig {
            api_key: "key".to_string(),
            model: "claude-3-opus".to_string(),
            ..ApiConfig::default()
        });
        assert!(provider.validate_config().is_ok());
    }
}
