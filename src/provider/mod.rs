//! Pluggable LLM provider abstraction. A sealed `Provider` enum
//! dispatches to one of four backends sharing a uniform
//! `Capabilities`/`generate`/`generate_streaming` surface and a
//! substring-based error taxonomy.

pub mod anthropic;
pub mod horde;
pub mod openai;

use futures::stream::BoxStream;
use thiserror::Error;

use crate::storage::{ApiConfig, GenerationSettings, ProviderKind};

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub streaming: bool,
    pub reasoning: bool,
    pub vision_api: bool,
    pub max_context_window: u32,
    pub requires_polling: bool,
}

/// One chunk of a streaming generation. Mirrors the SSE record shape
/// (`sse::Record`) one-to-one; the bridge in `sse.rs` re-encodes these.
#[derive(Debug, Clone, Default)]
pub struct GenerationChunk {
    pub reasoning: Option<String>,
    pub content: Option<String>,
    pub finished: bool,
}

pub struct GenerationRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub settings: &'a GenerationSettings,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    AuthError(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("provider overloaded: {0}")]
    Overloaded(String),
    #[error("insufficient quota: {0}")]
    InsufficientQuota(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("queue error: {0}")]
    QueueError(String),
    #[error("provider API error: {0}")]
    ApiError(String),
}

/// Classifies a raw provider error message by substring inspection,
/// per the uniform error taxonomy (§4.5.4).
pub fn classify_error(message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") {
        ProviderError::AuthError(message.to_string())
    } else if lower.contains("429") || lower.contains("rate limit") {
        ProviderError::RateLimit(message.to_string())
    } else if lower.contains("402") || lower.contains("credits") {
        ProviderError::InsufficientCredits(message.to_string())
    } else if lower.contains("not found") && lower.contains("model") {
        ProviderError::ModelNotFound(message.to_string())
    } else if lower.contains("overloaded") {
        ProviderError::Overloaded(message.to_string())
    } else if lower.contains("quota") {
        ProviderError::InsufficientQuota(message.to_string())
    } else {
        ProviderError::ApiError(message.to_string())
    }
}

/// Splits a chunk of raw SSE bytes into complete `data: ...` payload
/// lines, given a carry-over buffer for content split across chunks.
/// Returns the payloads found and leaves any incomplete trailing line
/// in `buffer`. Lines equal to `[DONE]` and blank lines are skipped by
/// the caller, not here.
pub(crate) fn drain_sse_lines(buffer: &mut String, chunk: &str) -> Vec<String> {
    buffer.push_str(chunk);
    let mut out = Vec::new();
    while let Some(idx) = buffer.find('\n') {
        let line = buffer[..idx].trim_end_matches('\r').to_string();
        *buffer = buffer[idx + 1..].to_string();
        if let Some(payload) = line.strip_prefix("data: ") {
            out.push(payload.to_string());
        } else if let Some(payload) = line.strip_prefix("data:") {
            out.push(payload.trim_start().to_string());
        }
    }
    out
}

pub enum Provider {
    OpenAiCompatible(openai::OpenAiProvider),
    Anthropic(anthropic::AnthropicProvider),
    Horde(horde::HordeProvider),
}

impl Provider {
    pub fn new(kind: ProviderKind, config: ApiConfig) -> Self {
        match kind {
            ProviderKind::OpenAi | ProviderKind::DeepSeek | ProviderKind::OpenRouter => {
                Provider::OpenAiCompatible(openai::OpenAiProvider::new(kind, config))
            }
            ProviderKind::Anthropic => Provider::Anthropic(anthropic::AnthropicProvider::new(config)),
            ProviderKind::Horde => Provider::Horde(horde::HordeProvider::new(config)),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Provider::OpenAiCompatible(p) => p.capabilities(),
            Provider::Anthropic(p) => p.capabilities(),
            Provider::Horde(p) => p.capabilities(),
        }
    }

    pub fn validate_config(&self) -> Result<(), ProviderError> {
        match self {
            Provider::OpenAiCompatible(p) => p.validate_config(),
            Provider::Anthropic(p) => p.validate_config(),
            Provider::Horde(p) => p.validate_config(),
        }
    }

    /// Returns an error if called on a provider whose
    /// `capabilities().streaming` is `false` — callers should check
    /// first and fall back to [`Provider::generate`].
    pub async fn generate_streaming<'a>(
        &'a self,
        request: GenerationRequest<'a>,
    ) -> Result<BoxStream<'a, Result<GenerationChunk, ProviderError>>, ProviderError> {
        match self {
            Provider::OpenAiCompatible(p) => p.generate_streaming(request).await,
            Provider::Anthropic(p) => p.generate_streaming(request).await,
            Provider::Horde(_) => {
                Err(ProviderError::ApiError("horde does not support streaming".to_string()))
            }
        }
    }

    /// Single-shot, non-streaming generation. The only entry point for
    /// horde; also usable against the other providers directly.
    pub async fn generate(&self, request: GenerationRequest<'_>) -> Result<GenerationChunk, ProviderError> {
        match self {
            Provider::OpenAiCompatible(p) => p.generate(request).await,
            Provider::Anthropic(p) => p.generate(request).await,
            Provider::Horde(p) => p.generate(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_errors() {
        assert!(matches!(classify_error("401 Unauthorized"), ProviderError::AuthError(_)));
    }

    #[test]
    fn classifies_rate_limit_errors() {
        assert!(matches!(classify_error("429 rate limit exceeded"), ProviderError::RateLimit(_)));
    }

    #[test]
    fn classifies_model_not_found() {
        assert!(matches!(
            classify_error("model 'x' not found"),
            ProviderError::ModelNotFound(_)
        ));
    }

    #[test]
    fn defaults_to_api_error() {
        assert!(matches!(classify_error("something odd happened"), ProviderError::ApiError(_)));
    }

    #[test]
    fn drain_sse_lines_extracts_data_payloads_across_chunks() {
        let mut buffer = String::new();
        let first = drain_sse_lines(&mut buffer, "data: {\"a\":1}\n\nda");
        assert_eq!(first, vec!["{\"a\":1}".to_string()]);
        let second = drain_sse_lines(&mut buffer, "ta: [DONE]\n");
        assert_eq!(second, vec!["[DONE]".to_string()]);
    }
}
