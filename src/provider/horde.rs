//! AI-Horde polling-queue provider. No token streaming: submit,
//! poll, fetch. Also exposes the worker/model discovery operations
//! the orchestrator uses to auto-select models and size the dynamic
//! context budget.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{Capabilities, GenerationChunk, GenerationRequest, ProviderError, classify_error};
use crate::storage::ApiConfig;

const ANONYMOUS_KEY: &str = "0000000000";
const POLL_INTERVAL: Duration = Duration::from_millis(2000);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const MODEL_CACHE_TTL: Duration = Duration::from_secs(300);

const BLOCKLIST: &[&str] = &["tinyllama", "debug", "-1b", "-270m", "test"];
const ALLOWLIST: &[&str] =
    &["llama-3", "mistral", "mixtral", "qwen2.5", "deepseek", "gemma", "magnum"];

#[derive(Debug, Clone, Deserialize)]
pub struct HordeModel {
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub eta: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HordeWorker {
    pub id: String,
    pub name: String,
    pub online: bool,
    pub models: Vec<String>,
    pub max_context_length: u32,
}

struct ModelCache {
    models: Vec<HordeModel>,
    fetched_at: std::time::Instant,
}

pub struct HordeProvider {
    config: ApiConfig,
    client: reqwest::Client,
    model_cache: Mutex<Option<ModelCache>>,
}

impl HordeProvider {
    pub fn new(config: ApiConfig) -> Self {
        Self { config, client: reqwest::Client::new(), model_cache: Mutex::new(None) }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: false,
            reasoning: false,
            vision_api: false,
            max_context_window: 8192,
            requires_polling: true,
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or("https://aihorde.net/api/v2")
    }

    fn api_key(&self) -> &str {
        if self.config.api_key.is_empty() { ANONYMOUS_KEY } else { &self.config.api_key }
    }

    /// Validates the config fields this provider actually needs.
    /// `api_key` may be empty — anonymous horde usage falls back to
    /// [`ANONYMOUS_KEY`].
    pub fn validate_config(&self) -> Result<(), ProviderError> {
        if self.config.model.is_empty() {
            return Err(ProviderError::ApiError("missing model".to_string()));
        }
        Ok(())
    }

    /// Horde has no token stream; this runs the submit/poll/fetch
    /// protocol to completion and returns it as a single finished chunk.
    pub async fn generate(
        &self,
        request: GenerationRequest<'_>,
    ) -> Result<GenerationChunk, ProviderError> {
        let text = self.generate_blocking(&request).await?;
        Ok(GenerationChunk { reasoning: None, content: Some(text), finished: true })
    }

    /// Runs the full submit/poll/fetch protocol to completion and
    /// returns the generated text, leading newlines stripped.
    async fn generate_blocking(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError> {
        let prompt = format!("{}\n\n{}", request.system_prompt, request.user_prompt);
        let body = json!({
            "prompt": prompt,
            "params": {
                "max_length": request.settings.max_tokens,
                "max_context_length": request.settings.max_context_tokens,
                "temperature": request.settings.temperature,
                "rep_pen": 1.1,
                "rep_pen_range": 320,
                "sampler_order": [6, 0, 1, 3, 4, 2, 5],
                "use_default_badwordsids": false,
                "stop_sequence": request.settings.stop_sequences,
            },
            "models": [self.config.model.clone()],
            "workers": self.config.worker_filters.workers,
            "trusted_workers": self.config.worker_filters.trusted_workers,
            "slow_workers": self.config.worker_filters.slow_workers,
        });

        let submit_url = format!("{}/generate/text/async", self.base_url());
        let response = self
            .client
            .post(&submit_url)
            .header("apikey", self.api_key())
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(&format!("{status}: {text}")));
        }
        let submitted: serde_json::Value =
            response.json().await.map_err(|e| ProviderError::ApiError(e.to_string()))?;
        let id = submitted["id"].as_str().ok_or_else(|| ProviderError::ApiError("missing id".into()))?;

        let status_url = format!("{}/generate/text/status/{id}", self.base_url());
        let started = std::time::Instant::now();
        loop {
            if started.elapsed() > DEFAULT_TIMEOUT {
                return Err(ProviderError::Timeout("horde generation exceeded 300s".into()));
            }
            sleep(POLL_INTERVAL).await;
            let status: serde_json::Value = self
                .client
                .get(&status_url)
                .send()
                .await
                .map_err(|e| classify_error(&e.to_string()))?
                .json()
                .await
                .map_err(|e| ProviderError::ApiError(e.to_string()))?;

            if status["faulted"].as_bool().unwrap_or(false) {
                return Err(ProviderError::QueueError("horde generation faulted".into()));
            }
            if status["done"].as_bool().unwrap_or(false) {
                let text = status["generations"][0]["text"].as_str().unwrap_or_default();
                return Ok(text.trim_start_matches('\n').to_string());
            }
        }
    }

    pub async fn get_available_models(&self) -> Result<Vec<HordeModel>, ProviderError> {
        {
            let cache = self.model_cache.lock().await;
            if let Some(entry) = cache.as_ref()
                && entry.fetched_at.elapsed() < MODEL_CACHE_TTL
            {
                return Ok(entry.models.clone());
            }
        }
        let url = format!("{}/status/models", self.base_url());
        let models: Vec<HordeModel> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_error(&e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;

        let mut cache = self.model_cache.lock().await;
        *cache = Some(ModelCache { models: models.clone(), fetched_at: std::time::Instant::now() });
        Ok(models)
    }

    pub async fn get_worker_data(&self) -> Result<Vec<HordeWorker>, ProviderError> {
        let url = format!("{}/workers", self.base_url());
        let workers: Vec<HordeWorker> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_error(&e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;
        Ok(workers.into_iter().filter(|w| w.online).collect())
    }
}

/// Excludes blocklisted names, keeps names matching an allow-pattern,
/// and falls back to the top 3 by worker count if nothing survives.
pub fn auto_select_models(models: &[HordeModel]) -> Vec<String> {
    let filtered: Vec<&HordeModel> = models
        .iter()
        .filter(|m| {
            let lower = m.name.to_lowercase();
            !BLOCKLIST.iter().any(|b| lower.contains(b))
        })
        .collect();

    let allowed: Vec<&HordeModel> = filtered
        .iter()
        .filter(|m| {
            let lower = m.name.to_lowercase();
            ALLOWLIST.iter().any(|a| lower.contains(a))
        })
        .copied()
        .collect();

    if !allowed.is_empty() {
        return allowed.into_iter().map(|m| m.name.clone()).collect();
    }

    let mut sorted = filtered;
    sorted.sort_by(|a, b| b.count.cmp(&a.count));
    sorted.into_iter().take(3).map(|m| m.name.clone()).collect()
}

/// Minimum `max_context_length` among online workers serving any of
/// `model_names`, then derives a character budget from it.
pub fn calculate_dynamic_context_limit(
    workers: &[HordeWorker],
    model_names: &[String],
    max_tokens: u32,
) -> Option<u32> {
    let context_len = workers
        .iter()
        .filter(|w| w.models.iter().any(|m| model_names.contains(m)))
        .map(|w| w.max_context_length)
        .min()?;
    Some(context_len)
}

pub fn max_chars_for_context(context_len: u32, max_tokens: u32) -> usize {
    let chars = context_len as f64 * 3.0 - max_tokens as f64 * 3.5 - 100.0;
    chars.max(1000.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, count: u32) -> HordeModel {
        HordeModel { name: name.to_string(), count, eta: 0 }
    }

    #[test]
    fn auto_select_excludes_blocklisted_names() {
        let models = vec![model("tinyllama-1b", 50), model("llama-3-8b", 10)];
        let selected = auto_select_models(&models);
        assert_eq!(selected, vec!["llama-3-8b".to_string()]);
    }

    #[test]
    fn auto_select_falls_back_to_top_three_by_count() {
        let models = vec![model("foo", 1), model("bar", 10), model("baz", 5), model("qux", 2)];
        let selected = auto_select_models(&models);
        assert_eq!(selected, vec!["bar".to_string(), "baz".to_string(), "qux".to_string()]);
    }

    #[test]
    fn dynamic_context_limit_takes_the_minimum_across_workers() {
        let workers = vec![
            HordeWorker {
                id: "1".into(),
                name: "w1".into(),
                online: true,
                models: vec!["llama-3-8b".into()],
                max_context_length: 8192,
            },
            HordeWorker {
                id: "2".into(),
                name: "w2".into(),
                online: true,
                models: vec!["llama-3-8b".into()],
                max_context_length: 4096,
            },
        ];
        let limit =
            calculate_dynamic_context_limit(&workers, &["llama-3-8b".to_string()], 300).unwrap();
        assert_eq!(limit, 4096);
    }

    #[test]
    fn max_chars_has_a_floor_of_1000() {
        assert_eq!(max_chars_for_context(100, 1000), 1000);
    }

    #[test]
    fn validate_config_allows_an_empty_api_key_but_requires_a_model() {
        let provider = HordeProvider::new(ApiConfig::default());
        assert!(matches!(provider.validate_config(), Err(ProviderError::ApiError(_))));

        let provider =
            HordeProvider::new(ApiConfig { model: "llama-3-8b".to_string(), ..ApiConfig::default() });
        assert!(provider.validate_config().is_ok());
    }
}
