//! Local inference over an Ollama-compatible `/api/generate` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::InferenceConfig;
use crate::error::LlmError;
use crate::llm::Inference;

const PROVIDER: &str = "ollama";

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct OllamaInference {
    client: Client,
    url: String,
    model: String,
}

impl OllamaInference {
    pub fn new(config: &InferenceConfig) -> Result<Self, LlmError> {
        // Transport-level ceiling; the router applies its own tighter timeout.
        let client = Client::builder()
            .timeout(config.timeout.max(Duration::from_secs(5)) * 2)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        tracing::info!("Using Ollama (model: {}, url: {})", config.model, config.url);
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Inference for OllamaInference {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": max_tokens,
            }
        });

        debug!(model = %self.model, "Calling inference endpoint");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    LlmError::Unavailable
                } else {
                    LlmError::RequestFailed {
                        provider: PROVIDER.into(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("status {status}"),
            });
        }

        let parsed: GenerateResponse =
            resp.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        Ok(parsed.response.trim().to_string())
    }
}
