//! Backend d'analyse HTTP compatible OpenAI (`/v1/chat/completions`, sonde `/v1/models`).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::gateway::{AnalysisBackend, InferError};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct HttpAnalysisBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpAnalysisBackend {
    pub fn new(cfg: &LlmConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn infer(&self, prompt: &str, content: &str, timeout: Duration) -> Result<String, InferError> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": format!("{prompt}\n\nLOG CONTENT:\n---\n{content}\n---")},
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": false,
        });

        let response = self
            .request(self.client.post(&url))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferError(format!("request timeout after {}s", timeout.as_secs()))
                } else {
                    InferError(format!("request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(InferError(format!("HTTP {} from analysis backend", response.status())));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| InferError(format!("invalid completion payload: {e}")))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| InferError("empty completion".into()))
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/v1/models", self.endpoint);
        match self.request(self.client.get(&url)).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
