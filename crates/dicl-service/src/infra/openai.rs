//! OpenAI-compatible HTTP providers
//!
//! Both providers speak the public `/v1/embeddings` and `/v1/chat/completions`
//! wire formats, so any compatible server (vLLM, Ollama, a local proxy) works
//! through `api_base`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use dicl_common::{DiclError, EmbeddingError, Result};

use crate::config::JsonMode;
use crate::infra::embedding::EmbeddingProvider;
use crate::infra::generation::{GenerationProvider, GenerationRequest, GenerationResponse, Usage};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Default environment variable holding the API key
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

fn resolve_api_key(api_key_env: Option<&str>) -> Result<String> {
    let var = api_key_env.unwrap_or(DEFAULT_API_KEY_ENV);
    std::env::var(var)
        .map_err(|_| DiclError::Config(format!("environment variable `{var}` is not set")))
}

fn endpoint(api_base: &Option<String>, path: &str) -> String {
    let base = api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
    format!("{}/{}", base.trim_end_matches('/'), path)
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiError>(body) {
        Ok(parsed) => format!("provider error ({}): {}", status, parsed.error.message),
        Err(_) => format!("provider error ({}): {}", status, body),
    }
}

/// Embedding model served by an OpenAI-compatible API
pub struct OpenAiEmbedding {
    client: Client,
    api_key: String,
    model: String,
    dimension: usize,
    url: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    dimensions: usize,
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl OpenAiEmbedding {
    pub fn new(client: Client, api_key: String, model: String, dimension: usize, api_base: Option<String>) -> Self {
        Self {
            client,
            api_key,
            model,
            dimension,
            url: endpoint(&api_base, "embeddings"),
        }
    }

    /// Build from configuration; a missing API key is a configuration error
    pub fn from_settings(
        client: Client,
        model: String,
        dimension: usize,
        api_base: Option<String>,
        api_key_env: Option<&str>,
    ) -> Result<Self> {
        let api_key = resolve_api_key(api_key_env)?;
        Ok(Self::new(client, api_key, model, dimension, api_base))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: vec![text],
            dimensions: self.dimension,
            encoding_format: "float",
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    EmbeddingError::Unavailable
                } else {
                    EmbeddingError::ApiError(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EmbeddingError::RateLimited);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(EmbeddingError::Unavailable);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiError(describe_failure(status, &body)));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::ApiError(format!("Failed to parse response: {}", e)))?;

        parsed
            .data
            .into_iter()
            .min_by_key(|d| d.index)
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::ApiError("response contained no embeddings".to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> String {
        format!("openai::{}", self.model)
    }
}

/// Chat model served by an OpenAI-compatible API
pub struct OpenAiChatProvider {
    client: Client,
    api_key: String,
    model: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl OpenAiChatProvider {
    pub fn new(client: Client, api_key: String, model: String, api_base: Option<String>) -> Self {
        Self {
            client,
            api_key,
            model,
            url: endpoint(&api_base, "chat/completions"),
        }
    }

    pub fn from_settings(
        client: Client,
        model: String,
        api_base: Option<String>,
        api_key_env: Option<&str>,
    ) -> Result<Self> {
        let api_key = resolve_api_key(api_key_env)?;
        Ok(Self::new(client, api_key, model, api_base))
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            messages.push(json!({"role": message.role.to_string(), "content": message.content}));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(seed) = request.seed {
            body["seed"] = json!(seed);
        }

        match (request.json_mode, &request.output_schema) {
            (JsonMode::Off, _) => {}
            (JsonMode::Strict, Some(schema)) => {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": {"name": "response", "strict": true, "schema": schema},
                });
            }
            _ => {
                body["response_format"] = json!({"type": "json_object"});
            }
        }

        body
    }
}

#[async_trait]
impl GenerationProvider for OpenAiChatProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| DiclError::Generation(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(DiclError::Config(describe_failure(status, &body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiclError::Generation(describe_failure(status, &body)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| DiclError::Generation(format!("Failed to parse response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(GenerationResponse {
            content,
            usage,
            latency: Duration::ZERO,
        })
    }

    fn model_id(&self) -> String {
        format!("openai::{}", self.model)
    }
}
