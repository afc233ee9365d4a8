//! Generation model clients
//!
//! A generation provider turns a composed prompt into text. Each configured
//! model gets a gated client that applies the per-call timeout and the
//! variant's retry policy.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use dicl_common::{DiclError, Result};

use crate::config::{
    GenerationParams, JsonMode, ModelConfig, ModelProviderKind, RetryConfig, MAX_RETRY_DELAY_S,
};
use crate::domain::example::Role;
use crate::infra::dummy::DummyGenerationProvider;
use crate::infra::openai::OpenAiChatProvider;

/// Delay before the first retry
const BASE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A plain-text chat message sent to a generation model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Provider-agnostic generation request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u32>,
    pub json_mode: JsonMode,
    /// Schema forwarded to providers that support strict structured output
    pub output_schema: Option<Value>,
}

impl GenerationRequest {
    pub fn new(system: Option<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system,
            messages,
            ..Default::default()
        }
    }

    /// Apply a variant's sampling parameters
    pub fn with_params(mut self, params: &GenerationParams) -> Self {
        self.temperature = params.temperature;
        self.max_tokens = params.max_tokens;
        self.seed = params.seed;
        self.json_mode = params.json_mode;
        self
    }

    pub fn with_output_schema(mut self, schema: Option<Value>) -> Self {
        self.output_schema = schema;
        self
    }
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

/// Raw model output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResponse {
    pub content: String,
    pub usage: Usage,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Trait for generation providers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;

    fn model_id(&self) -> String;
}

/// Gated, time-bounded client for one generation model
pub struct ModelClient {
    name: String,
    provider: Arc<dyn GenerationProvider>,
    gate: Semaphore,
    timeout: Duration,
}

impl ModelClient {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn GenerationProvider>,
        max_concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            gate: Semaphore::new(max_concurrency.max(1)),
            timeout,
        }
    }

    pub fn from_config(name: &str, config: &ModelConfig, http: reqwest::Client) -> Result<Self> {
        let remote_name = config.model_name.clone().unwrap_or_else(|| name.to_string());
        let provider: Arc<dyn GenerationProvider> = match config.provider {
            ModelProviderKind::Openai => Arc::new(OpenAiChatProvider::from_settings(
                http,
                remote_name,
                config.api_base.clone(),
                config.api_key_env.as_deref(),
            )?),
            ModelProviderKind::Dummy => Arc::new(DummyGenerationProvider::new(remote_name)),
        };
        Ok(Self::new(
            name,
            provider,
            config.max_concurrency,
            Duration::from_millis(config.timeout_ms),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn generate_once(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let attempt = async {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| DiclError::Internal("generation gate closed".to_string()))?;
            self.provider.generate(request).await
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DiclError::Timeout(format!(
                "model `{}` did not respond within {}ms",
                self.name,
                self.timeout.as_millis()
            ))),
        }
    }

    /// Generate with exponential backoff on transient failures
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        retries: RetryConfig,
    ) -> Result<GenerationResponse> {
        let started = Instant::now();
        let max_delay = Duration::try_from_secs_f32(retries.max_delay_s.max(0.0))
            .unwrap_or(Duration::from_secs_f32(MAX_RETRY_DELAY_S));
        let mut attempt: u32 = 0;

        loop {
            match self.generate_once(request).await {
                Ok(mut response) => {
                    response.latency = started.elapsed();
                    return Ok(response);
                }
                Err(e) if e.is_retriable() && attempt < retries.num_retries => {
                    let delay = BASE_RETRY_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(max_delay);
                    warn!(
                        model = %self.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Generation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(model = %self.name, attempts = attempt + 1, "Generation failed");
                    return Err(e);
                }
            }
        }
    }
}

/// All configured generation models, keyed by config name
#[derive(Default, Clone)]
pub struct ModelTable {
    clients: HashMap<String, Arc<ModelClient>>,
}

impl ModelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(models: &BTreeMap<String, ModelConfig>, http: reqwest::Client) -> Result<Self> {
        let mut table = Self::new();
        for (name, config) in models {
            table.insert(ModelClient::from_config(name, config, http.clone())?);
        }
        Ok(table)
    }

    pub fn insert(&mut self, client: ModelClient) {
        self.clients.insert(client.name().to_string(), Arc::new(client));
    }

    pub fn with_client(mut self, client: ModelClient) -> Self {
        self.insert(client);
        self
    }

    pub fn get(&self, model: &str) -> Result<&Arc<ModelClient>> {
        self.clients
            .get(model)
            .ok_or_else(|| DiclError::Config(format!("model `{model}` is not configured")))
    }
}
