//! Embedding Gateway Client
//!
//! Turns text into fixed-length vectors through a configured embedding model.
//!
//! Every provider call passes through a counting gate: a permit is taken before
//! the request is issued and dropped when it resolves, on success and error
//! alike. Rate limiting degrades to waiting, bounded by the per-request timeout.
//! Batch calls isolate failures per item and return results in input order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use dicl_common::{l2_normalize, DiclError, EmbeddingError};

use crate::config::{EmbeddingModelConfig, EmbeddingProviderKind};
use crate::infra::dummy::DummyEmbedding;
use crate::infra::openai::OpenAiEmbedding;

/// First wait after a rate-limit response
const RATE_LIMIT_BACKOFF_START: Duration = Duration::from_millis(50);

/// Longest wait between rate-limited attempts
const RATE_LIMIT_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Trait for embedding providers
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Get embedding dimension
    fn dimension(&self) -> usize;

    /// Provider-qualified model id, e.g. `openai::text-embedding-3-small`
    fn model_id(&self) -> String;
}

/// Feature-hashing embedding computed in process
///
/// Lowercased words and byte trigrams are hashed into signed buckets, so texts
/// sharing vocabulary land close together. Needs no network access.
pub struct HashingEmbedding {
    dimension: usize,
}

impl HashingEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let digest = blake3::hash(feature);
        let bytes = digest.as_bytes();
        let bucket = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]) as usize
            % self.dimension;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();

        for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            self.add_feature(&mut vector, word.as_bytes(), 2.0);
        }
        let bytes = lowered.as_bytes();
        if bytes.len() < 3 {
            self.add_feature(&mut vector, bytes, 1.0);
        }
        for trigram in bytes.windows(3) {
            self.add_feature(&mut vector, trigram, 1.0);
        }

        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.vectorize(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> String {
        format!("hashing::blake3-{}", self.dimension)
    }
}

/// Memoizes vectors by exact text in front of another provider
///
/// Entries are never evicted; once `capacity` texts are held new texts pass
/// through uncached.
pub struct CachedEmbedding {
    inner: Arc<dyn EmbeddingProvider>,
    entries: DashMap<String, Vec<f32>>,
    capacity: usize,
}

impl CachedEmbedding {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(hit) = self.entries.get(text) {
            return Ok(hit.value().clone());
        }

        let vector = self.inner.embed(text).await?;
        if self.entries.len() < self.capacity {
            self.entries.insert(text.to_owned(), vector.clone());
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}

/// Per-item result of a batch embedding call
#[derive(Debug, Clone)]
pub struct EmbeddingOutcome {
    /// Position of the text in the submitted batch
    pub index: usize,
    pub embedding: Option<Vec<f32>>,
    pub error: Option<EmbeddingError>,
}

impl EmbeddingOutcome {
    pub fn is_ok(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Gated, time-bounded client for one embedding model
pub struct EmbeddingClient {
    model: String,
    provider: Arc<dyn EmbeddingProvider>,
    gate: Arc<Semaphore>,
    timeout: Duration,
    normalize: bool,
}

impl EmbeddingClient {
    pub fn new(
        model: impl Into<String>,
        provider: Arc<dyn EmbeddingProvider>,
        max_concurrency: usize,
        timeout: Duration,
        normalize: bool,
    ) -> Self {
        Self {
            model: model.into(),
            provider,
            gate: Arc::new(Semaphore::new(max_concurrency.max(1))),
            timeout,
            normalize,
        }
    }

    /// Build a client from its configuration entry
    pub fn from_config(
        name: &str,
        config: &EmbeddingModelConfig,
        http: reqwest::Client,
    ) -> Result<Self, DiclError> {
        let remote_name = config.model_name.clone().unwrap_or_else(|| name.to_string());
        let provider: Arc<dyn EmbeddingProvider> = match config.provider {
            EmbeddingProviderKind::Openai => Arc::new(OpenAiEmbedding::from_settings(
                http,
                remote_name,
                config.dimension,
                config.api_base.clone(),
                config.api_key_env.as_deref(),
            )?),
            EmbeddingProviderKind::Dummy => {
                Arc::new(DummyEmbedding::new(remote_name, config.dimension))
            }
            EmbeddingProviderKind::Hashing => Arc::new(HashingEmbedding::new(config.dimension)),
        };

        let provider: Arc<dyn EmbeddingProvider> = if config.cache_size > 0 {
            Arc::new(CachedEmbedding::new(provider, config.cache_size))
        } else {
            provider
        };

        Ok(Self::new(
            name,
            provider,
            config.max_concurrency,
            Duration::from_millis(config.timeout_ms),
            config.normalize,
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// Embed one text under the gate and the per-request timeout
    ///
    /// The timeout bounds provider calls and rate-limit waits, not time spent
    /// waiting for a gate permit.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }

        // Only provider time and rate-limit waits spend the budget; queueing
        // behind the gate does not
        let mut remaining = self.timeout;
        let mut backoff = RATE_LIMIT_BACKOFF_START;
        let mut embedding = loop {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| EmbeddingError::Unavailable)?;
            let started = Instant::now();
            let result = tokio::time::timeout(remaining, self.provider.embed(text)).await;
            drop(permit);
            remaining = remaining.saturating_sub(started.elapsed());

            match result {
                Err(_) => return Err(self.timed_out()),
                Ok(Err(EmbeddingError::RateLimited)) => {
                    if remaining.is_zero() {
                        return Err(self.timed_out());
                    }
                    let wait = backoff.min(remaining);
                    debug!(model = %self.model, backoff_ms = wait.as_millis() as u64, "Rate limited, waiting");
                    tokio::time::sleep(wait).await;
                    remaining = remaining.saturating_sub(wait);
                    backoff = (backoff * 2).min(RATE_LIMIT_BACKOFF_MAX);
                }
                Ok(other) => break other?,
            }
        };

        let expected = self.provider.dimension();
        if embedding.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }

        if self.normalize {
            l2_normalize(&mut embedding);
        }

        Ok(embedding)
    }

    fn timed_out(&self) -> EmbeddingError {
        EmbeddingError::Timeout(self.timeout.as_millis() as u64)
    }

    /// Embed many texts with at most `max_concurrency` in flight
    ///
    /// The result has one entry per input, in input order, whatever order the
    /// provider calls complete in. A failed item never cancels its siblings.
    #[instrument(skip(self, texts), fields(model = %self.model, count = texts.len()))]
    pub async fn embed_batch(&self, texts: &[String], max_concurrency: usize) -> Vec<EmbeddingOutcome> {
        let batch_gate = Semaphore::new(max_concurrency.max(1));
        let gate = &batch_gate;

        let mut pending: FuturesUnordered<_> = texts
            .iter()
            .enumerate()
            .map(|(index, text)| async move {
                let result = match gate.acquire().await {
                    Ok(_permit) => self.embed(text).await,
                    Err(_) => Err(EmbeddingError::Unavailable),
                };
                (index, result)
            })
            .collect();

        let mut slots: Vec<Option<Result<Vec<f32>, EmbeddingError>>> =
            (0..texts.len()).map(|_| None).collect();
        while let Some((index, result)) = pending.next().await {
            slots[index] = Some(result);
        }

        let outcomes: Vec<EmbeddingOutcome> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                Some(Ok(embedding)) => EmbeddingOutcome {
                    index,
                    embedding: Some(embedding),
                    error: None,
                },
                Some(Err(error)) => EmbeddingOutcome {
                    index,
                    embedding: None,
                    error: Some(error),
                },
                None => EmbeddingOutcome {
                    index,
                    embedding: None,
                    error: Some(EmbeddingError::Unavailable),
                },
            })
            .collect();

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        if failed > 0 {
            warn!(failed, total = outcomes.len(), "Some embeddings failed");
        }

        outcomes
    }
}

/// All configured embedding models, keyed by config name
#[derive(Default, Clone)]
pub struct EmbeddingGateway {
    clients: HashMap<String, Arc<EmbeddingClient>>,
}

impl EmbeddingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured embedding model
    pub fn from_config(
        models: &std::collections::BTreeMap<String, EmbeddingModelConfig>,
        http: reqwest::Client,
    ) -> Result<Self, DiclError> {
        let mut gateway = Self::new();
        for (name, config) in models {
            gateway.insert(EmbeddingClient::from_config(name, config, http.clone())?);
        }
        Ok(gateway)
    }

    /// Register a client under its model name
    pub fn insert(&mut self, client: EmbeddingClient) {
        self.clients
            .insert(client.model().to_string(), Arc::new(client));
    }

    /// Builder-style registration
    pub fn with_client(mut self, client: EmbeddingClient) -> Self {
        self.insert(client);
        self
    }

    /// Look up a model; unknown names are configuration errors
    pub fn client(&self, model: &str) -> Result<&Arc<EmbeddingClient>, DiclError> {
        self.clients
            .get(model)
            .ok_or_else(|| DiclError::Config(format!("embedding model `{model}` is not configured")))
    }

    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, DiclError> {
        Ok(self.client(model)?.embed(text).await?)
    }

    pub async fn embed_batch(
        &self,
        texts: &[String],
        model: &str,
        max_concurrency: usize,
    ) -> Result<Vec<EmbeddingOutcome>, DiclError> {
        let client = self.client(model)?;
        Ok(client.embed_batch(texts, max_concurrency).await)
    }
}
