//! DICL configuration
//!
//! Loaded from an optional TOML file layered under `DICL__*` environment
//! overrides. Variants are a closed, tagged set; every cross-reference
//! (models, embedding models, metrics, schemas) is checked at load time so
//! configuration mistakes surface before any network call.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use dicl_common::{
    DiclError, DistanceMetric, DEFAULT_K, DEFAULT_MAX_CONCURRENCY, DEFAULT_NAMESPACE,
    DEFAULT_REQUEST_TIMEOUT_MS,
};

use crate::domain::schema::OutputSchema;

/// Default config file location when `DICL_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/dicl.toml";

/// DICL service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiclConfig {
    /// Service host
    pub host: String,
    /// Service port
    pub port: u16,
    /// External gateway (feedback collaborator)
    pub gateway: GatewaySettings,
    /// Analytical history collaborator
    pub history: HistorySettings,
    /// Example store backend
    pub store: StoreSettings,
    /// Embedding models by name
    pub embedding_models: BTreeMap<String, EmbeddingModelConfig>,
    /// Generation models by name
    pub models: BTreeMap<String, ModelConfig>,
    /// Feedback metrics by name
    pub metrics: BTreeMap<String, MetricConfig>,
    /// Functions by name
    pub functions: BTreeMap<String, FunctionConfig>,
    /// Population jobs run by `dicl-service populate`
    pub population: Vec<PopulationJob>,
}

impl Default for DiclConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            gateway: GatewaySettings::default(),
            history: HistorySettings::default(),
            store: StoreSettings::default(),
            embedding_models: BTreeMap::new(),
            models: BTreeMap::new(),
            metrics: BTreeMap::new(),
            functions: BTreeMap::new(),
            population: Vec::new(),
        }
    }
}

impl DiclConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self> {
        // Try to load .env file
        let _ = dotenvy::dotenv();

        let path = std::env::var("DICL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_sources(
            config::Config::builder()
                .add_source(config::File::with_name(&path).required(false))
                .add_source(config::Environment::with_prefix("DICL").separator("__")),
        )?;

        // PORT takes priority for container platforms
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse::<u16>() {
                cfg.port = p;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let cfg = Self::from_sources(
            config::Config::builder()
                .add_source(config::File::from_str(toml, config::FileFormat::Toml)),
        )?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_sources(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let cfg = builder
            .build()
            .map_err(|e| DiclError::Config(format!("Failed to read configuration: {}", e)))?
            .try_deserialize::<DiclConfig>()
            .map_err(|e| DiclError::Config(format!("Invalid configuration: {}", e)))?;
        Ok(cfg)
    }

    /// Check every cross-reference; configuration-class errors are fatal.
    pub fn validate(&self) -> std::result::Result<(), DiclError> {
        for (name, embedding) in &self.embedding_models {
            if embedding.dimension == 0 {
                return Err(DiclError::Config(format!(
                    "`embedding_models.{name}`: `dimension` must be positive"
                )));
            }
            if embedding.max_concurrency == 0 {
                return Err(DiclError::Config(format!(
                    "`embedding_models.{name}`: `max_concurrency` must be positive"
                )));
            }
        }

        for (function_name, function) in &self.functions {
            if let FunctionConfig::Json { output_schema, .. } = function {
                OutputSchema::parse(output_schema).map_err(|e| {
                    DiclError::Config(format!(
                        "`functions.{function_name}.output_schema`: {e}"
                    ))
                })?;
            }

            for (variant_name, variant) in function.variants() {
                let at = format!("functions.{function_name}.variants.{variant_name}");
                if variant.weight().is_some_and(|w| w < 0.0) {
                    return Err(DiclError::Config(format!(
                        "`{at}`: `weight` must be non-negative"
                    )));
                }
                let max_delay_s = variant.retries().max_delay_s;
                if !max_delay_s.is_finite() || !(0.0..=MAX_RETRY_DELAY_S).contains(&max_delay_s) {
                    return Err(DiclError::Config(format!(
                        "`{at}.retries`: `max_delay_s` must be between 0 and {MAX_RETRY_DELAY_S}"
                    )));
                }
                if !self.models.contains_key(variant.model()) {
                    return Err(DiclError::Config(format!(
                        "`{at}`: unknown model `{}`",
                        variant.model()
                    )));
                }
                if let VariantConfig::Dicl(dicl) = variant {
                    if !self.embedding_models.contains_key(&dicl.embedding_model) {
                        return Err(DiclError::Config(format!(
                            "`{at}`: unknown embedding model `{}`",
                            dicl.embedding_model
                        )));
                    }
                    if dicl.k == 0 {
                        return Err(DiclError::Config(format!("`{at}`: `k` must be at least 1")));
                    }
                    if dicl.metric != self.store.metric {
                        return Err(DiclError::Config(format!(
                            "`{at}`: variant pins metric `{}` but the store ranks by `{}`",
                            dicl.metric, self.store.metric
                        )));
                    }
                }
            }
        }

        for (i, job) in self.population.iter().enumerate() {
            self.resolve_population_target(job)
                .map_err(|e| DiclError::Config(format!("`population[{i}]`: {e}")))?;
            if let Some(filter) = &job.metric {
                self.metric(&filter.metric_name)
                    .map_err(|e| DiclError::Config(format!("`population[{i}]`: {e}")))?;
            }
        }

        Ok(())
    }

    /// Look up a function by name
    pub fn function(&self, name: &str) -> std::result::Result<&FunctionConfig, DiclError> {
        self.functions
            .get(name)
            .ok_or_else(|| DiclError::NotFound(format!("function `{name}`")))
    }

    /// Look up a metric definition by name
    pub fn metric(&self, name: &str) -> std::result::Result<&MetricConfig, DiclError> {
        self.metrics
            .get(name)
            .ok_or_else(|| DiclError::Config(format!("metric `{name}` is not defined")))
    }

    /// Resolve the DICL variant a population job writes into
    pub fn resolve_population_target(
        &self,
        job: &PopulationJob,
    ) -> std::result::Result<&DiclVariantConfig, DiclError> {
        let function = self.function(&job.function_name)?;
        match function.variant(&job.variant_name) {
            Some(VariantConfig::Dicl(dicl)) => Ok(dicl),
            Some(_) => Err(DiclError::Config(format!(
                "variant `{}` of function `{}` is not a dicl variant",
                job.variant_name, job.function_name
            ))),
            None => Err(DiclError::NotFound(format!(
                "variant `{}` of function `{}`",
                job.variant_name, job.function_name
            ))),
        }
    }
}

/// External gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Base URL of the gateway receiving feedback (e.g. http://localhost:3000)
    pub url: Option<String>,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

/// Which analytical history backend to read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    #[default]
    Memory,
    Clickhouse,
}

/// Analytical history settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub kind: HistoryKind,
    /// ClickHouse HTTP endpoint (e.g. http://localhost:8123)
    pub url: Option<String>,
    pub database: String,
    /// Environment variable holding the ClickHouse user, if any
    pub user_env: Option<String>,
    /// Environment variable holding the ClickHouse password, if any
    pub password_env: Option<String>,
    pub timeout_ms: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            kind: HistoryKind::Memory,
            url: None,
            database: "tensorzero".to_string(),
            user_env: None,
            password_env: None,
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

/// Which example store backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
}

/// Example store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub kind: StoreKind,
    /// Redis URL (required for the redis backend)
    pub redis_url: Option<String>,
    /// Key prefix for redis entries
    pub prefix: String,
    /// Similarity metric the store ranks by
    pub metric: DistanceMetric,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            redis_url: None,
            prefix: "dicl".to_string(),
            metric: DistanceMetric::Cosine,
        }
    }
}

/// Provider backing an embedding model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// OpenAI-compatible `/embeddings` endpoint
    Openai,
    /// Deterministic in-process provider for tests and dry runs
    Dummy,
    /// Offline character-trigram hashing
    Hashing,
}

/// Embedding model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingModelConfig {
    pub provider: EmbeddingProviderKind,
    /// Provider-side model id; defaults to the config key
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Embedding dimension
    pub dimension: usize,
    /// L2-normalize vectors before they leave the client
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Bound on outstanding provider calls for this model
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Cached (text -> vector) entries; 0 disables the cache
    #[serde(default)]
    pub cache_size: usize,
}

/// Provider backing a generation model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProviderKind {
    /// OpenAI-compatible `/chat/completions` endpoint
    Openai,
    /// Deterministic in-process provider for tests and dry runs
    Dummy,
}

/// Generation model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ModelProviderKind,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

/// Metric value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Float,
    Boolean,
}

/// Direction in which a metric improves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimize {
    Max,
    Min,
}

/// What a metric's feedback is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricLevel {
    #[default]
    Inference,
    Episode,
}

/// Metric definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub optimize: Optimize,
    #[serde(default)]
    pub level: MetricLevel,
}

/// Function definition: a closed set of output kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FunctionConfig {
    Chat {
        #[serde(default)]
        variants: BTreeMap<String, VariantConfig>,
    },
    Json {
        /// JSON schema document (as JSON text) the output must satisfy
        output_schema: String,
        #[serde(default)]
        variants: BTreeMap<String, VariantConfig>,
    },
}

impl FunctionConfig {
    pub fn variants(&self) -> &BTreeMap<String, VariantConfig> {
        match self {
            FunctionConfig::Chat { variants } => variants,
            FunctionConfig::Json { variants, .. } => variants,
        }
    }

    pub fn variant(&self, name: &str) -> Option<&VariantConfig> {
        self.variants().get(name)
    }

    pub fn output_schema(&self) -> Option<&str> {
        match self {
            FunctionConfig::Chat { .. } => None,
            FunctionConfig::Json { output_schema, .. } => Some(output_schema),
        }
    }
}

/// Variant definition, selected by an explicit `type` tag
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariantConfig {
    /// Zero-shot generation with optional fixed instructions
    ChatCompletion(ChatCompletionConfig),
    /// Retrieval-augmented generation (dynamic in-context learning)
    Dicl(DiclVariantConfig),
}

impl VariantConfig {
    pub fn weight(&self) -> Option<f64> {
        match self {
            VariantConfig::ChatCompletion(c) => c.weight,
            VariantConfig::Dicl(d) => d.weight,
        }
    }

    /// Generation model name
    pub fn model(&self) -> &str {
        match self {
            VariantConfig::ChatCompletion(c) => &c.model,
            VariantConfig::Dicl(d) => &d.model,
        }
    }

    pub fn retries(&self) -> RetryConfig {
        match self {
            VariantConfig::ChatCompletion(c) => c.retries,
            VariantConfig::Dicl(d) => d.retries,
        }
    }
}

/// Zero-shot variant settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionConfig {
    pub model: String,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub system_instructions: Option<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
    #[serde(default)]
    pub retries: RetryConfig,
}

/// Retrieval-augmented variant settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiclVariantConfig {
    /// Embedding model; must be the model the partition was populated with
    pub embedding_model: String,
    /// Generation model
    pub model: String,
    /// Number of examples to retrieve
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub system_instructions: Option<String>,
    /// Request strict structured output from the provider
    #[serde(default)]
    pub strict_output: bool,
    #[serde(default)]
    pub weight: Option<f64>,
    /// Serve zero-shot instead of failing when the query cannot be embedded
    #[serde(default = "default_true")]
    pub fallback_to_zero_shot: bool,
    /// Pinned similarity metric; must match the store
    #[serde(default)]
    pub metric: DistanceMetric,
    #[serde(flatten)]
    pub params: GenerationParams,
    #[serde(default)]
    pub retries: RetryConfig,
}

/// Sampling parameters forwarded to the generation provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub json_mode: JsonMode,
}

/// Structured-output mode requested from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonMode {
    #[default]
    Off,
    On,
    Strict,
}

/// Longest backoff a retry policy may ask for, in seconds
pub const MAX_RETRY_DELAY_S: f32 = 3600.0;

/// Retry policy for generation calls
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub num_retries: u32,
    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            num_retries: 0,
            max_delay_s: default_max_delay_s(),
        }
    }
}

/// How the population pipeline treats overlapping candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupePolicy {
    /// Keep everything, including overlap between metric and demonstration sources
    #[default]
    None,
    /// Drop repeated (input, output) pairs within one run
    WithinRun,
    /// Like `within_run`, and skip source inferences already in the partition
    SkipIngested,
}

/// Metric threshold filter for population
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricFilter {
    pub metric_name: String,
    pub threshold: f64,
}

/// A population job: which history to ingest into which partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationJob {
    pub function_name: String,
    /// Target DICL variant
    pub variant_name: String,
    /// Target namespace; defaults to the variant's namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Only consider inferences produced by this variant
    #[serde(default)]
    pub source_variant: Option<String>,
    #[serde(default)]
    pub metric: Option<MetricFilter>,
    #[serde(default = "default_true")]
    pub include_demonstrations: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub dedupe: DedupePolicy,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_k() -> usize {
    DEFAULT_K
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_max_delay_s() -> f32 {
    10.0
}
