//! DICL service handle
//!
//! Owns every collaborator the operations need and is passed explicitly to the
//! REST layer and the binary. Nothing here is global: two services built from
//! two configurations never share a gate, a cache or a store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use dicl_common::{DiclError, Result};

use crate::config::{
    DiclConfig, DiclVariantConfig, FunctionConfig, HistoryKind, MetricLevel, MetricType, PopulationJob,
    StoreKind, VariantConfig,
};
use crate::domain::example::{canonical_json, Example, Input, PartitionKey, ScoredExample};
use crate::domain::executor::{
    FunctionContext, InferenceStage, StageError, VariantExecutor, VariantResponse,
};
use crate::domain::population::{PopulationPipeline, PopulationPlan, PopulationReport};
use crate::domain::retrieval::ExampleRetriever;
use crate::domain::schema::OutputSchema;
use crate::infra::embedding::EmbeddingGateway;
use crate::infra::example_store::{ExampleStore, InMemoryExampleStore, PartitionStats};
use crate::infra::feedback::{
    FeedbackDispatcher, FeedbackRequest, FeedbackSink, GatewayFeedbackClient, DEMONSTRATION_METRIC,
};
use crate::infra::generation::ModelTable;
use crate::infra::history::{
    ClickHouseHistory, HistorySink, HistorySource, InMemoryHistory, InferenceRecord, OutputKind,
};
use crate::infra::redis_store::RedisExampleStore;

/// Inference request accepted by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub function_name: String,
    /// Pin a variant; otherwise one is sampled by weight
    #[serde(default)]
    pub variant_name: Option<String>,
    #[serde(default)]
    pub episode_id: Option<Uuid>,
    pub input: Input,
    /// Serve the request without recording it
    #[serde(default)]
    pub dryrun: bool,
}

/// Inference result returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResponse {
    pub inference_id: Uuid,
    pub episode_id: Uuid,
    #[serde(flatten)]
    pub response: VariantResponse,
}

/// Collaborators a service is built from
pub struct ServiceParts {
    pub store: Arc<dyn ExampleStore>,
    pub embeddings: Arc<EmbeddingGateway>,
    pub models: Arc<ModelTable>,
    pub history: Arc<dyn HistorySource>,
    pub history_sink: Option<Arc<dyn HistorySink>>,
    pub feedback_sinks: Vec<Arc<dyn FeedbackSink>>,
}

impl ServiceParts {
    /// Build every collaborator named by the configuration
    pub async fn from_config(config: &DiclConfig) -> Result<Self> {
        let http = reqwest::Client::new();
        let embeddings = Arc::new(EmbeddingGateway::from_config(&config.embedding_models, http.clone())?);
        let models = Arc::new(ModelTable::from_config(&config.models, http)?);

        let store: Arc<dyn ExampleStore> = match config.store.kind {
            StoreKind::Memory => Arc::new(InMemoryExampleStore::new(config.store.metric)),
            StoreKind::Redis => {
                let url = config.store.redis_url.as_deref().ok_or_else(|| {
                    DiclError::Config("`store.redis_url` is required for the redis store".to_string())
                })?;
                Arc::new(
                    RedisExampleStore::new(url, config.store.metric)
                        .await?
                        .with_prefix(&config.store.prefix),
                )
            }
        };

        let mut feedback_sinks: Vec<Arc<dyn FeedbackSink>> = Vec::new();
        if let Some(gateway) = GatewayFeedbackClient::from_settings(&config.gateway)? {
            feedback_sinks.push(Arc::new(gateway));
        }

        let (history, history_sink): (Arc<dyn HistorySource>, Option<Arc<dyn HistorySink>>) =
            match config.history.kind {
                HistoryKind::Memory => {
                    let memory = Arc::new(InMemoryHistory::new());
                    feedback_sinks.push(memory.clone());
                    (memory.clone(), Some(memory))
                }
                HistoryKind::Clickhouse => (Arc::new(ClickHouseHistory::from_settings(&config.history)?), None),
            };

        Ok(Self {
            store,
            embeddings,
            models,
            history,
            history_sink,
            feedback_sinks,
        })
    }
}

/// The DICL service
pub struct DiclService {
    config: Arc<DiclConfig>,
    schemas: HashMap<String, OutputSchema>,
    executor: VariantExecutor,
    pipeline: PopulationPipeline,
    store: Arc<dyn ExampleStore>,
    embeddings: Arc<EmbeddingGateway>,
    history_sink: Option<Arc<dyn HistorySink>>,
    feedback: FeedbackDispatcher,
}

impl DiclService {
    /// Validate configuration and wire the given collaborators
    pub fn new(config: DiclConfig, parts: ServiceParts) -> Result<Self> {
        config.validate()?;

        let mut schemas = HashMap::new();
        for (name, function) in &config.functions {
            if let Some(schema) = function.output_schema() {
                schemas.insert(name.clone(), OutputSchema::parse(schema)?);
            }
        }

        let retriever = ExampleRetriever::new(parts.store.clone(), parts.embeddings.clone());
        for function in config.functions.values() {
            for variant in function.variants().values() {
                if let VariantConfig::Dicl(dicl) = variant {
                    retriever.check_metric(dicl.metric)?;
                }
            }
        }

        Ok(Self {
            executor: VariantExecutor::new(retriever, parts.models),
            pipeline: PopulationPipeline::new(parts.history, parts.embeddings.clone(), parts.store.clone()),
            store: parts.store,
            embeddings: parts.embeddings,
            history_sink: parts.history_sink,
            feedback: FeedbackDispatcher::new(parts.feedback_sinks),
            schemas,
            config: Arc::new(config),
        })
    }

    /// Build the service and every collaborator from configuration
    pub async fn from_config(config: DiclConfig) -> Result<Self> {
        let parts = ServiceParts::from_config(&config).await?;
        Self::new(config, parts)
    }

    pub fn config(&self) -> &DiclConfig {
        &self.config
    }

    fn function_context<'a>(&'a self, name: &'a str, function: &FunctionConfig) -> FunctionContext<'a> {
        FunctionContext {
            name,
            kind: OutputKind::from(function),
            schema: self.schemas.get(name),
        }
    }

    fn dicl_variant(&self, function_name: &str, variant_name: &str) -> Result<&DiclVariantConfig> {
        match self.config.function(function_name)?.variant(variant_name) {
            Some(VariantConfig::Dicl(dicl)) => Ok(dicl),
            Some(_) => Err(DiclError::Config(format!(
                "variant `{variant_name}` of function `{function_name}` is not a dicl variant"
            ))),
            None => Err(DiclError::NotFound(format!(
                "variant `{variant_name}` of function `{function_name}`"
            ))),
        }
    }

    /// Serve one inference request
    #[instrument(skip(self, request), fields(function = %request.function_name))]
    pub async fn infer(&self, request: InferenceRequest) -> std::result::Result<InferenceResponse, StageError> {
        let received = |e: DiclError| StageError::new(InferenceStage::Received, e);

        let function = self.config.function(&request.function_name).map_err(received)?;
        let (variant_name, variant) =
            select_variant(function.variants(), request.variant_name.as_deref(), &mut rand::thread_rng())
                .map_err(received)?;

        let context = self.function_context(&request.function_name, function);
        let response = self
            .executor
            .execute(context, variant_name, variant, &request.input)
            .await?;

        let inference_id = Uuid::now_v7();
        let episode_id = request.episode_id.unwrap_or_else(Uuid::now_v7);

        if !request.dryrun {
            if let Some(sink) = &self.history_sink {
                let record = InferenceRecord {
                    id: inference_id,
                    episode_id,
                    function_name: request.function_name.clone(),
                    variant_name: variant_name.clone(),
                    input: request.input.canonical().map_err(received)?,
                    output: response.output.to_stored(),
                };
                if let Err(e) = sink.record_inference(record).await {
                    warn!(%inference_id, error = %e, "Failed to record inference");
                }
            }
        }

        info!(
            %inference_id,
            variant = %variant_name,
            examples = response.examples_retrieved,
            valid_output = response.valid_output,
            "Inference complete"
        );

        Ok(InferenceResponse {
            inference_id,
            episode_id,
            response,
        })
    }

    /// Accept feedback for delivery
    ///
    /// Checks happen now; delivery runs in the background. The returned handles
    /// may be awaited or dropped.
    pub fn feedback(&self, mut request: FeedbackRequest) -> Result<Vec<JoinHandle<()>>> {
        if request.metric_name == DEMONSTRATION_METRIC {
            if request.inference_id.is_none() {
                return Err(DiclError::Config("demonstrations must target an inference".to_string()));
            }
            request.episode_id = None;
        } else {
            let metric = self.config.metric(&request.metric_name)?;
            let type_ok = match metric.metric_type {
                MetricType::Float => request.value.is_number(),
                MetricType::Boolean => request.value.is_boolean(),
            };
            if !type_ok {
                return Err(DiclError::Config(format!(
                    "metric `{}` expects a {} value",
                    request.metric_name,
                    match metric.metric_type {
                        MetricType::Float => "float",
                        MetricType::Boolean => "boolean",
                    }
                )));
            }
            let target_ok = match metric.level {
                MetricLevel::Inference => request.inference_id.is_some(),
                MetricLevel::Episode => request.episode_id.is_some(),
            };
            if !target_ok {
                return Err(DiclError::Config(format!(
                    "metric `{}` is {} level and needs a matching id",
                    request.metric_name,
                    match metric.level {
                        MetricLevel::Inference => "inference",
                        MetricLevel::Episode => "episode",
                    }
                )));
            }
            // Sinks receive exactly one target
            match metric.level {
                MetricLevel::Inference => request.episode_id = None,
                MetricLevel::Episode => request.inference_id = None,
            }
        }

        if self.feedback.is_empty() {
            warn!(metric = %request.metric_name, "No feedback destination configured, dropping");
            return Ok(Vec::new());
        }
        Ok(self.feedback.dispatch(request))
    }

    /// Nearest examples of a DICL variant's partition for an input
    #[instrument(skip(self, input))]
    pub async fn retrieve(
        &self,
        function_name: &str,
        variant_name: &str,
        namespace: Option<&str>,
        input: &Input,
        k: Option<usize>,
    ) -> Result<Vec<ScoredExample>> {
        let dicl = self.dicl_variant(function_name, variant_name)?;
        let partition = PartitionKey::new(
            function_name,
            variant_name,
            namespace.unwrap_or(&dicl.namespace),
        );
        self.executor
            .retriever()
            .retrieve(&partition, &input.canonical()?, k.unwrap_or(dicl.k), &dicl.embedding_model)
            .await
    }

    /// Write examples directly
    pub async fn upsert(&self, examples: Vec<Example>) -> Result<usize> {
        self.store.upsert(examples).await
    }

    /// Embed and store one accepted (input, output) pair
    #[instrument(skip(self, input, output))]
    pub async fn ingest_demonstration(
        &self,
        function_name: &str,
        variant_name: &str,
        namespace: Option<&str>,
        input: &Input,
        output: &Value,
    ) -> Result<Example> {
        let dicl = self.dicl_variant(function_name, variant_name)?;
        let kind = OutputKind::from(self.config.function(function_name)?);

        let output = match (kind, output) {
            (OutputKind::Chat, Value::String(text)) => text.clone(),
            (OutputKind::Chat, _) => {
                return Err(DiclError::Config("chat demonstrations must be text".to_string()))
            }
            (OutputKind::Json, value) => canonical_json(value),
        };

        let canonical = input.canonical()?;
        let embedding = self.embeddings.embed(&dicl.embedding_model, &canonical).await?;
        let partition = PartitionKey::new(
            function_name,
            variant_name,
            namespace.unwrap_or(&dicl.namespace),
        );
        let example = Example::new(&partition, canonical, output, embedding);
        self.store.upsert(vec![example.clone()]).await?;

        info!(id = %example.id, partition = %partition, "Ingested demonstration");
        Ok(example)
    }

    /// Run one population job
    pub async fn populate(&self, job: &PopulationJob) -> Result<PopulationReport> {
        let plan = PopulationPlan::from_job(&self.config, job)?;
        self.pipeline.run(&plan).await
    }

    /// Run every configured population job in order
    pub async fn populate_all(&self) -> Result<Vec<PopulationReport>> {
        let mut reports = Vec::with_capacity(self.config.population.len());
        for job in &self.config.population {
            reports.push(self.populate(job).await?);
        }
        Ok(reports)
    }

    pub async fn partition_stats(&self, partition: &PartitionKey) -> Result<PartitionStats> {
        self.store.partition_stats(partition).await
    }
}

/// Pick the variant to serve
///
/// A pinned name must exist. Otherwise variants are sampled by weight; when no
/// variant declares a weight, all are equally likely. Zero-weight variants are
/// only ever served when pinned.
pub fn select_variant<'a, R: Rng>(
    variants: &'a BTreeMap<String, VariantConfig>,
    pinned: Option<&str>,
    rng: &mut R,
) -> Result<(&'a String, &'a VariantConfig)> {
    if let Some(name) = pinned {
        return variants
            .get_key_value(name)
            .ok_or_else(|| DiclError::NotFound(format!("variant `{name}`")));
    }

    let any_weighted = variants.values().any(|v| v.weight().is_some());
    let weighted: Vec<(&String, &VariantConfig, f64)> = variants
        .iter()
        .map(|(name, variant)| {
            let weight = if any_weighted {
                variant.weight().unwrap_or(0.0)
            } else {
                1.0
            };
            (name, variant, weight)
        })
        .filter(|(_, _, weight)| *weight > 0.0)
        .collect();

    let total: f64 = weighted.iter().map(|(_, _, w)| w).sum();
    if weighted.is_empty() || total <= 0.0 {
        return Err(DiclError::NotFound("no variant is selectable by weight".to_string()));
    }

    let mut point = rng.gen::<f64>() * total;
    for (name, variant, weight) in &weighted {
        if point < *weight {
            return Ok((name, variant));
        }
        point -= weight;
    }

    let (name, variant, _) = weighted[weighted.len() - 1];
    Ok((name, variant))
}
