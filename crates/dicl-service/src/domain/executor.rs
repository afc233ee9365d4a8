//! Variant Executor
//!
//! Runs one inference request through a configured variant.
//!
//! A DICL request moves through
//! `Received -> Embedding -> Retrieving -> Composing -> Generating -> Complete`;
//! any stage can end in `Failed`. A zero-shot (`chat_completion`) request skips
//! the embedding and retrieval stages.
//!
//! When the query cannot be embedded and the variant allows it, the request
//! continues with an empty example set. That degradation is always reported on
//! the response so evaluation is never silently skewed.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use dicl_common::{DiclError, ExampleId};

use super::composition::ComposedPrompt;
use super::example::{Input, PartitionKey, ScoredExample};
use super::retrieval::ExampleRetriever;
use super::schema::OutputSchema;
use crate::config::{ChatCompletionConfig, DiclVariantConfig, JsonMode, VariantConfig};
use crate::infra::generation::{GenerationRequest, ModelTable, Usage};
use crate::infra::history::OutputKind;

/// Request lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStage {
    Received,
    Embedding,
    Retrieving,
    Composing,
    Generating,
    Complete,
    Failed,
}

impl InferenceStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InferenceStage::Complete | InferenceStage::Failed)
    }
}

impl std::fmt::Display for InferenceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InferenceStage::Received => "received",
            InferenceStage::Embedding => "embedding",
            InferenceStage::Retrieving => "retrieving",
            InferenceStage::Composing => "composing",
            InferenceStage::Generating => "generating",
            InferenceStage::Complete => "complete",
            InferenceStage::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// A request failure and the stage it happened in
#[derive(Debug, Error)]
#[error("inference failed while {stage}: {source}")]
pub struct StageError {
    pub stage: InferenceStage,
    #[source]
    pub source: DiclError,
}

impl StageError {
    pub fn new(stage: InferenceStage, source: DiclError) -> Self {
        Self { stage, source }
    }

    /// The same request may succeed if tried again
    pub fn is_retriable(&self) -> bool {
        self.source.is_retriable()
    }

    /// The request will keep failing until configuration changes
    pub fn is_configuration(&self) -> bool {
        self.source.is_configuration()
    }
}

/// Model output in the function's shape
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InferenceOutput {
    Chat {
        content: String,
    },
    /// `parsed` is `None` when the raw text failed schema validation
    Json {
        raw: String,
        parsed: Option<Value>,
    },
}

impl InferenceOutput {
    /// Text the model produced
    pub fn raw_text(&self) -> &str {
        match self {
            InferenceOutput::Chat { content } => content,
            InferenceOutput::Json { raw, .. } => raw,
        }
    }

    /// Stored form, compatible with the history tables
    pub fn to_stored(&self) -> String {
        match self {
            InferenceOutput::Chat { content } => {
                serde_json::json!([{"type": "text", "text": content}]).to_string()
            }
            InferenceOutput::Json { raw, parsed } => {
                serde_json::json!({"raw": raw, "parsed": parsed}).to_string()
            }
        }
    }
}

/// Result of one completed request
#[derive(Debug, Clone, Serialize)]
pub struct VariantResponse {
    pub variant_name: String,
    pub output: InferenceOutput,
    /// False when the output failed the function's schema; the output is still returned
    pub valid_output: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub schema_errors: Vec<String>,
    pub examples_retrieved: usize,
    /// Set whenever the prompt carried no examples, whatever the reason
    pub no_examples_retrieved: bool,
    /// Why retrieval was skipped, if it was
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retrieved_ids: Vec<ExampleId>,
    pub usage: Usage,
    /// Stages visited, in order
    pub stages: Vec<InferenceStage>,
}

/// What the executor needs to know about the function being served
#[derive(Debug, Clone, Copy)]
pub struct FunctionContext<'a> {
    pub name: &'a str,
    pub kind: OutputKind,
    pub schema: Option<&'a OutputSchema>,
}

/// Records stage transitions for one request
struct StageTracker {
    current: InferenceStage,
    visited: Vec<InferenceStage>,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            current: InferenceStage::Received,
            visited: vec![InferenceStage::Received],
        }
    }

    fn advance(&mut self, next: InferenceStage) {
        debug!(from = %self.current, to = %next, "Stage transition");
        self.current = next;
        self.visited.push(next);
    }

    fn fail(&self, source: DiclError) -> StageError {
        warn!(stage = %self.current, error = %source, "Inference failed");
        StageError::new(self.current, source)
    }

    fn finish(mut self) -> Vec<InferenceStage> {
        self.advance(InferenceStage::Complete);
        self.visited
    }
}

/// Executes variants against the retriever and the generation models
#[derive(Clone)]
pub struct VariantExecutor {
    retriever: ExampleRetriever,
    models: Arc<ModelTable>,
}

impl VariantExecutor {
    pub fn new(retriever: ExampleRetriever, models: Arc<ModelTable>) -> Self {
        Self { retriever, models }
    }

    pub fn retriever(&self) -> &ExampleRetriever {
        &self.retriever
    }

    /// Serve one request with the given variant
    #[instrument(skip_all, fields(function = %function.name, variant = %variant_name))]
    pub async fn execute(
        &self,
        function: FunctionContext<'_>,
        variant_name: &str,
        variant: &VariantConfig,
        input: &Input,
    ) -> Result<VariantResponse, StageError> {
        match variant {
            VariantConfig::Dicl(config) => self.execute_dicl(function, variant_name, config, input).await,
            VariantConfig::ChatCompletion(config) => {
                self.execute_chat_completion(function, variant_name, config, input).await
            }
        }
    }

    async fn execute_dicl(
        &self,
        function: FunctionContext<'_>,
        variant_name: &str,
        config: &DiclVariantConfig,
        input: &Input,
    ) -> Result<VariantResponse, StageError> {
        let mut tracker = StageTracker::new();

        // Configuration problems surface before any network call
        self.retriever
            .check_metric(config.metric)
            .map_err(|e| tracker.fail(e))?;
        let model = self.models.get(&config.model).map_err(|e| tracker.fail(e))?;
        let embedder = self
            .retriever
            .embeddings()
            .client(&config.embedding_model)
            .map_err(|e| tracker.fail(e))?
            .clone();
        let query_text = input.canonical().map_err(|e| tracker.fail(e))?;
        let partition = PartitionKey::new(function.name, variant_name, &config.namespace);
        self.retriever
            .check_dimension(&partition, embedder.dimension())
            .await
            .map_err(|e| tracker.fail(e))?;

        tracker.advance(InferenceStage::Embedding);
        let (examples, fallback_reason) = match embedder.embed(&query_text).await {
            Ok(embedding) => {
                tracker.advance(InferenceStage::Retrieving);
                let examples = self
                    .retriever
                    .retrieve_by_embedding(&partition, embedding, config.k)
                    .await
                    .map_err(|e| tracker.fail(e))?;
                (examples, None)
            }
            Err(e) if config.fallback_to_zero_shot => {
                warn!(error = %e, "Query embedding failed, continuing without examples");
                (Vec::new(), Some(format!("embedding failed: {e}")))
            }
            Err(e) => return Err(tracker.fail(e.into())),
        };

        tracker.advance(InferenceStage::Composing);
        let prompt = ComposedPrompt::with_examples(config.system_instructions.as_deref(), &examples, input)
            .map_err(|e| tracker.fail(e))?;

        let mut request = prompt.into_request().with_params(&config.params);
        if config.strict_output && function.kind == OutputKind::Json {
            request.json_mode = JsonMode::Strict;
        }
        let request = attach_schema(request, function);

        tracker.advance(InferenceStage::Generating);
        let response = model
            .generate(&request, config.retries)
            .await
            .map_err(|e| tracker.fail(e))?;

        let (output, schema_errors) = shape_output(function, response.content);
        let retrieved_ids: Vec<ExampleId> = examples.iter().map(|e| e.example.id).collect();
        log_retrieval(&examples);

        Ok(VariantResponse {
            variant_name: variant_name.to_string(),
            valid_output: schema_errors.is_empty(),
            schema_errors,
            output,
            examples_retrieved: examples.len(),
            no_examples_retrieved: examples.is_empty(),
            fallback_reason,
            retrieved_ids,
            usage: response.usage,
            stages: tracker.finish(),
        })
    }

    async fn execute_chat_completion(
        &self,
        function: FunctionContext<'_>,
        variant_name: &str,
        config: &ChatCompletionConfig,
        input: &Input,
    ) -> Result<VariantResponse, StageError> {
        let mut tracker = StageTracker::new();
        let model = self.models.get(&config.model).map_err(|e| tracker.fail(e))?;

        tracker.advance(InferenceStage::Composing);
        let prompt = ComposedPrompt::zero_shot(config.system_instructions.as_deref(), input);
        let request = attach_schema(prompt.into_request().with_params(&config.params), function);

        tracker.advance(InferenceStage::Generating);
        let response = model
            .generate(&request, config.retries)
            .await
            .map_err(|e| tracker.fail(e))?;

        let (output, schema_errors) = shape_output(function, response.content);

        Ok(VariantResponse {
            variant_name: variant_name.to_string(),
            valid_output: schema_errors.is_empty(),
            schema_errors,
            output,
            examples_retrieved: 0,
            no_examples_retrieved: true,
            fallback_reason: None,
            retrieved_ids: Vec::new(),
            usage: response.usage,
            stages: tracker.finish(),
        })
    }
}

fn attach_schema(request: GenerationRequest, function: FunctionContext<'_>) -> GenerationRequest {
    if request.json_mode == JsonMode::Off {
        return request;
    }
    request.with_output_schema(function.schema.map(|s| s.document().clone()))
}

/// Wrap raw model text in the function's output shape and validate it
fn shape_output(function: FunctionContext<'_>, content: String) -> (InferenceOutput, Vec<String>) {
    match (function.kind, function.schema) {
        (OutputKind::Json, Some(schema)) => {
            let validation = schema.validate_raw(&content);
            let errors = validation.error.map(|e| e.messages).unwrap_or_default();
            if !errors.is_empty() {
                info!(errors = errors.len(), "Output failed schema validation");
            }
            (
                InferenceOutput::Json {
                    raw: content,
                    parsed: validation.parsed,
                },
                errors,
            )
        }
        (OutputKind::Json, None) => {
            let parsed = serde_json::from_str(content.trim()).ok();
            let errors = if parsed.is_some() {
                Vec::new()
            } else {
                vec!["output is not valid JSON".to_string()]
            };
            (InferenceOutput::Json { raw: content, parsed }, errors)
        }
        (OutputKind::Chat, _) => (InferenceOutput::Chat { content }, Vec::new()),
    }
}

fn log_retrieval(examples: &[ScoredExample]) {
    if let (Some(first), Some(last)) = (examples.first(), examples.last()) {
        debug!(
            count = examples.len(),
            nearest = first.similarity,
            farthest = last.similarity,
            "Composed prompt with examples"
        );
    }
}
