//! Population Pipeline
//!
//! Batch job that turns historical inferences into retrievable examples.
//!
//! Candidates come from two independent sources:
//! 1. inferences whose latest feedback value for a metric crosses the threshold
//! 2. inferences with a demonstration (the latest one per inference)
//!
//! Every candidate input is embedded with bounded concurrency; candidates that
//! fail to embed are dropped with a warning. Survivors get fresh ids and land
//! in the store as one batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use dicl_common::{DiclError, Result};

use super::example::{canonical_json, Example, PartitionKey};
use crate::config::{DedupePolicy, DiclConfig, MetricConfig, MetricLevel, Optimize, PopulationJob};
use crate::infra::embedding::EmbeddingGateway;
use crate::infra::example_store::ExampleStore;
use crate::infra::history::{
    DemonstrationRecord, FeedbackRecord, HistorySource, InferenceFilter, InferenceRecord, OutputKind,
};

/// Threshold filter resolved against its metric definition
#[derive(Debug, Clone)]
pub struct ResolvedMetric {
    pub metric_name: String,
    pub threshold: f64,
    pub config: MetricConfig,
}

/// A population job with every reference resolved
#[derive(Debug, Clone)]
pub struct PopulationPlan {
    pub partition: PartitionKey,
    pub kind: OutputKind,
    pub embedding_model: String,
    pub source_variant: Option<String>,
    pub metric: Option<ResolvedMetric>,
    pub include_demonstrations: bool,
    pub max_concurrency: usize,
    pub dedupe: DedupePolicy,
}

impl PopulationPlan {
    /// Resolve a job against configuration; fails before any network call
    pub fn from_job(config: &DiclConfig, job: &PopulationJob) -> Result<Self> {
        let function = config.function(&job.function_name)?;
        let target = config.resolve_population_target(job)?;

        let metric = match &job.metric {
            Some(filter) => Some(ResolvedMetric {
                metric_name: filter.metric_name.clone(),
                threshold: filter.threshold,
                config: config.metric(&filter.metric_name)?.clone(),
            }),
            None => None,
        };

        if job.max_concurrency == 0 {
            return Err(DiclError::Config("`max_concurrency` must be positive".to_string()));
        }

        Ok(Self {
            partition: PartitionKey::new(
                &job.function_name,
                &job.variant_name,
                job.namespace.clone().unwrap_or_else(|| target.namespace.clone()),
            ),
            kind: OutputKind::from(function),
            embedding_model: target.embedding_model.clone(),
            source_variant: job.source_variant.clone(),
            metric,
            include_demonstrations: job.include_demonstrations,
            max_concurrency: job.max_concurrency,
            dedupe: job.dedupe,
        })
    }

    fn filter(&self) -> InferenceFilter {
        InferenceFilter {
            function_name: self.partition.function_name.clone(),
            kind: self.kind,
            variant_name: self.source_variant.clone(),
        }
    }
}

/// Counts from one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PopulationReport {
    pub partition: Option<PartitionKey>,
    /// Candidates whose latest metric value passed the threshold
    pub metric_candidates: usize,
    /// Candidates sourced from demonstrations
    pub demonstration_candidates: usize,
    /// Candidates whose stored output could not be read
    pub unreadable: usize,
    pub duplicates_skipped: usize,
    pub embedding_failures: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateSource {
    Metric,
    Demonstration,
}

#[derive(Debug, Clone)]
struct Candidate {
    source: CandidateSource,
    inference_id: Uuid,
    input: String,
    output: String,
}

/// Whether a metric value is good enough to keep
pub fn passes_threshold(value: f64, threshold: f64, optimize: Optimize) -> bool {
    match optimize {
        Optimize::Max => value >= threshold,
        Optimize::Min => value <= threshold,
    }
}

/// Latest value per target; ties on timestamp go to the larger feedback id
pub fn latest_feedback_per_target(records: &[FeedbackRecord]) -> HashMap<Uuid, f64> {
    let mut latest: HashMap<Uuid, &FeedbackRecord> = HashMap::new();
    for record in records {
        latest
            .entry(record.target_id)
            .and_modify(|current| {
                if (record.timestamp, record.id) > (current.timestamp, current.id) {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    latest.into_iter().map(|(target, r)| (target, r.value)).collect()
}

/// Latest demonstration per inference
pub fn latest_demonstration_per_inference(
    records: &[DemonstrationRecord],
) -> HashMap<Uuid, &DemonstrationRecord> {
    let mut latest: HashMap<Uuid, &DemonstrationRecord> = HashMap::new();
    for record in records {
        latest
            .entry(record.inference_id)
            .and_modify(|current| {
                if (record.timestamp, record.id) > (current.timestamp, current.id) {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    latest
}

/// Canonical form of a stored input document
pub fn canonical_input(stored: &str) -> Option<String> {
    serde_json::from_str::<Value>(stored)
        .ok()
        .map(|value| canonical_json(&value))
}

/// Text of an accepted output (inference output or demonstration)
///
/// Chat outputs become their concatenated text blocks. JSON outputs become the
/// canonical serialization of the parsed value, falling back to raw text.
pub fn accepted_output(kind: OutputKind, stored: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(stored) {
        Ok(value) => value,
        Err(_) if kind == OutputKind::Chat && !stored.is_empty() => return Some(stored.to_string()),
        Err(_) => return None,
    };

    match kind {
        OutputKind::Chat => chat_text(&value),
        OutputKind::Json => json_text(value),
    }
}

fn chat_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|block| match block {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(map) => map.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        Value::Object(map) => map.get("text").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn json_text(value: Value) -> Option<String> {
    match value {
        Value::Object(mut map) if map.contains_key("raw") || map.contains_key("parsed") => {
            match map.remove("parsed") {
                Some(parsed) if !parsed.is_null() => Some(canonical_json(&parsed)),
                _ => map
                    .remove("raw")
                    .and_then(|raw| raw.as_str().map(str::to_string))
                    .map(|raw| reparse(&raw)),
            }
        }
        Value::String(s) => Some(reparse(&s)),
        Value::Null => None,
        other => Some(canonical_json(&other)),
    }
}

fn reparse(raw: &str) -> String {
    serde_json::from_str::<Value>(raw)
        .map(|v| canonical_json(&v))
        .unwrap_or_else(|_| raw.to_string())
}

/// Reads history, embeds candidates and writes them to the store
#[derive(Clone)]
pub struct PopulationPipeline {
    history: Arc<dyn HistorySource>,
    embeddings: Arc<EmbeddingGateway>,
    store: Arc<dyn ExampleStore>,
}

impl PopulationPipeline {
    pub fn new(
        history: Arc<dyn HistorySource>,
        embeddings: Arc<EmbeddingGateway>,
        store: Arc<dyn ExampleStore>,
    ) -> Self {
        Self {
            history,
            embeddings,
            store,
        }
    }

    /// Run one plan end to end
    #[instrument(skip_all, fields(partition = %plan.partition))]
    pub async fn run(&self, plan: &PopulationPlan) -> Result<PopulationReport> {
        // Unknown embedding model is a configuration error: fail before reading history
        self.embeddings.client(&plan.embedding_model)?;

        let mut report = PopulationReport {
            partition: Some(plan.partition.clone()),
            ..Default::default()
        };

        let candidates = self.collect_candidates(plan, &mut report).await?;
        let candidates = self.dedupe(plan, candidates, &mut report).await?;

        if candidates.is_empty() {
            info!("No candidates to ingest");
            return Ok(report);
        }

        let texts: Vec<String> = candidates.iter().map(|c| c.input.clone()).collect();
        let outcomes = self
            .embeddings
            .embed_batch(&texts, &plan.embedding_model, plan.max_concurrency)
            .await?;

        let mut examples = Vec::with_capacity(candidates.len());
        for (candidate, outcome) in candidates.into_iter().zip(outcomes) {
            match outcome.embedding {
                Some(embedding) => examples.push(
                    Example::new(&plan.partition, candidate.input, candidate.output, embedding)
                        .with_source(candidate.inference_id),
                ),
                None => {
                    report.embedding_failures += 1;
                    warn!(
                        inference_id = %candidate.inference_id,
                        error = ?outcome.error,
                        "Dropping candidate whose input could not be embedded"
                    );
                }
            }
        }

        if !examples.is_empty() {
            report.inserted = self.store.upsert(examples).await?;
        }

        info!(
            metric_candidates = report.metric_candidates,
            demonstration_candidates = report.demonstration_candidates,
            duplicates_skipped = report.duplicates_skipped,
            embedding_failures = report.embedding_failures,
            inserted = report.inserted,
            "Population complete"
        );
        Ok(report)
    }

    async fn collect_candidates(
        &self,
        plan: &PopulationPlan,
        report: &mut PopulationReport,
    ) -> Result<Vec<Candidate>> {
        if plan.metric.is_none() && !plan.include_demonstrations {
            return Ok(Vec::new());
        }

        let filter = plan.filter();
        let inferences = self.history.inferences(&filter).await?;
        let by_id: HashMap<Uuid, &InferenceRecord> = inferences.iter().map(|r| (r.id, r)).collect();

        let mut candidates = Vec::new();

        if let Some(metric) = &plan.metric {
            let feedback = self
                .history
                .feedback(&metric.metric_name, metric.config.metric_type)
                .await?;
            let latest = latest_feedback_per_target(&feedback);

            for record in &inferences {
                let target = match metric.config.level {
                    MetricLevel::Inference => record.id,
                    MetricLevel::Episode => record.episode_id,
                };
                let Some(&value) = latest.get(&target) else {
                    continue;
                };
                if !passes_threshold(value, metric.threshold, metric.config.optimize) {
                    continue;
                }
                match (canonical_input(&record.input), accepted_output(plan.kind, &record.output)) {
                    (Some(input), Some(output)) => {
                        report.metric_candidates += 1;
                        candidates.push(Candidate {
                            source: CandidateSource::Metric,
                            inference_id: record.id,
                            input,
                            output,
                        });
                    }
                    _ => {
                        report.unreadable += 1;
                        warn!(inference_id = %record.id, "Skipping inference with unreadable input or output");
                    }
                }
            }
        }

        if plan.include_demonstrations {
            let demonstrations = self.history.demonstrations(&filter).await?;
            let mut latest: Vec<(Uuid, &DemonstrationRecord)> =
                latest_demonstration_per_inference(&demonstrations).into_iter().collect();
            latest.sort_by_key(|(inference_id, _)| *inference_id);

            for (inference_id, demonstration) in latest {
                let Some(record) = by_id.get(&inference_id) else {
                    continue;
                };
                match (canonical_input(&record.input), accepted_output(plan.kind, &demonstration.value)) {
                    (Some(input), Some(output)) => {
                        report.demonstration_candidates += 1;
                        candidates.push(Candidate {
                            source: CandidateSource::Demonstration,
                            inference_id,
                            input,
                            output,
                        });
                    }
                    _ => {
                        report.unreadable += 1;
                        warn!(%inference_id, "Skipping unreadable demonstration");
                    }
                }
            }
        }

        Ok(candidates)
    }

    async fn dedupe(
        &self,
        plan: &PopulationPlan,
        candidates: Vec<Candidate>,
        report: &mut PopulationReport,
    ) -> Result<Vec<Candidate>> {
        if plan.dedupe == DedupePolicy::None {
            return Ok(candidates);
        }

        let already_ingested = match plan.dedupe {
            DedupePolicy::SkipIngested => self.store.source_inference_ids(&plan.partition).await?,
            _ => HashSet::new(),
        };

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let fresh_source = !already_ingested.contains(&candidate.inference_id);
            let fresh_pair = seen.insert((candidate.input.clone(), candidate.output.clone()));
            if fresh_source && fresh_pair {
                kept.push(candidate);
            } else {
                report.duplicates_skipped += 1;
            }
        }

        let demonstrations = kept
            .iter()
            .filter(|c| c.source == CandidateSource::Demonstration)
            .count();
        debug!(kept = kept.len(), demonstrations, "Deduplicated candidates");
        Ok(kept)
    }
}
