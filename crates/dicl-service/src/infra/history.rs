//! Inference and feedback history
//!
//! The population pipeline reads past inferences, metric feedback and
//! demonstrations from here. Two backends: an in-process log (also fed by the
//! service's own inferences) and a ClickHouse reader over the standard
//! `ChatInference` / `JsonInference` / `*MetricFeedback` /
//! `DemonstrationFeedback` tables.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use dicl_common::{DiclError, Result};

use crate::config::{FunctionConfig, HistorySettings, MetricType};
use crate::infra::feedback::{FeedbackRequest, FeedbackSink, DEMONSTRATION_METRIC};

/// Creation time encoded in a v7 id; `None` for other versions
pub fn uuid_timestamp(id: &Uuid) -> Option<DateTime<Utc>> {
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    DateTime::<Utc>::from_timestamp(secs as i64, nanos)
}

/// Output shape of a function's inferences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Chat,
    Json,
}

impl From<&FunctionConfig> for OutputKind {
    fn from(function: &FunctionConfig) -> Self {
        match function {
            FunctionConfig::Chat { .. } => OutputKind::Chat,
            FunctionConfig::Json { .. } => OutputKind::Json,
        }
    }
}

impl OutputKind {
    fn inference_table(&self) -> &'static str {
        match self {
            OutputKind::Chat => "ChatInference",
            OutputKind::Json => "JsonInference",
        }
    }
}

/// Which inferences to read
#[derive(Debug, Clone)]
pub struct InferenceFilter {
    pub function_name: String,
    pub kind: OutputKind,
    /// Restrict to inferences served by this variant
    pub variant_name: Option<String>,
}

/// A past inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRecord {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub function_name: String,
    pub variant_name: String,
    /// Stored input document (JSON text)
    pub input: String,
    /// Stored output document (JSON text)
    pub output: String,
}

impl InferenceRecord {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        uuid_timestamp(&self.id)
    }
}

/// A metric value attached to an inference or an episode
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackRecord {
    pub id: Uuid,
    /// Inference id or episode id, depending on the metric's level
    pub target_id: Uuid,
    pub metric_name: String,
    /// Boolean metrics are mapped to 1.0 / 0.0
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// A reference output supplied for an inference
#[derive(Debug, Clone, PartialEq)]
pub struct DemonstrationRecord {
    pub id: Uuid,
    pub inference_id: Uuid,
    /// Stored demonstration document (JSON text)
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

/// Read side of the history
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn inferences(&self, filter: &InferenceFilter) -> Result<Vec<InferenceRecord>>;

    /// Every feedback value recorded for a metric
    async fn feedback(&self, metric_name: &str, metric_type: MetricType) -> Result<Vec<FeedbackRecord>>;

    /// Demonstrations for inferences matching the filter
    async fn demonstrations(&self, filter: &InferenceFilter) -> Result<Vec<DemonstrationRecord>>;
}

/// Write side of the history
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record_inference(&self, record: InferenceRecord) -> Result<()>;
}

/// In-process history log
#[derive(Default)]
pub struct InMemoryHistory {
    inferences: DashMap<Uuid, InferenceRecord>,
    feedback: RwLock<Vec<FeedbackRecord>>,
    demonstrations: RwLock<Vec<DemonstrationRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_inference(&self, record: InferenceRecord) {
        self.inferences.insert(record.id, record);
    }

    pub fn insert_feedback(&self, record: FeedbackRecord) {
        self.feedback.write().push(record);
    }

    pub fn insert_demonstration(&self, record: DemonstrationRecord) {
        self.demonstrations.write().push(record);
    }

    pub fn inference(&self, id: &Uuid) -> Option<InferenceRecord> {
        self.inferences.get(id).map(|r| r.clone())
    }

    fn matches(filter: &InferenceFilter, record: &InferenceRecord) -> bool {
        record.function_name == filter.function_name
            && filter
                .variant_name
                .as_ref()
                .map_or(true, |v| &record.variant_name == v)
    }
}

#[async_trait]
impl HistorySource for InMemoryHistory {
    async fn inferences(&self, filter: &InferenceFilter) -> Result<Vec<InferenceRecord>> {
        let mut records: Vec<InferenceRecord> = self
            .inferences
            .iter()
            .filter(|r| Self::matches(filter, r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn feedback(&self, metric_name: &str, _metric_type: MetricType) -> Result<Vec<FeedbackRecord>> {
        Ok(self
            .feedback
            .read()
            .iter()
            .filter(|f| f.metric_name == metric_name)
            .cloned()
            .collect())
    }

    async fn demonstrations(&self, filter: &InferenceFilter) -> Result<Vec<DemonstrationRecord>> {
        Ok(self
            .demonstrations
            .read()
            .iter()
            .filter(|d| {
                self.inferences
                    .get(&d.inference_id)
                    .is_some_and(|r| Self::matches(filter, r.value()))
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HistorySink for InMemoryHistory {
    async fn record_inference(&self, record: InferenceRecord) -> Result<()> {
        self.insert_inference(record);
        Ok(())
    }
}

#[async_trait]
impl FeedbackSink for InMemoryHistory {
    async fn send(&self, feedback: &FeedbackRequest) -> Result<()> {
        let id = Uuid::now_v7();
        let timestamp = Utc::now();

        if feedback.metric_name == DEMONSTRATION_METRIC {
            let inference_id = feedback.inference_id.ok_or_else(|| {
                DiclError::Config("demonstrations must target an inference".to_string())
            })?;
            self.insert_demonstration(DemonstrationRecord {
                id,
                inference_id,
                value: feedback.value.to_string(),
                timestamp,
            });
            return Ok(());
        }

        let value = metric_value(&feedback.value).ok_or_else(|| {
            DiclError::Config(format!(
                "feedback for `{}` must be a number or a boolean",
                feedback.metric_name
            ))
        })?;
        let target_id = feedback
            .inference_id
            .or(feedback.episode_id)
            .ok_or_else(|| DiclError::Config("feedback needs an inference or episode id".to_string()))?;

        self.insert_feedback(FeedbackRecord {
            id,
            target_id,
            metric_name: feedback.metric_name.clone(),
            value,
            timestamp,
        });
        Ok(())
    }
}

/// Numeric value of a metric: numbers as-is, booleans as 1.0 / 0.0
pub fn metric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) => Some(0.0),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// ClickHouse reader over the HTTP interface
pub struct ClickHouseHistory {
    client: Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedbackRow {
    id: Uuid,
    target_id: Uuid,
    metric_name: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct DemonstrationRow {
    id: Uuid,
    inference_id: Uuid,
    value: String,
}

impl ClickHouseHistory {
    pub fn from_settings(settings: &HistorySettings) -> Result<Self> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| DiclError::Config("`history.url` is required for clickhouse".to_string()))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| DiclError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            database: settings.database.clone(),
            user: settings.user_env.as_deref().and_then(|v| std::env::var(v).ok()),
            password: settings.password_env.as_deref().and_then(|v| std::env::var(v).ok()),
        })
    }

    /// Run a parameterized query and parse JSONEachRow output
    #[instrument(skip(self, params))]
    async fn query<T: for<'de> Deserialize<'de>>(&self, sql: &str, params: &[(&str, &str)]) -> Result<Vec<T>> {
        let mut query: Vec<(String, String)> = vec![
            ("database".to_string(), self.database.clone()),
            ("default_format".to_string(), "JSONEachRow".to_string()),
        ];
        for (name, value) in params {
            query.push((format!("param_{}", name), value.to_string()));
        }

        let mut request = self.client.post(&self.url).query(&query).body(sql.to_string());
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiclError::Retrieval(format!("ClickHouse request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DiclError::Retrieval(format!("ClickHouse response unreadable: {}", e)))?;
        if !status.is_success() {
            return Err(DiclError::Retrieval(format!("ClickHouse error ({}): {}", status, body.trim())));
        }

        let rows = parse_json_each_row(&body)?;
        debug!(rows = rows.len(), "ClickHouse query complete");
        Ok(rows)
    }
}

fn parse_json_each_row<T: for<'de> Deserialize<'de>>(body: &str) -> Result<Vec<T>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| DiclError::Serialization(format!("Unexpected ClickHouse row: {}", e)))
        })
        .collect()
}

fn inference_sql(filter: &InferenceFilter) -> String {
    let mut sql = format!(
        "SELECT id, episode_id, function_name, variant_name, input, output FROM {} \
         WHERE function_name = {{function_name:String}}",
        filter.kind.inference_table()
    );
    if filter.variant_name.is_some() {
        sql.push_str(" AND variant_name = {variant_name:String}");
    }
    sql.push_str(" ORDER BY id");
    sql
}

#[async_trait]
impl HistorySource for ClickHouseHistory {
    async fn inferences(&self, filter: &InferenceFilter) -> Result<Vec<InferenceRecord>> {
        let mut params = vec![("function_name", filter.function_name.as_str())];
        if let Some(variant) = &filter.variant_name {
            params.push(("variant_name", variant.as_str()));
        }
        self.query(&inference_sql(filter), &params).await
    }

    async fn feedback(&self, metric_name: &str, metric_type: MetricType) -> Result<Vec<FeedbackRecord>> {
        let table = match metric_type {
            MetricType::Float => "FloatMetricFeedback",
            MetricType::Boolean => "BooleanMetricFeedback",
        };
        let sql = format!(
            "SELECT id, target_id, metric_name, value FROM {table} \
             WHERE metric_name = {{metric_name:String}} ORDER BY id"
        );
        let rows: Vec<FeedbackRow> = self.query(&sql, &[("metric_name", metric_name)]).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let value = metric_value(&row.value)?;
                Some(FeedbackRecord {
                    timestamp: uuid_timestamp(&row.id)?,
                    id: row.id,
                    target_id: row.target_id,
                    metric_name: row.metric_name,
                    value,
                })
            })
            .collect())
    }

    async fn demonstrations(&self, filter: &InferenceFilter) -> Result<Vec<DemonstrationRecord>> {
        let sql = format!(
            "SELECT id, inference_id, value FROM DemonstrationFeedback \
             WHERE inference_id IN (SELECT id FROM ({})) ORDER BY id",
            inference_sql(filter)
        );
        let mut params = vec![("function_name", filter.function_name.as_str())];
        if let Some(variant) = &filter.variant_name {
            params.push(("variant_name", variant.as_str()));
        }
        let rows: Vec<DemonstrationRow> = self.query(&sql, &params).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(DemonstrationRecord {
                    timestamp: uuid_timestamp(&row.id)?,
                    id: row.id,
                    inference_id: row.inference_id,
                    value: row.value,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(function: &str, variant: &str) -> InferenceRecord {
        InferenceRecord {
            id: Uuid::now_v7(),
            episode_id: Uuid::now_v7(),
            function_name: function.into(),
            variant_name: variant.into(),
            input: r#"{"messages":[]}"#.into(),
            output: r#"[{"type":"text","text":"hi"}]"#.into(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_filters() {
        let history = InMemoryHistory::new();
        history.insert_inference(record("f", "a"));
        history.insert_inference(record("f", "b"));
        history.insert_inference(record("g", "a"));

        let all = history
            .inferences(&InferenceFilter {
                function_name: "f".into(),
                kind: OutputKind::Chat,
                variant_name: None,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].id < all[1].id);

        let only_a = history
            .inferences(&InferenceFilter {
                function_name: "f".into(),
                kind: OutputKind::Chat,
                variant_name: Some("a".into()),
            })
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
    }

    #[tokio::test]
    async fn test_feedback_sink_maps_booleans() {
        let history = InMemoryHistory::new();
        let inference = record("f", "a");
        let inference_id = inference.id;
        history.insert_inference(inference);

        history
            .send(&FeedbackRequest {
                metric_name: "exact_match".into(),
                value: json!(true),
                inference_id: Some(inference_id),
                episode_id: None,
            })
            .await
            .unwrap();
        history
            .send(&FeedbackRequest {
                metric_name: DEMONSTRATION_METRIC.into(),
                value: json!("the reference answer"),
                inference_id: Some(inference_id),
                episode_id: None,
            })
            .await
            .unwrap();

        let feedback = history.feedback("exact_match", MetricType::Boolean).await.unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].value, 1.0);
        assert_eq!(feedback[0].target_id, inference_id);

        let demos = history
            .demonstrations(&InferenceFilter {
                function_name: "f".into(),
                kind: OutputKind::Chat,
                variant_name: None,
            })
            .await
            .unwrap();
        assert_eq!(demos.len(), 1);
        assert_eq!(demos[0].value, "\"the reference answer\"");
    }

    #[tokio::test]
    async fn test_non_numeric_feedback_rejected() {
        let history = InMemoryHistory::new();
        let err = history
            .send(&FeedbackRequest {
                metric_name: "jaccard".into(),
                value: json!("high"),
                inference_id: Some(Uuid::now_v7()),
                episode_id: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_inference_sql() {
        let sql = inference_sql(&InferenceFilter {
            function_name: "f".into(),
            kind: OutputKind::Json,
            variant_name: Some("v".into()),
        });
        assert!(sql.contains("FROM JsonInference"));
        assert!(sql.contains("{function_name:String}"));
        assert!(sql.contains("{variant_name:String}"));
    }

    #[test]
    fn test_parse_rows() {
        let id = Uuid::now_v7();
        let target = Uuid::now_v7();
        let body = format!(
            "{{\"id\":\"{id}\",\"target_id\":\"{target}\",\"metric_name\":\"m\",\"value\":false}}\n\n"
        );
        let rows: Vec<FeedbackRow> = parse_json_each_row(&body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(metric_value(&rows[0].value), Some(0.0));
        assert!(uuid_timestamp(&id).is_some());
    }
}
