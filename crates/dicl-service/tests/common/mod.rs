//! Shared harness: a fully in-process service with inspectable history and store

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use dicl_service::infra::embedding::EmbeddingGateway;
use dicl_service::infra::generation::ModelTable;
use dicl_service::infra::history::{DemonstrationRecord, FeedbackRecord, InMemoryHistory, InferenceRecord};
use dicl_service::{DiclConfig, DiclService, InMemoryExampleStore, Input, ServiceParts};

pub const CONFIG: &str = r#"
[embedding_models.embed_small]
provider = "dummy"
dimension = 16

[embedding_models.embed_broken]
provider = "dummy"
model_name = "error_always"
dimension = 16

[models.echo]
provider = "dummy"

[models.replay]
provider = "dummy"

[models.json]
provider = "dummy"

[models.default_reply]
provider = "dummy"

[metrics.jaccard]
type = "float"
optimize = "max"

[metrics.latency_ms]
type = "float"
optimize = "min"

[metrics.exact_match]
type = "boolean"
optimize = "max"

[metrics.task_success]
type = "boolean"
optimize = "max"
level = "episode"

[functions.summarize]
type = "chat"

[functions.summarize.variants.baseline]
type = "chat_completion"
model = "default_reply"
weight = 0.0

[functions.summarize.variants.dicl]
type = "dicl"
embedding_model = "embed_small"
model = "replay"
k = 3
weight = 1.0

[functions.summarize.variants.dicl_echo]
type = "dicl"
embedding_model = "embed_small"
model = "echo"
k = 2
system_instructions = "Summarize briefly."
weight = 0.0

[functions.summarize.variants.dicl_broken]
type = "dicl"
embedding_model = "embed_broken"
model = "echo"
weight = 0.0

[functions.summarize.variants.dicl_strict]
type = "dicl"
embedding_model = "embed_broken"
model = "echo"
fallback_to_zero_shot = false
weight = 0.0

[functions.extract]
type = "json"
output_schema = '{"type": "object", "required": ["answer"], "properties": {"answer": {"type": "string"}}}'

[functions.extract.variants.dicl]
type = "dicl"
embedding_model = "embed_small"
model = "json"
json_mode = "on"

[functions.extract.variants.dicl_text]
type = "dicl"
embedding_model = "embed_small"
model = "default_reply"
weight = 0.0
"#;

pub struct Harness {
    pub service: DiclService,
    pub history: Arc<InMemoryHistory>,
    pub store: Arc<InMemoryExampleStore>,
}

pub fn config() -> DiclConfig {
    DiclConfig::from_toml_str(CONFIG).expect("test config parses")
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: DiclConfig) -> Harness {
    let http = reqwest::Client::new();
    let history = Arc::new(InMemoryHistory::new());
    let store = Arc::new(InMemoryExampleStore::default());
    let parts = ServiceParts {
        store: store.clone(),
        embeddings: Arc::new(EmbeddingGateway::from_config(&config.embedding_models, http.clone()).unwrap()),
        models: Arc::new(ModelTable::from_config(&config.models, http).unwrap()),
        history: history.clone(),
        history_sink: Some(history.clone()),
        feedback_sinks: vec![history.clone()],
    };
    Harness {
        service: DiclService::new(config, parts).unwrap(),
        history,
        store,
    }
}

/// Stored chat output document
pub fn chat_output(text: &str) -> String {
    json!([{"type": "text", "text": text}]).to_string()
}

/// Record a past inference and return its id
pub fn record_inference(
    history: &InMemoryHistory,
    function_name: &str,
    variant_name: &str,
    episode_id: Uuid,
    input_text: &str,
    output: String,
) -> Uuid {
    let id = Uuid::now_v7();
    history.insert_inference(InferenceRecord {
        id,
        episode_id,
        function_name: function_name.to_string(),
        variant_name: variant_name.to_string(),
        input: Input::from_user_text(input_text).canonical().unwrap(),
        output,
    });
    id
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub fn record_feedback(history: &InMemoryHistory, metric_name: &str, target_id: Uuid, value: f64, timestamp: DateTime<Utc>) {
    history.insert_feedback(FeedbackRecord {
        id: Uuid::now_v7(),
        target_id,
        metric_name: metric_name.to_string(),
        value,
        timestamp,
    });
}

pub fn record_demonstration(history: &InMemoryHistory, inference_id: Uuid, value: String, timestamp: DateTime<Utc>) {
    history.insert_demonstration(DemonstrationRecord {
        id: Uuid::now_v7(),
        inference_id,
        value,
        timestamp,
    });
}
