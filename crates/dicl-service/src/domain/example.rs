//! DICL Example Types
//!
//! Core data structures for retrievable examples.
//!
//! Each example records:
//! - the canonical input that produced it
//! - the accepted output (a gated model output or a demonstration)
//! - the embedding of the input under the partition's embedding model
//! - the (function, variant, namespace) partition it belongs to

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use dicl_common::{DiclError, ExampleId, Result};

/// Partition key: independent example pools per (function, variant, namespace)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub function_name: String,
    pub variant_name: String,
    pub namespace: String,
}

impl PartitionKey {
    pub fn new(
        function_name: impl Into<String>,
        variant_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            variant_name: variant_name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.function_name, self.variant_name, self.namespace
        )
    }
}

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message of an inference input; content is text or a structured value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub role: Role,
    pub content: Value,
}

impl InputMessage {
    pub fn user(content: impl Into<Value>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<Value>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Text form of the content: strings verbatim, structured values as canonical JSON
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => canonical_json(other),
        }
    }
}

/// Inference input as submitted by a caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(default)]
    pub messages: Vec<InputMessage>,
}

impl Input {
    /// Single user message input
    pub fn from_user_text(text: impl Into<String>) -> Self {
        Self {
            system: None,
            messages: vec![InputMessage::user(Value::String(text.into()))],
        }
    }

    /// Stable serialized form used for storage and embedding
    ///
    /// Object keys are sorted at every depth, so two inputs that are equal as
    /// values always serialize to identical bytes.
    pub fn canonical(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(canonical_json(&value))
    }

    /// Reconstruct an input from its canonical form
    pub fn from_canonical(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| {
            DiclError::Serialization(format!("Stored input is not a valid input document: {}", e))
        })
    }
}

/// Serialize a JSON value with object keys sorted recursively
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// A single retrievable unit
///
/// Never mutated in place: an update is a new record with a new id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// Unique, immutable, time-sortable id
    pub id: ExampleId,
    pub function_name: String,
    pub variant_name: String,
    pub namespace: String,
    /// Canonical serialized input, stored verbatim
    pub input: String,
    /// Canonical serialized accepted output, stored verbatim
    pub output: String,
    /// Embedding of `input` under the partition's embedding model
    pub embedding: Vec<f32>,
    /// Historical inference this example was derived from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_inference_id: Option<Uuid>,
}

impl Example {
    /// Create a new example with a freshly generated id
    pub fn new(
        partition: &PartitionKey,
        input: impl Into<String>,
        output: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: ExampleId::new(),
            function_name: partition.function_name.clone(),
            variant_name: partition.variant_name.clone(),
            namespace: partition.namespace.clone(),
            input: input.into(),
            output: output.into(),
            embedding,
            source_inference_id: None,
        }
    }

    /// Tag the example with the inference it was derived from
    pub fn with_source(mut self, inference_id: Uuid) -> Self {
        self.source_inference_id = Some(inference_id);
        self
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(&self.function_name, &self.variant_name, &self.namespace)
    }

    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }

    /// Creation time, recovered from the id
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.id.created_at()
    }
}

/// A retrieved example with its similarity to the query
#[derive(Debug, Clone, Serialize)]
pub struct ScoredExample {
    pub example: Example,
    pub similarity: f32,
    /// 0-based position in the result set (0 = nearest)
    pub rank: usize,
}

/// Ephemeral similarity query against one partition
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub partition: PartitionKey,
    pub embedding: Vec<f32>,
    pub k: usize,
}
