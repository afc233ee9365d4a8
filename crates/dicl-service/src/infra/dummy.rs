//! Deterministic in-process providers
//!
//! Behavior is selected by the provider-side model name, so failure modes can
//! be exercised from configuration alone:
//!
//! | model name      | behavior                                     |
//! |-----------------|----------------------------------------------|
//! | `error*`        | every call fails                             |
//! | `flaky_*`       | every other call fails, starting with the 1st |
//! | `slow`          | sleeps 5s before answering                   |
//! | `json`          | answers `{"answer":"Hello"}`                 |
//! | `null`          | answers with empty text                      |
//! | `echo`          | answers with a transcript of the prompt      |
//! | `replay`        | answers with the nearest example's output    |
//! | anything else   | answers with a fixed sentence                |
//!
//! Embeddings are derived from a blake3 hash of the text: identical texts map
//! to identical vectors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use dicl_common::{DiclError, EmbeddingError, Result};

use crate::domain::example::Role;
use crate::infra::embedding::EmbeddingProvider;
use crate::infra::generation::{GenerationProvider, GenerationRequest, GenerationResponse, Usage};

/// Delay used by the `slow` models
pub const SLOW_DELAY: Duration = Duration::from_secs(5);

/// Reply of the default dummy model
pub const DEFAULT_REPLY: &str = "Dummy model reply.";

/// Reply of the `json` dummy model
pub const JSON_REPLY: &str = r#"{"answer":"Hello"}"#;

fn flaky_call_fails(calls: &AtomicU64) -> bool {
    calls.fetch_add(1, Ordering::SeqCst) % 2 == 0
}

/// Deterministic embedding provider
pub struct DummyEmbedding {
    model_name: String,
    dimension: usize,
    calls: AtomicU64,
}

impl DummyEmbedding {
    pub fn new(model_name: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_name: model_name.into(),
            dimension,
            calls: AtomicU64::new(0),
        }
    }

    /// Vector for a text: blake3 output stream mapped into [-1, 1)
    pub fn vector_for(text: &str, dimension: usize) -> Vec<f32> {
        let mut reader = blake3::Hasher::new().update(text.as_bytes()).finalize_xof();
        let mut bytes = vec![0u8; dimension * 2];
        reader.fill(&mut bytes);
        bytes
            .chunks_exact(2)
            .map(|pair| {
                let raw = u16::from_le_bytes([pair[0], pair[1]]);
                (raw as f32 / 32768.0) - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for DummyEmbedding {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        if self.model_name.starts_with("error") {
            return Err(EmbeddingError::ApiError(format!(
                "dummy embedding model `{}` always fails",
                self.model_name
            )));
        }
        if self.model_name.starts_with("flaky_") && flaky_call_fails(&self.calls) {
            return Err(EmbeddingError::Unavailable);
        }
        if self.model_name == "slow" {
            tokio::time::sleep(SLOW_DELAY).await;
        }
        Ok(Self::vector_for(text, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> String {
        format!("dummy::{}", self.model_name)
    }
}

/// Deterministic generation provider
pub struct DummyGenerationProvider {
    model_name: String,
    calls: AtomicU64,
}

impl DummyGenerationProvider {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            calls: AtomicU64::new(0),
        }
    }

    fn transcript(request: &GenerationRequest) -> String {
        let mut lines = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            lines.push(format!("system: {system}"));
        }
        for message in &request.messages {
            lines.push(format!("{}: {}", message.role, message.content));
        }
        lines.join("\n")
    }

    fn reply(&self, request: &GenerationRequest) -> String {
        match self.model_name.as_str() {
            "json" => JSON_REPLY.to_string(),
            "null" => String::new(),
            "echo" => Self::transcript(request),
            "replay" => request
                .messages
                .iter()
                .find(|m| m.role == Role::Assistant)
                .map(|m| m.content.clone())
                .unwrap_or_else(|| DEFAULT_REPLY.to_string()),
            _ => DEFAULT_REPLY.to_string(),
        }
    }
}

#[async_trait]
impl GenerationProvider for DummyGenerationProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        if self.model_name.starts_with("error") {
            return Err(DiclError::Generation(format!(
                "dummy model `{}` always fails",
                self.model_name
            )));
        }
        if self.model_name.starts_with("flaky_") && flaky_call_fails(&self.calls) {
            return Err(DiclError::Generation(format!(
                "dummy model `{}` failed this call",
                self.model_name
            )));
        }
        if self.model_name == "slow" {
            tokio::time::sleep(SLOW_DELAY).await;
        }

        let content = self.reply(request);
        let input_tokens = request
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u32)
            .sum();
        let output_tokens = content.split_whitespace().count() as u32;

        Ok(GenerationResponse {
            content,
            usage: Usage {
                input_tokens,
                output_tokens,
            },
            latency: Duration::ZERO,
        })
    }

    fn model_id(&self) -> String {
        format!("dummy::{}", self.model_name)
    }
}
