//! # DICL Service
//!
//! Dynamic In-Context Learning: an inference variant that retrieves the
//! historical (input, output) pairs most similar to the current input and
//! renders them as few-shot demonstrations before calling a generation model.
//!
//! ## Key Concepts
//!
//! - **Partition**: examples are scoped by (function, variant, namespace) and
//!   retrieval never crosses partitions
//! - **Embedding Gateway**: bounded-concurrency, order-preserving batch embedding
//! - **Variant Executor**: Received → Embedding → Retrieving → Composing →
//!   Generating → Complete, with a zero-shot fallback when embedding fails
//! - **Population Pipeline**: turns positively-rated inferences and
//!   demonstrations into stored examples
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      DiclService                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐      │
//! │  │  Inference  │  │  Feedback   │  │  Populate   │      │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘      │
//! │         │                │                │             │
//! │  ┌──────┴──────┐  ┌──────┴──────┐  ┌──────┴──────┐      │
//! │  │   Variant   │  │  Feedback   │  │ Population  │      │
//! │  │  Executor   │  │ Dispatcher  │  │  Pipeline   │      │
//! │  └──────┬──────┘  └─────────────┘  └──────┬──────┘      │
//! │         │                                 │             │
//! │  ┌──────┴─────────────────────────────────┴──────┐      │
//! │  │   ExampleRetriever  ·  EmbeddingGateway       │      │
//! │  └──────────────────────┬────────────────────────┘      │
//! │                         │                               │
//! │  ┌──────────────────────┴────────────────────────┐      │
//! │  │   ExampleStore (in-memory or Redis)           │      │
//! │  └───────────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod domain;
pub mod infra;
pub mod service;

// Re-export core types
pub use config::{DiclConfig, DiclVariantConfig, FunctionConfig, PopulationJob, VariantConfig};
pub use domain::example::{Example, Input, InputMessage, PartitionKey, Role, ScoredExample};
pub use domain::executor::{InferenceOutput, InferenceStage, StageError, VariantExecutor, VariantResponse};
pub use domain::population::{PopulationPipeline, PopulationPlan, PopulationReport};
pub use domain::retrieval::ExampleRetriever;

// Re-export infrastructure
pub use infra::embedding::{EmbeddingClient, EmbeddingGateway, EmbeddingOutcome, EmbeddingProvider};
pub use infra::example_store::{ExampleStore, InMemoryExampleStore, PartitionStats};
pub use infra::feedback::FeedbackRequest;

// Re-export the service handle
pub use service::{DiclService, InferenceRequest, InferenceResponse, ServiceParts};

/// Service name reported by the version endpoint
pub const SERVICE_NAME: &str = "dicl-service";
