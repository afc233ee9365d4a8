//! # DICL Common
//!
//! Shared types, errors, and vector math for the dynamic in-context learning service.
//!
//! ## Core Types
//!
//! - [`ExampleId`]: time-sortable example identifier (creation time is recoverable from the id)
//! - [`DistanceMetric`]: the similarity function pinned by configuration
//! - [`DiclError`]: unified error taxonomy for embedding, retrieval, storage and generation
//!
//! ## Vector math
//!
//! - [`types::vector`]: cosine similarity, dot product, L2 normalization

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{DiclError, EmbeddingError, Result};
pub use types::{
    example_id::ExampleId,
    vector::{cosine_similarity, dot_product, l2_normalize, DistanceMetric},
};

/// Service version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of examples retrieved per request
pub const DEFAULT_K: usize = 10;

/// Default namespace when a variant does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default bound on outstanding embedding / generation calls
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default per-request timeout for external calls in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
