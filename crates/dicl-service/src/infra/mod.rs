//! DICL infrastructure
//!
//! Adapters to external systems: example storage, embedding and generation
//! providers, inference history and feedback delivery.

pub mod dummy;
pub mod embedding;
pub mod example_store;
pub mod feedback;
pub mod generation;
pub mod history;
pub mod openai;
pub mod redis_store;
