//! DICL domain logic
//!
//! Example model, retrieval, prompt composition, variant execution and
//! example population.

pub mod composition;
pub mod example;
pub mod executor;
pub mod population;
pub mod retrieval;
pub mod schema;
