//! Core data types shared across DICL crates

pub mod example_id;
pub mod vector;
