//! Structured output validation
//!
//! A model output that fails its function's schema is reported, never dropped:
//! the caller receives the raw text plus the list of violations.

use std::sync::Arc;

use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::Value;

use dicl_common::{DiclError, Result};

/// Violations found when checking an output against its schema
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaValidationError {
    pub messages: Vec<String>,
}

impl std::fmt::Display for SchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.messages.join("; "))
    }
}

/// Outcome of validating one raw output
#[derive(Debug, Clone)]
pub struct OutputValidation {
    /// Parsed value, present only when the output is valid
    pub parsed: Option<Value>,
    pub error: Option<SchemaValidationError>,
}

impl OutputValidation {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Compiled output schema for a JSON function
#[derive(Clone)]
pub struct OutputSchema {
    document: Value,
    compiled: Arc<JSONSchema>,
}

impl std::fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSchema")
            .field("document", &self.document)
            .finish()
    }
}

impl OutputSchema {
    /// Parse and compile a schema given as JSON text
    pub fn parse(text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| DiclError::Config(format!("schema is not valid JSON: {}", e)))?;
        Self::compile(document)
    }

    /// Compile a schema document
    pub fn compile(document: Value) -> Result<Self> {
        let compiled = JSONSchema::compile(&document)
            .map_err(|e| DiclError::Config(format!("schema does not compile: {}", e)))?;
        Ok(Self {
            document,
            compiled: Arc::new(compiled),
        })
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Parse a raw model output and validate it
    pub fn validate_raw(&self, raw: &str) -> OutputValidation {
        let value: Value = match serde_json::from_str(raw.trim()) {
            Ok(value) => value,
            Err(e) => {
                return OutputValidation {
                    parsed: None,
                    error: Some(SchemaValidationError {
                        messages: vec![format!("output is not valid JSON: {}", e)],
                    }),
                }
            }
        };

        let messages: Vec<String> = match self.compiled.validate(&value) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| format!("{} at `{}`", e, e.instance_path))
                .collect(),
        };

        if messages.is_empty() {
            OutputValidation {
                parsed: Some(value),
                error: None,
            }
        } else {
            OutputValidation {
                parsed: None,
                error: Some(SchemaValidationError { messages }),
            }
        }
    }
}
