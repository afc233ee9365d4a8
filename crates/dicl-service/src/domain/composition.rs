//! Prompt composition
//!
//! Renders retrieved examples into a chat prompt. Composition is a pure
//! function of its inputs: the same instructions, retrieved set and query
//! always produce the same prompt.

use serde::Serialize;

use dicl_common::Result;

use super::example::{Input, InputMessage, Role, ScoredExample};
use crate::infra::generation::{ChatMessage, GenerationRequest};

/// Prompt ready to hand to a generation model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposedPrompt {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Number of example pairs rendered into `messages`
    pub example_count: usize,
}

impl ComposedPrompt {
    /// Retrieval-augmented prompt
    ///
    /// Each example becomes a user/assistant pair carrying its stored input and
    /// output verbatim, nearest first; the query follows as the final user turn.
    pub fn with_examples(
        system_instructions: Option<&str>,
        examples: &[ScoredExample],
        query: &Input,
    ) -> Result<Self> {
        let mut messages = Vec::with_capacity(examples.len() * 2 + 1);
        for scored in examples {
            messages.push(ChatMessage::user(scored.example.input.clone()));
            messages.push(ChatMessage::assistant(scored.example.output.clone()));
        }
        messages.push(ChatMessage::user(query.canonical()?));

        Ok(Self {
            system: system_instructions.map(str::to_string),
            messages,
            example_count: examples.len(),
        })
    }

    /// Prompt without examples: the input's own messages, in order
    pub fn zero_shot(system_instructions: Option<&str>, input: &Input) -> Self {
        let input_system = input.system.as_ref().map(|s| {
            InputMessage {
                role: Role::User,
                content: s.clone(),
            }
            .content_text()
        });

        let system = match (system_instructions, input_system) {
            (Some(instructions), Some(own)) => Some(format!("{instructions}\n\n{own}")),
            (Some(instructions), None) => Some(instructions.to_string()),
            (None, own) => own,
        };

        let messages = input
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content_text(),
            })
            .collect();

        Self {
            system,
            messages,
            example_count: 0,
        }
    }

    /// Plain generation request carrying this prompt
    pub fn into_request(self) -> GenerationRequest {
        GenerationRequest::new(self.system, self.messages)
    }

    /// Human-readable rendering for logs and dry runs
    pub fn as_transcript(&self) -> String {
        let mut out = String::new();
        if let Some(system) = &self.system {
            out.push_str(&format!("[system]\n{}\n\n", system));
        }
        for message in &self.messages {
            out.push_str(&format!("[{}]\n{}\n\n", message.role, message.content));
        }
        out.trim_end().to_string()
    }
}
