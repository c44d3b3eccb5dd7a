//! Language model collaborator trait.
//!
//! The application crate provides the HTTP-backed implementation; tests
//! provide scripted ones.

use async_trait::async_trait;
use serde_json::Value;

/// Failure of an embedding or language model call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("model call timed out after {0}s")]
    Timeout(u64),
    #[error("model call failed: {0}")]
    Upstream(String),
    #[error("model returned a malformed response: {0}")]
    Malformed(String),
    #[error("model provider is disabled")]
    Disabled,
}

/// JSON schema the response must conform to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

/// One completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    /// When set, the provider must use its JSON-schema-constrained mode.
    pub schema: Option<ResponseSchema>,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            schema: None,
            temperature: 0.0,
        }
    }

    pub fn with_schema(mut self, name: &str, schema: Value) -> Self {
        self.schema = Some(ResponseSchema {
            name: name.to_string(),
            schema,
        });
        self
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;
    /// Returns the raw text of the model's reply.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError>;
}
