//! Language model providers and the call guard shared with embeddings.
//!
//! Every model call made by the service goes through a [`CallGuard`]:
//! a semaphore bounds calls in flight, each attempt runs under a timeout,
//! and a failed attempt is retried once, immediately. Providers themselves
//! make exactly one HTTP request per call.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use groundwork_core::llm::{CompletionRequest, LanguageModel, ModelError};

use crate::config::LlmConfig;

/// Concurrency, timeout and retry policy for one upstream model.
#[derive(Clone)]
pub struct CallGuard {
    permits: Arc<Semaphore>,
    timeout: Duration,
    attempts: u32,
}

impl CallGuard {
    pub fn new(max_in_flight: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            timeout,
            attempts: 2,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let mut last = ModelError::Upstream("no attempt made".to_string());
        for attempt in 1..=self.attempts {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ModelError::Upstream("call guard closed".to_string()))?;

            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(r) => r,
                Err(_) => Err(ModelError::Timeout(self.timeout.as_secs())),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(ModelError::Disabled) => return Err(ModelError::Disabled),
                Err(e) => {
                    if attempt < self.attempts {
                        tracing::warn!(operation = what, error = %e, "model call failed, retrying once");
                    }
                    last = e;
                }
            }
        }
        Err(last)
    }
}

/// A [`LanguageModel`] wrapped in a [`CallGuard`].
pub struct GuardedModel {
    inner: Arc<dyn LanguageModel>,
    guard: CallGuard,
}

impl GuardedModel {
    pub fn new(inner: Arc<dyn LanguageModel>, guard: CallGuard) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl LanguageModel for GuardedModel {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let inner = &self.inner;
        self.guard
            .call("llm completion", move || inner.complete(request))
            .await
    }
}

/// Used when `llm.provider = "disabled"`. Every call fails.
pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, ModelError> {
        Err(ModelError::Disabled)
    }
}

/// OpenAI-compatible `/v1/chat/completions` client.
///
/// Schema-constrained requests use `response_format: json_schema`.
pub struct OpenAiChat {
    client: reqwest::Client,
    model: String,
    url: String,
    api_key: String,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model: config.model.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
        });
        if let Some(schema) = &request.schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": true,
                },
            });
        }
        body
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String, ModelError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| ModelError::Malformed("missing choices[0].message.content".to_string()))
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| ModelError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ModelError::Upstream(format!(
                "chat API error {}: {}",
                status,
                body_text.chars().take(300).collect::<String>()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;
        parse_chat_response(&json)
    }
}

/// Build the configured language model, guarded.
pub fn create_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn LanguageModel>> {
    let inner: Arc<dyn LanguageModel> = match config.provider.as_str() {
        "openai" => Arc::new(OpenAiChat::new(config)?),
        "disabled" => Arc::new(DisabledModel),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    };
    let guard = CallGuard::new(
        config.max_in_flight,
        Duration::from_secs(config.timeout_secs),
    );
    Ok(Arc::new(GuardedModel::new(inner, guard)))
}
