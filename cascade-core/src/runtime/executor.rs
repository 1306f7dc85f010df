//! Runtime implementation.
//!
//! `Runtime` provides the high-level `generate_text`, `generate_object` and
//! `stream_text` APIs. Each call is a unit of work run by an
//! [`ExecutionEngine`] over model handles, so a failing backend falls
//! through to the next one.

use crate::backend::{BackendDescriptor, SharedDescriptor};
use crate::config::EngineConfig;
use crate::engine::{ExecutionEngine, ExecutionEngineBuilder, StopCheck, TokenUsage};
use crate::error::AiError;
use crate::provider::ModelHandle;
use crate::schema::{PolicyStore, SchemaRegistry, SchemaValidator, Structured};
use crate::strategy::{detect_json_strategy, JsonOutputStrategy};
use crate::stream::{ChunkKind, StreamHarness};
use crate::types::*;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Builder for [`Runtime`].
///
/// ```ignore
/// let runtime = Runtime::builder()
///     .backend(OpenAiDescriptor::new("gpt-4o-mini"))
///     .backend(LayeredDescriptor::new(deepseek("deepseek-chat")).layer(RetryLayer::new()))
///     .registry(registry.clone())
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    engine: ExecutionEngineBuilder<ModelHandle>,
    registry: Option<Arc<SchemaRegistry>>,
    policies: Option<Arc<PolicyStore>>,
    json_strategy: Option<Arc<dyn JsonOutputStrategy>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            engine: ExecutionEngineBuilder::new(),
            registry: None,
            policies: None,
            json_strategy: None,
        }
    }

    /// Append a backend; list order is priority order
    pub fn backend<D>(mut self, descriptor: D) -> Self
    where
        D: BackendDescriptor<Handle = ModelHandle>,
    {
        self.engine = self.engine.backend(descriptor);
        self
    }

    pub fn shared_backend(mut self, descriptor: SharedDescriptor<ModelHandle>) -> Self {
        self.engine = self.engine.shared_backend(descriptor);
        self
    }

    pub fn stop_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StopCheck<'_>) -> Result<(), AiError> + Send + Sync + 'static,
    {
        self.engine = self.engine.stop_callback(callback);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.engine = self.engine.config(config);
        self
    }

    /// Share a schema registry owned by the application
    pub fn registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share a policy store owned by the application
    pub fn policies(mut self, policies: Arc<PolicyStore>) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Force one JSON output strategy instead of detecting it per provider
    pub fn json_strategy(mut self, strategy: impl JsonOutputStrategy + 'static) -> Self {
        self.json_strategy = Some(Arc::new(strategy));
        self
    }

    pub fn build(self) -> Result<Runtime, AiError> {
        Ok(Runtime {
            engine: self.engine.build()?,
            validator: SchemaValidator::new(
                self.registry.unwrap_or_default(),
                self.policies.unwrap_or_default(),
            ),
            json_strategy: self.json_strategy,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Multi-backend generation over model handles.
pub struct Runtime {
    engine: ExecutionEngine<ModelHandle>,
    validator: SchemaValidator,
    json_strategy: Option<Arc<dyn JsonOutputStrategy>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine)
            .field("schemas", &self.validator.registry().len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn engine(&self) -> &ExecutionEngine<ModelHandle> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        self.validator.registry()
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        self.validator.policies()
    }

    /// Generate text with the first backend that answers
    pub async fn generate_text(&self, params: TextParams) -> Result<TextResult, AiError> {
        self.engine
            .run_async_metered(
                |handle| {
                    let params = params.clone();
                    async move {
                        let req = params
                            .into_request(&handle.model)
                            .with_response_format(ResponseFormat::Text)
                            .with_stream(false);
                        let response = handle.provider.chat_completion(req).await?;
                        text_result(&handle, response)
                    }
                },
                |result| Some(token_usage(&result.usage)),
            )
            .await
    }

    /// Generate a `T`, validated (and repaired if allowed) against its schema.
    ///
    /// A response that cannot be parsed or validated counts as a failed
    /// attempt, so the next backend gets a chance.
    pub async fn generate_object<T>(&self, params: TextParams) -> Result<Structured<T>, AiError>
    where
        T: JsonSchema + DeserializeOwned + Send + 'static,
    {
        let entry = self.validator.registry().get_or_register::<T>()?;
        let validator = &self.validator;
        let entry = &entry;

        let (structured, _) = self
            .engine
            .run_async_metered(
                |handle| {
                    let params = params.clone();
                    async move {
                        let mut req = params.into_request(&handle.model).with_stream(false);
                        self.strategy_for(&handle).apply(&mut req, entry)?;

                        let response = handle.provider.chat_completion(req).await?;
                        let usage = response.usage;
                        let content = response
                            .first_text()
                            .ok_or_else(|| AiError::provider("No choices in response"))?;
                        let payload = parse_json_payload(&content)?;
                        let structured = validator.validate::<T>(payload)?;
                        Ok((structured, usage))
                    }
                },
                |(_, usage)| Some(token_usage(usage)),
            )
            .await?;

        Ok(structured)
    }

    /// Stream a completion into `harness`.
    ///
    /// Opening the stream falls through backends like any other call. Once
    /// deltas flow, a failure ends the turn with `stream.error` and is
    /// returned; chunks already emitted stay delivered.
    pub async fn stream_text(
        &self,
        params: TextParams,
        harness: &mut StreamHarness,
    ) -> Result<TextResult, AiError> {
        let opened = self
            .engine
            .run_async_identified(
                |handle| {
                    let params = params.clone();
                    async move {
                        let req = params.into_request(&handle.model).with_stream(true);
                        let stream = handle.provider.stream_chat_completion(req).await?;
                        Ok((handle, stream))
                    }
                },
                |_| None,
            )
            .await;

        let ((handle, mut stream), attempt_id) = match opened {
            Ok(opened) => opened,
            Err(e) => return Err(fail_turn(harness, e).await),
        };
        harness.set_model_key(handle.backend_id());
        harness.emit_init().await?;

        let mut content = String::new();
        let mut usage = Usage::default();
        let mut finish_reason = FinishReason::Stop;
        let mut model = handle.model.clone();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Err(fail_turn(harness, e).await),
            };
            model = chunk.model;
            if let Some(chunk_usage) = chunk.usage {
                usage = chunk_usage;
            }
            for choice in chunk.choices {
                if let Some(reasoning) = choice.delta.reasoning {
                    harness.emit_chunk(ChunkKind::Reasoning, reasoning).await?;
                }
                if let Some(delta) = choice.delta.content {
                    content.push_str(&delta);
                    harness.emit_chunk(ChunkKind::Text, delta).await?;
                }
                if let Some(reason) = choice.finish_reason {
                    finish_reason = reason;
                }
            }
        }

        harness.emit_complete(usage.to_map()).await?;
        let tokens = token_usage(&usage);
        self.engine.annotate_attempt(
            attempt_id,
            tokens.input_tokens,
            tokens.output_tokens,
            Some(tokens.total_tokens),
        );

        Ok(TextResult {
            content,
            finish_reason,
            usage,
            model,
            backend_id: handle.backend_id(),
        })
    }

    fn strategy_for(&self, handle: &ModelHandle) -> Arc<dyn JsonOutputStrategy> {
        match &self.json_strategy {
            Some(strategy) => strategy.clone(),
            None => Arc::from(detect_json_strategy(&handle.provider_id())),
        }
    }

}

/// Ledger form of provider usage; a zero total means the provider left it out
fn token_usage(usage: &Usage) -> TokenUsage {
    let input = u64::from(usage.prompt_tokens);
    let output = u64::from(usage.completion_tokens);
    let total = match usage.total_tokens {
        0 => input + output,
        total => u64::from(total),
    };
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: total,
    }
}

async fn fail_turn(harness: &mut StreamHarness, error: AiError) -> AiError {
    if let Err(e) = harness.emit_error(error.to_string()).await {
        tracing::debug!("Could not deliver stream error: {}", e);
    }
    error
}

fn text_result(handle: &ModelHandle, response: ChatCompletionResponse) -> Result<TextResult, AiError> {
    let first_choice = response
        .choices
        .first()
        .ok_or_else(|| AiError::provider("No choices in response"))?;

    Ok(TextResult {
        content: first_choice.message.joined_text(),
        finish_reason: first_choice.finish_reason.clone(),
        usage: response.usage,
        model: response.model,
        backend_id: handle.backend_id(),
    })
}

/// Parse a model reply as JSON, tolerating a surrounding code fence
fn parse_json_payload(content: &str) -> Result<serde_json::Value, AiError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    Ok(serde_json::from_str(unfenced.trim())?)
}
