//! Provider trait and the live handle the engine hands to units of work.

use crate::error::AiError;
use crate::types::*;
use async_trait::async_trait;
use futures::Stream;
use std::fmt::Debug;
use std::sync::Arc;

/// Stream type alias for chat completion chunks
pub type ChatCompletionStream =
    dyn Stream<Item = Result<ChatCompletionChunk, AiError>> + Send + Unpin;

/// Core provider trait for inference services.
///
/// This is the `invoke` half of the backend contract: a constructed provider
/// turns a request into a response, or fails. How a provider is obtained is
/// the job of a [`BackendDescriptor`](crate::backend::BackendDescriptor).
#[async_trait]
pub trait Provider: Send + Sync + Debug + 'static {
    /// Get provider information
    fn info(&self) -> Arc<ProviderInfo>;

    /// Chat completion (non-streaming)
    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, AiError>;

    /// Stream chat completion
    async fn stream_chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<Box<ChatCompletionStream>, AiError>;
}

/// A live provider bound to the model it should be asked for.
///
/// This is the handle type produced by provider-backed descriptors and
/// consumed by [`Runtime`](crate::runtime::Runtime) units of work.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub provider: Arc<dyn Provider>,
    pub model: String,
}

impl ModelHandle {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Provider id, used to pick a JSON output strategy
    pub fn provider_id(&self) -> String {
        self.provider.info().id.clone()
    }

    /// `provider:model`, the default identity of a provider descriptor
    pub fn backend_id(&self) -> String {
        format!("{}:{}", self.provider.info().id, self.model)
    }
}
