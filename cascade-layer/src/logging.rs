//! Logging layer for provider operations.

use async_trait::async_trait;
use cascade_core::error::AiError;
use cascade_core::layer::Layer;
use cascade_core::provider::{ChatCompletionStream, Provider};
use cascade_core::types::*;
use std::sync::Arc;
use std::time::Instant;

/// Logs every provider call with its model, timing and token usage.
#[derive(Debug, Clone)]
pub struct LoggingLayer {
    prefix: String,
}

impl LoggingLayer {
    pub fn new() -> Self {
        Self {
            prefix: "[cascade]".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LoggingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for LoggingLayer {
    fn layer(&self, inner: Arc<dyn Provider>) -> Arc<dyn Provider> {
        Arc::new(LoggingProvider {
            inner,
            prefix: self.prefix.clone(),
        })
    }
}

/// Provider wrapped with logging
#[derive(Debug)]
pub struct LoggingProvider {
    inner: Arc<dyn Provider>,
    prefix: String,
}

impl LoggingProvider {
    fn log_outcome<T>(&self, operation: &str, model: &str, started: Instant, result: &Result<T, AiError>) {
        let elapsed = started.elapsed();
        match result {
            Ok(_) => tracing::debug!(
                "{} {} {} ok: model={}, elapsed={:?}",
                self.prefix,
                self.inner.info().id,
                operation,
                model,
                elapsed
            ),
            Err(e) if e.is_cancellation() => tracing::info!(
                "{} {} {} stopped: {}, elapsed={:?}",
                self.prefix,
                self.inner.info().id,
                operation,
                e,
                elapsed
            ),
            Err(e) => tracing::error!(
                "{} {} {} error: {}, model={}, elapsed={:?}",
                self.prefix,
                self.inner.info().id,
                operation,
                e,
                model,
                elapsed
            ),
        }
    }
}

#[async_trait]
impl Provider for LoggingProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.inner.info()
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, AiError> {
        let model = req.model.clone();
        tracing::debug!(
            "{} chat_completion request: model={}, messages={}",
            self.prefix,
            model,
            req.messages.len()
        );

        let started = Instant::now();
        let result = self.inner.chat_completion(req).await;
        self.log_outcome("chat_completion", &model, started, &result);

        if let Ok(response) = &result {
            tracing::debug!(
                "{} usage: prompt={}, completion={}, total={}",
                self.prefix,
                response.usage.prompt_tokens,
                response.usage.completion_tokens,
                response.usage.total_tokens
            );
        }
        result
    }

    async fn stream_chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<Box<ChatCompletionStream>, AiError> {
        let model = req.model.clone();
        tracing::debug!(
            "{} stream_chat_completion request: model={}, messages={}",
            self.prefix,
            model,
            req.messages.len()
        );

        let started = Instant::now();
        let result = self.inner.stream_chat_completion(req).await;
        self.log_outcome("stream_chat_completion", &model, started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    #[tokio::test]
    async fn test_logging_is_transparent() {
        let inner = ScriptedProvider::failing_with(vec![AiError::provider("down")]);
        let provider = LoggingLayer::with_prefix("[test]").layer(inner.clone());

        assert_eq!(provider.info().id, "scripted");

        let req = ChatCompletionRequest::new("m", vec![Message::user("hi")]);
        let err = provider.chat_completion(req.clone()).await.unwrap_err();
        assert!(matches!(err, AiError::Provider(_)));

        let response = provider.chat_completion(req).await.unwrap();
        assert_eq!(response.first_text().as_deref(), Some("ok"));
        assert_eq!(inner.calls(), 2);
    }
}
