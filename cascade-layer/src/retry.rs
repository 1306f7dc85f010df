//! Retry layer with exponential backoff.

use async_trait::async_trait;
use cascade_core::error::AiError;
use cascade_core::layer::Layer;
use cascade_core::provider::{ChatCompletionStream, Provider};
use cascade_core::types::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retries network, timeout and rate-limit errors against the same backend.
///
/// Everything else, including cancellation, is returned at once so the
/// engine can fall through to the next backend.
#[derive(Debug, Clone)]
pub struct RetryLayer {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl RetryLayer {
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(retry as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

impl Default for RetryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for RetryLayer {
    fn layer(&self, inner: Arc<dyn Provider>) -> Arc<dyn Provider> {
        Arc::new(RetryProvider {
            inner,
            config: self.clone(),
        })
    }
}

/// Provider wrapped with retry logic
#[derive(Debug)]
pub struct RetryProvider {
    inner: Arc<dyn Provider>,
    config: RetryLayer,
}

impl RetryProvider {
    async fn execute_with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, AiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() || retry >= self.config.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.config.delay_for(retry);
                    tracing::warn!(
                        "{} retry {}/{} in {:?} after: {}",
                        self.inner.info().id,
                        retry + 1,
                        self.config.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Provider for RetryProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.inner.info()
    }

    async fn chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, AiError> {
        self.execute_with_retry(|| {
            let req = req.clone();
            async move { self.inner.chat_completion(req).await }
        })
        .await
    }

    /// Only opening the stream is retried, never a stream in progress
    async fn stream_chat_completion(
        &self,
        req: ChatCompletionRequest,
    ) -> Result<Box<ChatCompletionStream>, AiError> {
        self.execute_with_retry(|| {
            let req = req.clone();
            async move { self.inner.stream_chat_completion(req).await }
        })
        .await
    }
}
