//! Layer trait for wrapping providers.
//!
//! Layers provide a composable way to wrap a constructed provider with
//! cross-cutting concerns like logging and retry. They are applied per handle
//! by [`LayeredDescriptor`](crate::backend::LayeredDescriptor), so every
//! backend in a fallthrough list can carry the same middleware.

use crate::provider::Provider;
use std::sync::Arc;

/// Wraps an inner provider and returns a provider with extra behavior.
pub trait Layer: Send + Sync + std::fmt::Debug + 'static {
    /// Wrap the inner provider with this layer
    fn layer(&self, inner: Arc<dyn Provider>) -> Arc<dyn Provider>;
}
