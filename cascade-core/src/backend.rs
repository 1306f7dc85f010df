//! Backend descriptors: how the engine obtains a live handle.

use crate::error::AiError;
use crate::layer::Layer;
use crate::provider::{ModelHandle, Provider};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Identity plus the capability to construct a live backend handle.
///
/// Descriptors are immutable. The engine tries them in list order and a
/// failing `construct` is recorded as a construction-stage attempt.
#[async_trait]
pub trait BackendDescriptor: Send + Sync + Debug + 'static {
    /// The live handle passed to a unit of work
    type Handle: Send + 'static;

    /// Stable identity used in the attempt ledger and logs
    fn id(&self) -> &str;

    /// Construct a live handle
    fn construct(&self) -> Result<Self::Handle, AiError>;

    /// Construct a live handle from async code.
    ///
    /// Descriptors that need I/O to come up (e.g. probing a local server)
    /// override this; the default defers to [`construct`](Self::construct).
    async fn construct_async(&self) -> Result<Self::Handle, AiError> {
        self.construct()
    }
}

/// Shared, type-erased descriptor
pub type SharedDescriptor<H> = Arc<dyn BackendDescriptor<Handle = H>>;

/// Descriptor around an already-built provider instance.
///
/// Construction always succeeds and hands out the same provider each time.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    id: String,
    provider: Arc<dyn Provider>,
    model: String,
}

impl ProviderDescriptor {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        let model = model.into();
        let id = format!("{}:{}", provider.info().id, model);
        Self {
            id,
            provider,
            model,
        }
    }

    /// Override the identity shown in the ledger
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[async_trait]
impl BackendDescriptor for ProviderDescriptor {
    type Handle = ModelHandle;

    fn id(&self) -> &str {
        &self.id
    }

    fn construct(&self) -> Result<ModelHandle, AiError> {
        Ok(ModelHandle::new(self.provider.clone(), self.model.clone()))
    }
}

/// Applies provider layers to every handle an inner descriptor constructs.
#[derive(Debug)]
pub struct LayeredDescriptor<D> {
    inner: D,
    layers: Vec<Arc<dyn Layer>>,
}

impl<D> LayeredDescriptor<D>
where
    D: BackendDescriptor<Handle = ModelHandle>,
{
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            layers: Vec::new(),
        }
    }

    /// Add a layer. Layers wrap in insertion order, so the last one added is
    /// the outermost.
    pub fn layer(mut self, layer: impl Layer) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    fn wrap(&self, handle: ModelHandle) -> ModelHandle {
        let provider = self
            .layers
            .iter()
            .fold(handle.provider, |provider, layer| layer.layer(provider));
        ModelHandle::new(provider, handle.model)
    }
}

#[async_trait]
impl<D> BackendDescriptor for LayeredDescriptor<D>
where
    D: BackendDescriptor<Handle = ModelHandle>,
{
    type Handle = ModelHandle;

    fn id(&self) -> &str {
        self.inner.id()
    }

    fn construct(&self) -> Result<ModelHandle, AiError> {
        self.inner.construct().map(|handle| self.wrap(handle))
    }

    async fn construct_async(&self) -> Result<ModelHandle, AiError> {
        let handle = self.inner.construct_async().await?;
        Ok(self.wrap(handle))
    }
}
