//! # Cascade
//!
//! Run one unit of work against an ordered list of LLM backends, keep a
//! ledger of every attempt, coerce structured output into shape, and relay
//! streamed turns to a listener with heartbeats.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! cascade = { version = "0.1", features = ["openai", "layers"] }
//! ```
//!
//! ```ignore
//! use cascade::prelude::*;
//! use cascade::provider::{deepseek, OpenAiDescriptor};
//! use cascade::layer::RetryLayer;
//!
//! # async fn example() -> cascade::Result<()> {
//! let runtime = Runtime::builder()
//!     .backend(LayeredDescriptor::new(OpenAiDescriptor::new("gpt-4o-mini")).layer(RetryLayer::new()))
//!     .backend(deepseek("deepseek-chat"))
//!     .build()?;
//!
//! let result = runtime
//!     .generate_text(TextParams::new(vec![Message::user("What is Rust?")]))
//!     .await?;
//! println!("{} answered: {}", result.backend_id, result.content);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `default`: `openai`, `layers` and `schema`
//! - `openai`: OpenAI-compatible providers and descriptors
//! - `layers`: Built-in layers (logging, retry)
//! - `schema`: Re-export of `schemars` for deriving `JsonSchema`
//! - `full`: All features enabled

// Re-export core types and traits
pub use cascade_core::*;

// Re-export providers under `provider` module
#[cfg(feature = "cascade-provider")]
pub mod provider {
    //! Provider implementations and backend descriptors.
    pub use cascade_provider::*;
}

// Re-export layers under `layer` module
#[cfg(feature = "cascade-layer")]
pub mod layer {
    //! Built-in provider layers.
    pub use cascade_layer::*;
}

// Re-export schemars when schema feature is enabled
#[cfg(feature = "schema")]
pub mod schemars {
    pub use ::schemars::*;
}

/// Prelude module for convenient imports
pub mod prelude {
    //! Prelude module containing the most commonly used types and traits.
    //!
    //! ```
    //! use cascade::prelude::*;
    //! ```

    pub use crate::{
        AiError, BackendDescriptor, ChunkKind, EngineConfig, EventListener, ExecutionEngine,
        LayeredDescriptor, Layer, Message, Provider, ProviderDescriptor, Relay, Result, Role,
        Runtime, SchemaPolicy, StreamHarness, Structured, TextParams, WireEvent,
    };

    #[cfg(feature = "cascade-provider")]
    pub use crate::provider::*;

    #[cfg(feature = "cascade-layer")]
    pub use crate::layer::*;
}
