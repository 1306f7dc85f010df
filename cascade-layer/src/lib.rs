//! # Cascade Layers
//!
//! Provider layers applied to every handle a descriptor constructs.
//!
//! - `LoggingLayer`: logs provider calls with timing and token usage
//! - `RetryLayer`: retries retryable errors with exponential backoff
//!
//! ## Usage
//!
//! ```ignore
//! use cascade_core::LayeredDescriptor;
//! use cascade_layer::{LoggingLayer, RetryLayer};
//!
//! let backend = LayeredDescriptor::new(OpenAiDescriptor::new("gpt-4o-mini"))
//!     .layer(RetryLayer::new().with_max_retries(2))
//!     .layer(LoggingLayer::new());
//! ```
//!
//! Retries happen inside one attempt; the engine only sees the final outcome.

pub mod logging;
pub mod retry;

// Re-exports
pub use logging::LoggingLayer;
pub use retry::RetryLayer;
