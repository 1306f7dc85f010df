//! # Cascade Core
//!
//! Core abstractions for running inference across interchangeable backends.
//!
//! This crate provides:
//! - [`engine`]: the fallthrough execution engine and its attempt ledger
//! - [`schema`]: schema registration and lenient validation of structured output
//! - [`stream`]: the per-turn streaming harness and the heartbeat relay
//! - [`runtime`]: high-level generation APIs built on the three above

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod layer;
pub mod provider;
pub mod runtime;
pub mod schema;
pub mod strategy;
pub mod stream;
pub mod types;

// Re-exports
pub use backend::{BackendDescriptor, LayeredDescriptor, ProviderDescriptor, SharedDescriptor};
pub use config::EngineConfig;
pub use engine::{
    Attempt, ExecutionEngine, ExecutionEngineBuilder, ExecutionSession, Stage, StopCallback,
    StopCheck, Termination, TokenUsage,
};
pub use error::{AiError, ExhaustedBackends};
pub use layer::Layer;
pub use provider::{ChatCompletionStream, ModelHandle, Provider};
pub use runtime::{Runtime, RuntimeBuilder};
pub use schema::{PolicyStore, SchemaEntry, SchemaPolicy, SchemaRegistry, SchemaValidator, Structured};
pub use strategy::{JsonModeStrategy, JsonOutputStrategy, JsonSchemaStrategy};
pub use stream::{ChunkKind, EventListener, Relay, StreamEvent, StreamHarness, WireEvent, WorkerEmitter};
pub use types::*;

/// Result type alias for Cascade operations
pub type Result<T> = std::result::Result<T, AiError>;
