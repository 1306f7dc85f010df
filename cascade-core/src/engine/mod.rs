//! Multi-backend execution engine.
//!
//! This module provides the fallthrough loop that sits between a caller's
//! unit of work and an ordered list of interchangeable backends:
//! - `run` / `run_async` try backends in order and return the first success
//! - `run_batch_async` gathers many runs under a concurrency bound
//! - every try is recorded in an [`ExecutionSession`] ledger

pub mod attempt;
pub mod executor;

pub use attempt::{Attempt, ExecutionSession, Stage, Termination, TokenUsage};
pub use executor::{ExecutionEngine, ExecutionEngineBuilder, StopCallback, StopCheck};
