//! Runtime layer.
//!
//! This module sits between the high-level API (`generate_text`,
//! `generate_object`, `stream_text`) and the provider interface. It is
//! responsible for:
//! - Running each request as a unit of work across the configured backends
//! - Selecting a JSON output strategy per provider (JSON Schema vs JSON Mode)
//! - Validating structured responses against registered schemas
//! - Feeding streamed deltas into a harness

pub mod executor;

pub use executor::{Runtime, RuntimeBuilder};
