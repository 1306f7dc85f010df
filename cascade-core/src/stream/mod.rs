//! Streaming harness and relay.
//!
//! A [`StreamHarness`] buffers one turn's deltas and queues its events; a
//! [`Relay`] drains that queue toward an [`EventListener`], adding heartbeats
//! while the producer is idle.

pub mod event;
pub mod harness;
pub mod relay;

pub use event::{
    ChunkKind, StreamEvent, StreamSummary, WireEvent, CHUNK_EVENT, COMPLETE_EVENT, ERROR_EVENT,
    HEARTBEAT_EVENT, INIT_EVENT,
};
pub use harness::{HarnessState, StreamHarness, WorkerEmitter};
pub use relay::{EventListener, Relay, RelayOutcome};
