//! Forwarding harness events to a remote listener.

use super::event::{StreamEvent, WireEvent};
use crate::config::EngineConfig;
use crate::error::AiError;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;

/// Remote end of a relayed stream, e.g. an SSE response body.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Deliver one event; an error stops the relay
    async fn send(&self, event: WireEvent) -> Result<(), AiError>;
}

/// How a relay run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Events forwarded, heartbeats included
    pub forwarded: usize,
    pub heartbeats: usize,
    /// Whether the harness produced the terminal event itself
    pub terminated_by_producer: bool,
}

/// Drains one turn's queue, injecting heartbeats while the producer is idle.
#[derive(Debug, Clone, Copy)]
pub struct Relay {
    heartbeat_interval: Duration,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(EngineConfig::DEFAULT_HEARTBEAT)
    }
}

impl Relay {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self { heartbeat_interval }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.heartbeat_interval)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Turn a harness queue into a stream of wire events.
    ///
    /// The stream ends right after the first `stream.complete` or
    /// `stream.error`. If the producer goes away without one, a synthetic
    /// `stream.error` closes the turn.
    pub fn into_stream(
        self,
        rx: mpsc::Receiver<StreamEvent>,
    ) -> impl Stream<Item = WireEvent> + Send + 'static {
        self.relayed(rx).map(|relayed| relayed.wire)
    }

    /// Forward every event of the turn to `listener`
    pub async fn run<L>(
        &self,
        rx: mpsc::Receiver<StreamEvent>,
        listener: &L,
    ) -> Result<RelayOutcome, AiError>
    where
        L: EventListener + ?Sized,
    {
        let mut outcome = RelayOutcome {
            forwarded: 0,
            heartbeats: 0,
            terminated_by_producer: false,
        };

        let events = self.relayed(rx);
        futures::pin_mut!(events);

        while let Some(Relayed { wire, origin }) = events.next().await {
            let terminal = wire.is_terminal();
            listener.send(wire).await?;
            outcome.forwarded += 1;
            match origin {
                Origin::Heartbeat => outcome.heartbeats += 1,
                Origin::Producer if terminal => outcome.terminated_by_producer = true,
                _ => {}
            }
        }

        tracing::debug!(
            "Relay finished: {} events ({} heartbeats)",
            outcome.forwarded,
            outcome.heartbeats
        );
        Ok(outcome)
    }

    fn relayed(self, mut rx: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = Relayed> + Send + 'static {
        let interval = self.heartbeat_interval;
        async_stream::stream! {
            let mut turn = (String::new(), String::new());
            loop {
                match tokio::time::timeout(interval, rx.recv()).await {
                    Ok(Some(event)) => {
                        if let Some((conversation_id, response_id)) = event.turn() {
                            turn = (conversation_id.to_string(), response_id.to_string());
                        }
                        let terminal = event.is_terminal();
                        yield Relayed { wire: event.to_wire(), origin: Origin::Producer };
                        if terminal {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(
                            "Stream for response '{}' closed without a terminal event",
                            turn.1
                        );
                        let closed = StreamEvent::error(
                            turn.0.clone(),
                            turn.1.clone(),
                            "stream closed before completion",
                        );
                        yield Relayed { wire: closed.to_wire(), origin: Origin::Synthetic };
                        break;
                    }
                    Err(_) => {
                        tracing::trace!("No stream event for {:?}, sending heartbeat", interval);
                        yield Relayed {
                            wire: StreamEvent::heartbeat().to_wire(),
                            origin: Origin::Heartbeat,
                        };
                    }
                }
            }
        }
    }
}

enum Origin {
    Producer,
    Heartbeat,
    Synthetic,
}

struct Relayed {
    wire: WireEvent,
    origin: Origin,
}
