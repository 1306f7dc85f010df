//! Stream events and their wire form.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const INIT_EVENT: &str = "stream.init";
pub const CHUNK_EVENT: &str = "stream.chunk";
pub const COMPLETE_EVENT: &str = "stream.complete";
pub const ERROR_EVENT: &str = "stream.error";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Which harness buffer a delta belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Primary answer text
    Text,
    /// Secondary reasoning text
    Reasoning,
    /// Structured output fragment
    Json,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Text => "text",
            ChunkKind::Reasoning => "reasoning",
            ChunkKind::Json => "json",
        }
    }
}

/// Frozen buffers of a completed turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub text: String,
    /// Reasoning parts joined with newlines, empty if none
    pub reasoning: String,
    pub json_chunks: Vec<String>,
    pub usage: Map<String, Value>,
}

/// One event of a turn, as queued by the harness.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Init {
        conversation_id: String,
        response_id: String,
        model_key: String,
        started_at: DateTime<Utc>,
    },
    Chunk {
        conversation_id: String,
        response_id: String,
        kind: ChunkKind,
        delta: String,
        timestamp: DateTime<Utc>,
    },
    Complete {
        conversation_id: String,
        response_id: String,
        completed_at: DateTime<Utc>,
        summary: StreamSummary,
    },
    Error {
        conversation_id: String,
        response_id: String,
        timestamp: DateTime<Utc>,
        error: String,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    pub fn heartbeat() -> Self {
        StreamEvent::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    pub fn error(
        conversation_id: impl Into<String>,
        response_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        StreamEvent::Error {
            conversation_id: conversation_id.into(),
            response_id: response_id.into(),
            timestamp: Utc::now(),
            error: error.into(),
        }
    }

    /// Listener-facing event name
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Init { .. } => INIT_EVENT,
            StreamEvent::Chunk { .. } => CHUNK_EVENT,
            StreamEvent::Complete { .. } => COMPLETE_EVENT,
            StreamEvent::Error { .. } => ERROR_EVENT,
            StreamEvent::Heartbeat { .. } => HEARTBEAT_EVENT,
        }
    }

    /// Complete and error end a turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    /// `(conversation_id, response_id)` for turn-scoped events
    pub fn turn(&self) -> Option<(&str, &str)> {
        match self {
            StreamEvent::Init {
                conversation_id,
                response_id,
                ..
            }
            | StreamEvent::Chunk {
                conversation_id,
                response_id,
                ..
            }
            | StreamEvent::Complete {
                conversation_id,
                response_id,
                ..
            }
            | StreamEvent::Error {
                conversation_id,
                response_id,
                ..
            } => Some((conversation_id.as_str(), response_id.as_str())),
            StreamEvent::Heartbeat { .. } => None,
        }
    }

    pub fn to_wire(&self) -> WireEvent {
        let data = match self {
            StreamEvent::Init {
                conversation_id,
                response_id,
                model_key,
                started_at,
            } => json!({
                "conversationId": conversation_id,
                "responseId": response_id,
                "modelKey": model_key,
                "startedAt": rfc3339(started_at),
            }),
            StreamEvent::Chunk {
                conversation_id,
                response_id,
                kind,
                delta,
                timestamp,
            } => json!({
                "conversationId": conversation_id,
                "responseId": response_id,
                "kind": kind.as_str(),
                "delta": delta,
                "timestamp": rfc3339(timestamp),
            }),
            StreamEvent::Complete {
                conversation_id,
                response_id,
                completed_at,
                summary,
            } => json!({
                "conversationId": conversation_id,
                "responseId": response_id,
                "completedAt": rfc3339(completed_at),
                "summary": {
                    "text": summary.text,
                    "reasoning": summary.reasoning,
                    "jsonChunks": summary.json_chunks,
                    "usage": summary.usage,
                },
            }),
            StreamEvent::Error {
                conversation_id,
                response_id,
                timestamp,
                error,
            } => json!({
                "conversationId": conversation_id,
                "responseId": response_id,
                "timestamp": rfc3339(timestamp),
                "error": error,
            }),
            StreamEvent::Heartbeat { timestamp } => json!({
                "timestamp": rfc3339(timestamp),
            }),
        };

        WireEvent {
            event: self.name().to_string(),
            data,
        }
    }
}

fn rfc3339(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Named event with a JSON body, as delivered to a remote listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    pub data: Value,
}

impl WireEvent {
    pub fn is_terminal(&self) -> bool {
        self.event == COMPLETE_EVENT || self.event == ERROR_EVENT
    }

    /// Server-Sent Events frame: `event:` line, `data:` line, blank line
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}
