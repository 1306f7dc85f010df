//! Per-turn buffering of streamed deltas.

use super::event::{ChunkKind, StreamEvent, StreamSummary};
use crate::error::AiError;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default bound of the harness event queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Lifecycle of one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Started,
    Streaming,
    Completed,
    Errored,
}

impl HarnessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HarnessState::Completed | HarnessState::Errored)
    }
}

/// Buffers one turn's deltas and queues its events for a [`Relay`].
///
/// The harness lives on a single task. Workers running on the blocking pool
/// reach it only through a [`WorkerEmitter`], see [`StreamHarness::drive_worker`].
///
/// [`Relay`]: super::Relay
#[derive(Debug)]
pub struct StreamHarness {
    conversation_id: String,
    response_id: String,
    model_key: String,
    text: String,
    reasoning: Vec<String>,
    json_chunks: Vec<String>,
    usage: Map<String, Value>,
    error: Option<String>,
    summary: Option<StreamSummary>,
    state: HarnessState,
    init_sent: bool,
    capacity: usize,
    tx: mpsc::Sender<StreamEvent>,
    rx: Option<mpsc::Receiver<StreamEvent>>,
}

impl StreamHarness {
    pub fn new(
        conversation_id: impl Into<String>,
        response_id: impl Into<String>,
        model_key: impl Into<String>,
    ) -> Self {
        Self::with_capacity(conversation_id, response_id, model_key, DEFAULT_QUEUE_CAPACITY)
    }

    /// Fresh conversation and response ids for `model_key`
    pub fn for_model(model_key: impl Into<String>) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
            model_key,
        )
    }

    pub fn with_capacity(
        conversation_id: impl Into<String>,
        response_id: impl Into<String>,
        model_key: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            conversation_id: conversation_id.into(),
            response_id: response_id.into(),
            model_key: model_key.into(),
            text: String::new(),
            reasoning: Vec::new(),
            json_chunks: Vec::new(),
            usage: Map::new(),
            error: None,
            summary: None,
            state: HarnessState::Started,
            init_sent: false,
            capacity,
            tx,
            rx: Some(rx),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    /// Frozen summary, once the turn completed normally
    pub fn summary(&self) -> Option<&StreamSummary> {
        self.summary.as_ref()
    }

    /// Message of the error that ended the turn
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Consumer end of this turn's queue; `None` once taken
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.rx.take()
    }

    /// Start a new turn in the same conversation.
    ///
    /// Buffers and queue are replaced; take the new receiver afterwards.
    pub fn reset_for_response(&mut self, response_id: impl Into<String>, model_key: Option<String>) {
        self.response_id = response_id.into();
        if let Some(model_key) = model_key {
            self.model_key = model_key;
        }
        self.text.clear();
        self.reasoning.clear();
        self.json_chunks.clear();
        self.usage = Map::new();
        self.error = None;
        self.summary = None;
        self.state = HarnessState::Started;
        self.init_sent = false;

        let (tx, rx) = mpsc::channel(self.capacity);
        self.tx = tx;
        self.rx = Some(rx);
    }

    /// Name the backend serving this turn. Ignored once `init` went out.
    pub fn set_model_key(&mut self, model_key: impl Into<String>) {
        if self.init_sent {
            tracing::debug!("Model key for response {} already announced", self.response_id);
            return;
        }
        self.model_key = model_key.into();
    }

    /// Queue the turn's `init` event; only the first call per turn emits
    pub async fn emit_init(&mut self) -> Result<(), AiError> {
        if self.state.is_terminal() || self.init_sent {
            return Ok(());
        }
        self.init_sent = true;
        self.state = HarnessState::Streaming;
        self.push(StreamEvent::Init {
            conversation_id: self.conversation_id.clone(),
            response_id: self.response_id.clone(),
            model_key: self.model_key.clone(),
            started_at: Utc::now(),
        })
        .await
    }

    /// Buffer `delta` and queue it as a chunk event
    pub async fn emit_chunk(&mut self, kind: ChunkKind, delta: impl Into<String>) -> Result<(), AiError> {
        if self.state.is_terminal() {
            tracing::debug!(
                "Dropping {} chunk for finished response {}",
                kind.as_str(),
                self.response_id
            );
            return Ok(());
        }
        let delta = delta.into();
        match kind {
            ChunkKind::Text => self.text.push_str(&delta),
            ChunkKind::Reasoning => self.reasoning.push(delta.clone()),
            ChunkKind::Json => self.json_chunks.push(delta.clone()),
        }
        self.state = HarnessState::Streaming;
        self.push(StreamEvent::Chunk {
            conversation_id: self.conversation_id.clone(),
            response_id: self.response_id.clone(),
            kind,
            delta,
            timestamp: Utc::now(),
        })
        .await
    }

    /// Freeze the buffers and queue the terminal `complete` event.
    ///
    /// No-op once the turn has ended.
    pub async fn emit_complete(&mut self, usage: Map<String, Value>) -> Result<(), AiError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.usage = usage;
        let summary = StreamSummary {
            text: self.text.clone(),
            reasoning: self.reasoning.join("\n"),
            json_chunks: self.json_chunks.clone(),
            usage: self.usage.clone(),
        };
        self.summary = Some(summary.clone());
        self.state = HarnessState::Completed;
        self.push(StreamEvent::Complete {
            conversation_id: self.conversation_id.clone(),
            response_id: self.response_id.clone(),
            completed_at: Utc::now(),
            summary,
        })
        .await
    }

    /// Queue the terminal `error` event; no-op once the turn has ended
    pub async fn emit_error(&mut self, message: impl Into<String>) -> Result<(), AiError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let message = message.into();
        self.error = Some(message.clone());
        self.state = HarnessState::Errored;
        self.push(StreamEvent::error(
            self.conversation_id.clone(),
            self.response_id.clone(),
            message,
        ))
        .await
    }

    async fn push(&self, event: StreamEvent) -> Result<(), AiError> {
        self.tx.send(event).await.map_err(|_| {
            AiError::stream(format!(
                "listener for response {} is gone",
                self.response_id
            ))
        })
    }

    /// Run a blocking inference loop on the worker pool.
    ///
    /// The worker emits through a [`WorkerEmitter`]; its commands are applied
    /// here, on the task owning the harness. A successful return completes
    /// the turn with the returned usage, an error is routed into
    /// `stream.error` and handed back to the caller.
    pub async fn drive_worker<F>(&mut self, work: F) -> Result<(), AiError>
    where
        F: FnOnce(WorkerEmitter) -> Result<Map<String, Value>, AiError> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(self.capacity);
        let worker = tokio::task::spawn_blocking(move || work(WorkerEmitter { tx }));

        let mut delivery: Result<(), AiError> = Ok(());
        while let Some(command) = rx.recv().await {
            if let Err(e) = self.apply(command).await {
                if delivery.is_ok() {
                    tracing::warn!("Stream delivery failed: {}", e);
                    delivery = Err(e);
                }
            }
        }

        let outcome = match worker.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(AiError::stream(format!("worker failed: {}", join_error))),
        };

        match outcome {
            Ok(usage) => {
                self.emit_complete(usage).await?;
                delivery
            }
            Err(err) => {
                tracing::error!("Worker for response {} failed: {}", self.response_id, err);
                if let Err(e) = self.emit_error(err.to_string()).await {
                    tracing::debug!("Could not deliver stream error: {}", e);
                }
                Err(err)
            }
        }
    }

    async fn apply(&mut self, command: HarnessCommand) -> Result<(), AiError> {
        match command {
            HarnessCommand::Init => self.emit_init().await,
            HarnessCommand::Chunk(kind, delta) => self.emit_chunk(kind, delta).await,
            HarnessCommand::Complete(usage) => self.emit_complete(usage).await,
            HarnessCommand::Error(message) => self.emit_error(message).await,
        }
    }
}

#[derive(Debug)]
enum HarnessCommand {
    Init,
    Chunk(ChunkKind, String),
    Complete(Map<String, Value>),
    Error(String),
}

/// Emitting handle for code running off the harness's task.
///
/// Every call blocks the calling thread until the harness task has room; do
/// not use it from async code.
#[derive(Debug, Clone)]
pub struct WorkerEmitter {
    tx: mpsc::Sender<HarnessCommand>,
}

impl WorkerEmitter {
    pub fn emit_init(&self) -> Result<(), AiError> {
        self.send(HarnessCommand::Init)
    }

    pub fn emit_chunk(&self, kind: ChunkKind, delta: impl Into<String>) -> Result<(), AiError> {
        self.send(HarnessCommand::Chunk(kind, delta.into()))
    }

    pub fn emit_complete(&self, usage: Map<String, Value>) -> Result<(), AiError> {
        self.send(HarnessCommand::Complete(usage))
    }

    pub fn emit_error(&self, message: impl Into<String>) -> Result<(), AiError> {
        self.send(HarnessCommand::Error(message.into()))
    }

    fn send(&self, command: HarnessCommand) -> Result<(), AiError> {
        self.tx
            .blocking_send(command)
            .map_err(|_| AiError::stream("harness is no longer accepting events"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event::{COMPLETE_EVENT, ERROR_EVENT};

    fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_text_chunks_join_into_summary() {
        let mut harness = StreamHarness::new("conv", "resp-1", "gpt-4o-mini");
        let mut rx = harness.take_receiver().unwrap();

        harness.emit_init().await.unwrap();
        harness.emit_chunk(ChunkKind::Text, "A").await.unwrap();
        harness.emit_chunk(ChunkKind::Text, "B").await.unwrap();
        harness.emit_complete(Map::new()).await.unwrap();

        let summary = harness.summary().unwrap();
        assert_eq!(summary.text, "AB");
        assert_eq!(summary.reasoning, "");
        assert_eq!(harness.state(), HarnessState::Completed);

        let events = drain(&mut rx);
        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["stream.init", "stream.chunk", "stream.chunk", COMPLETE_EVENT]);
        match &events[2] {
            StreamEvent::Chunk { delta, .. } => assert_eq!(delta, "B"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_model_key_fixed_once_announced() {
        let mut harness = StreamHarness::new("conv", "resp-1", "pending");
        let mut rx = harness.take_receiver().unwrap();

        harness.set_model_key("openai:gpt-4o-mini");
        harness.emit_init().await.unwrap();
        harness.set_model_key("other:m");
        harness.emit_init().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Init { model_key, .. } => assert_eq!(model_key, "openai:gpt-4o-mini"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nothing_after_terminal_event() {
        let mut harness = StreamHarness::new("conv", "resp-1", "m");
        let mut rx = harness.take_receiver().unwrap();

        harness.emit_chunk(ChunkKind::Text, "A").await.unwrap();
        harness.emit_complete(Map::new()).await.unwrap();
        harness.emit_chunk(ChunkKind::Text, "late").await.unwrap();
        harness.emit_init().await.unwrap();
        harness.emit_error("too late").await.unwrap();
        harness.emit_complete(Map::new()).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
        assert_eq!(harness.summary().unwrap().text, "A");
        assert!(harness.error().is_none());
    }

    #[tokio::test]
    async fn test_error_ends_turn() {
        let mut harness = StreamHarness::new("conv", "resp-1", "m");
        let mut rx = harness.take_receiver().unwrap();

        harness.emit_chunk(ChunkKind::Text, "partial").await.unwrap();
        harness.emit_error("backend dropped").await.unwrap();
        harness.emit_complete(Map::new()).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.last().map(|e| e.name()), Some(ERROR_EVENT));
        assert_eq!(events.len(), 2);
        assert!(harness.summary().is_none());
        assert_eq!(harness.state(), HarnessState::Errored);
    }

    #[tokio::test]
    async fn test_reset_starts_empty_turn() {
        let mut harness = StreamHarness::new("conv", "resp-1", "m");
        harness.emit_chunk(ChunkKind::Text, "old").await.unwrap();
        harness.emit_complete(Map::new()).await.unwrap();

        harness.reset_for_response("resp-2", Some("other-model".into()));
        let mut rx = harness.take_receiver().unwrap();
        harness.emit_complete(Map::new()).await.unwrap();

        assert_eq!(harness.summary().unwrap().text, "");
        assert_eq!(harness.conversation_id(), "conv");
        assert_eq!(harness.response_id(), "resp-2");
        assert_eq!(harness.model_key(), "other-model");
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_buffers_by_kind() {
        let mut harness = StreamHarness::new("conv", "resp", "m");
        harness.emit_chunk(ChunkKind::Reasoning, "step one").await.unwrap();
        harness.emit_chunk(ChunkKind::Json, "{\"a\":").await.unwrap();
        harness.emit_chunk(ChunkKind::Reasoning, "step two").await.unwrap();
        harness.emit_chunk(ChunkKind::Json, "1}").await.unwrap();

        let mut usage = Map::new();
        usage.insert("totalTokens".into(), 9.into());
        harness.emit_complete(usage).await.unwrap();

        let summary = harness.summary().unwrap();
        assert_eq!(summary.reasoning, "step one\nstep two");
        assert_eq!(summary.json_chunks, vec!["{\"a\":", "1}"]);
        assert_eq!(summary.usage["totalTokens"], 9);
    }

    #[tokio::test]
    async fn test_emit_fails_without_listener() {
        let mut harness = StreamHarness::new("conv", "resp", "m");
        drop(harness.take_receiver());
        let err = harness.emit_chunk(ChunkKind::Text, "x").await.unwrap_err();
        assert!(matches!(err, AiError::Stream(_)));
    }

    #[tokio::test]
    async fn test_drive_worker_completes_turn() {
        let mut harness = StreamHarness::new("conv", "resp", "m");
        let mut rx = harness.take_receiver().unwrap();

        harness
            .drive_worker(|emitter| {
                emitter.emit_init()?;
                for part in ["Hel", "lo"] {
                    emitter.emit_chunk(ChunkKind::Text, part)?;
                }
                let mut usage = Map::new();
                usage.insert("totalTokens".into(), 3.into());
                Ok(usage)
            })
            .await
            .unwrap();

        assert_eq!(harness.summary().unwrap().text, "Hello");
        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].name(), COMPLETE_EVENT);
    }

    #[tokio::test]
    async fn test_drive_worker_routes_failure() {
        let mut harness = StreamHarness::new("conv", "resp", "m");
        let mut rx = harness.take_receiver().unwrap();

        let err = harness
            .drive_worker(|emitter| {
                emitter.emit_chunk(ChunkKind::Text, "partial")?;
                Err(AiError::provider("connection reset"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AiError::Provider(_)));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[1] {
            StreamEvent::Error { error, .. } => assert!(error.contains("connection reset")),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
