//! Attempt ledger types.

use crate::error::AiError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Where in a backend try the outcome was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Obtaining a live handle from the descriptor
    Construction,
    /// Running the unit of work against the handle
    Execution,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Construction => f.write_str("construction"),
            Stage::Execution => f.write_str("execution"),
        }
    }
}

/// Token counts attached to a successful attempt after the fact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// One try against one backend.
///
/// The successful value itself is returned to the caller rather than kept
/// here; failures keep the error that ended the attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub id: Uuid,
    pub backend_id: String,
    pub stage: Stage,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<Arc<AiError>>,
    pub tokens: Option<TokenUsage>,
}

impl Attempt {
    pub fn succeeded(backend_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id: backend_id.into(),
            stage: Stage::Execution,
            success: true,
            duration,
            error: None,
            tokens: None,
        }
    }

    pub fn failed(
        backend_id: impl Into<String>,
        stage: Stage,
        duration: Duration,
        error: Arc<AiError>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id: backend_id.into(),
            stage,
            success: false,
            duration,
            error: Some(error),
            tokens: None,
        }
    }

    /// Reuse an id that was already attached to the attempt's tracing span
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }
}

/// Why a run stopped iterating backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Succeeded,
    Exhausted,
    /// Cancellation signal, with its reason
    StopRequested(String),
    /// The stop callback failed with something other than cancellation
    CallbackFailed(String),
}

/// Ordered attempts of one logical call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSession {
    attempts: Vec<Attempt>,
    termination: Option<Termination>,
}

impl ExecutionSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// `None` while the run is still in progress
    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub(crate) fn push(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    pub(crate) fn terminate(&mut self, termination: Termination) {
        self.termination = Some(termination);
    }

    /// Attach token counts to the last attempt if it succeeded.
    ///
    /// Returns whether anything was recorded. `total` defaults to
    /// `input + output`.
    pub fn annotate_tokens(&mut self, input: u64, output: u64, total: Option<u64>) -> bool {
        let Some(last) = self.attempts.last_mut() else {
            tracing::warn!("set_last_attempt_tokens: no attempts recorded yet");
            return false;
        };
        annotate(last, input, output, total)
    }

    /// Attach token counts to the attempt with `attempt_id`, if this session
    /// holds it and it succeeded
    pub fn annotate_attempt(&mut self, attempt_id: Uuid, input: u64, output: u64, total: Option<u64>) -> bool {
        match self.attempts.iter_mut().find(|a| a.id == attempt_id) {
            Some(attempt) => annotate(attempt, input, output, total),
            None => {
                tracing::debug!("Attempt {} is not in the published session", attempt_id);
                false
            }
        }
    }
}

fn annotate(attempt: &mut Attempt, input: u64, output: u64, total: Option<u64>) -> bool {
    if !attempt.success {
        tracing::warn!(
            "Token usage not recorded: attempt {} was not successful (stage={})",
            attempt.id,
            attempt.stage
        );
        return false;
    }

    let usage = TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: total.unwrap_or(input + output),
    };
    tracing::debug!(
        "Token usage recorded: input={}, output={}, total={}",
        usage.input_tokens,
        usage.output_tokens,
        usage.total_tokens
    );
    attempt.tokens = Some(usage);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate_tokens_on_success() {
        let mut session = ExecutionSession::new();
        session.push(Attempt::succeeded("a", Duration::from_millis(1)));

        assert!(session.annotate_tokens(120, 30, None));
        let tokens = session.last_attempt().and_then(|a| a.tokens).unwrap();
        assert_eq!(tokens.total_tokens, 150);

        assert!(session.annotate_tokens(1, 2, Some(10)));
        assert_eq!(session.last_attempt().unwrap().tokens.unwrap().total_tokens, 10);
    }

    #[test]
    fn test_annotate_tokens_noop_without_success() {
        let mut session = ExecutionSession::new();
        assert!(!session.annotate_tokens(1, 1, None));

        session.push(Attempt::failed(
            "a",
            Stage::Execution,
            Duration::ZERO,
            Arc::new(AiError::provider("boom")),
        ));
        assert!(!session.annotate_tokens(1, 1, None));
        assert!(session.last_attempt().unwrap().tokens.is_none());
    }

    #[test]
    fn test_annotate_attempt_by_id() {
        let mut session = ExecutionSession::new();
        let attempt = Attempt::succeeded("a", Duration::from_millis(1));
        let id = attempt.id;
        session.push(attempt);

        assert!(!session.annotate_attempt(Uuid::new_v4(), 5, 5, None));
        assert!(session.last_attempt().unwrap().tokens.is_none());

        assert!(session.annotate_attempt(id, 5, 5, None));
        assert_eq!(session.last_attempt().unwrap().tokens.unwrap().total_tokens, 10);
    }
}
