//! ExecutionEngine implementation.
//!
//! The engine walks an ordered list of backend descriptors. For each one it
//! constructs a live handle, runs the caller's unit of work against it and
//! returns the first success. Every try lands in the attempt ledger; if all
//! tries fail the whole ledger is returned as [`AiError::Exhausted`].

use super::attempt::{Attempt, ExecutionSession, Stage, Termination, TokenUsage};
use crate::backend::{BackendDescriptor, SharedDescriptor};
use crate::config::EngineConfig;
use crate::error::{AiError, ExhaustedBackends};
use arc_swap::ArcSwap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

/// Parameters handed to the stop callback after every attempt.
#[derive(Debug)]
pub struct StopCheck<'a> {
    pub last_attempt: &'a Attempt,
    pub total_duration: Duration,
    pub attempt_index: usize,
    pub total_backends: usize,
}

/// Called after each attempt.
///
/// Returning [`AiError::StopRequested`] cancels the run. Any other error
/// aborts the run with that error; it is treated as a caller bug, not as an
/// attempt failure.
pub type StopCallback = Arc<dyn Fn(&StopCheck<'_>) -> Result<(), AiError> + Send + Sync>;

/// Builder for [`ExecutionEngine`].
///
/// ```ignore
/// let engine = ExecutionEngine::builder()
///     .backend(primary)
///     .backend(fallback)
///     .stop_callback(|check| if cancelled() { Err(AiError::stop_requested("ctrl-c")) } else { Ok(()) })
///     .build()?;
/// ```
pub struct ExecutionEngineBuilder<H: Send + 'static> {
    backends: Vec<SharedDescriptor<H>>,
    stop_callback: Option<StopCallback>,
    config: EngineConfig,
}

impl<H: Send + 'static> ExecutionEngineBuilder<H> {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            stop_callback: None,
            config: EngineConfig::default(),
        }
    }

    /// Append a backend; list order is priority order
    pub fn backend<D>(mut self, descriptor: D) -> Self
    where
        D: BackendDescriptor<Handle = H>,
    {
        self.backends.push(Arc::new(descriptor));
        self
    }

    /// Append an already shared backend
    pub fn shared_backend(mut self, descriptor: SharedDescriptor<H>) -> Self {
        self.backends.push(descriptor);
        self
    }

    /// Install the stop callback
    pub fn stop_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StopCheck<'_>) -> Result<(), AiError> + Send + Sync + 'static,
    {
        self.stop_callback = Some(Arc::new(callback));
        self
    }

    /// Set engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish building. Fails if no backend was added or the config is invalid.
    pub fn build(self) -> Result<ExecutionEngine<H>, AiError> {
        if self.backends.is_empty() {
            return Err(AiError::configuration("No backends provided"));
        }
        self.config.validate()?;

        Ok(ExecutionEngine {
            backends: self.backends,
            stop_callback: self.stop_callback,
            config: self.config,
            session: ArcSwap::from_pointee(ExecutionSession::new()),
        })
    }
}

impl<H: Send + 'static> Default for ExecutionEngineBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Multi-backend execution engine.
pub struct ExecutionEngine<H: Send + 'static> {
    backends: Vec<SharedDescriptor<H>>,
    stop_callback: Option<StopCallback>,
    config: EngineConfig,
    session: ArcSwap<ExecutionSession>,
}

impl<H: Send + 'static> std::fmt::Debug for ExecutionEngine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("backends", &self.backend_ids())
            .field("config", &self.config)
            .finish()
    }
}

impl<H: Send + 'static> ExecutionEngine<H> {
    /// Create a new builder
    pub fn builder() -> ExecutionEngineBuilder<H> {
        ExecutionEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend_ids(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.id()).collect()
    }

    /// Ledger of the most recent `run` / `run_async`
    pub fn session(&self) -> Arc<ExecutionSession> {
        self.session.load_full()
    }

    pub fn attempt_count(&self) -> usize {
        self.session.load().attempt_count()
    }

    pub fn last_attempt(&self) -> Option<Attempt> {
        self.session.load().last_attempt().cloned()
    }

    /// Attach token counts to the most recent attempt of the last run.
    ///
    /// A missing or failed last attempt is logged and otherwise ignored.
    /// Callers racing other runs should prefer
    /// [`run_async_metered`](Self::run_async_metered) or
    /// [`annotate_attempt`](Self::annotate_attempt).
    pub fn set_last_attempt_tokens(&self, input: u64, output: u64, total: Option<u64>) {
        self.session.rcu(|current| {
            let mut next = ExecutionSession::clone(current);
            next.annotate_tokens(input, output, total);
            next
        });
    }

    /// Attach token counts to a specific attempt of the published session.
    ///
    /// Returns false, leaving the session untouched, if a later run has
    /// already replaced the session holding that attempt.
    pub fn annotate_attempt(&self, attempt_id: Uuid, input: u64, output: u64, total: Option<u64>) -> bool {
        if !self.session.load().attempts().iter().any(|a| a.id == attempt_id) {
            tracing::debug!("Attempt {} was superseded, tokens dropped", attempt_id);
            return false;
        }

        let mut recorded = false;
        self.session.rcu(|current| {
            let mut next = ExecutionSession::clone(current);
            recorded = next.annotate_attempt(attempt_id, input, output, total);
            next
        });
        recorded
    }

    /// Run `work` against each backend in turn until one succeeds.
    pub fn run<T, F>(&self, mut work: F) -> Result<T, AiError>
    where
        F: FnMut(H) -> Result<T, AiError>,
    {
        let mut pass = Pass::new();
        let outcome = self.fallthrough(&mut pass, &mut work);
        self.session.store(Arc::new(pass.finish(&outcome)));
        outcome
    }

    /// Async version of [`run`](Self::run).
    ///
    /// The only suspension points are handle construction and the unit of
    /// work itself, so concurrent callers never wait on each other.
    pub async fn run_async<T, F, Fut>(&self, work: F) -> Result<T, AiError>
    where
        F: FnMut(H) -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
    {
        self.run_async_metered(work, |_| None).await
    }

    /// [`run_async`](Self::run_async), recording the token usage `meter`
    /// reads off the result on the winning attempt before the session is
    /// published.
    pub async fn run_async_metered<T, F, Fut, M>(&self, work: F, meter: M) -> Result<T, AiError>
    where
        F: FnMut(H) -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
        M: FnOnce(&T) -> Option<TokenUsage>,
    {
        self.run_async_identified(work, meter)
            .await
            .map(|(value, _)| value)
    }

    /// [`run_async_metered`](Self::run_async_metered), also returning the id
    /// of the winning attempt for later [`annotate_attempt`](Self::annotate_attempt).
    pub async fn run_async_identified<T, F, Fut, M>(&self, mut work: F, meter: M) -> Result<(T, Uuid), AiError>
    where
        F: FnMut(H) -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
        M: FnOnce(&T) -> Option<TokenUsage>,
    {
        let mut pass = Pass::new();
        let outcome = self.fallthrough_async(&mut pass, &mut work).await;
        let outcome = outcome.and_then(|value| {
            if let Some(tokens) = meter(&value) {
                pass.session.annotate_tokens(
                    tokens.input_tokens,
                    tokens.output_tokens,
                    Some(tokens.total_tokens),
                );
            }
            pass.session
                .last_attempt()
                .map(|attempt| (value, attempt.id))
                .ok_or_else(|| AiError::other("successful run recorded no attempt"))
        });
        self.session.store(Arc::new(pass.finish(&outcome)));
        outcome
    }

    /// Run every unit of work through `run_async`, at most
    /// `config.max_concurrent` at a time.
    ///
    /// The output has one slot per input, in input order; each slot is that
    /// item's result or error. Once any item is cancelled, items that have
    /// not started yet are cancelled with the same reason. Batch runs do not
    /// replace the engine's published session.
    pub async fn run_batch_async<T, F, Fut>(&self, works: Vec<F>) -> Vec<Result<T, AiError>>
    where
        F: FnMut(H) -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
    {
        if works.is_empty() {
            return Vec::new();
        }

        let semaphore = Semaphore::new(self.config.max_concurrent);
        let cancelled: OnceLock<String> = OnceLock::new();

        let slots = works.into_iter().enumerate().map(|(index, mut work)| {
            let semaphore = &semaphore;
            let cancelled = &cancelled;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| AiError::other("batch semaphore closed"))?;
                if let Some(reason) = cancelled.get() {
                    return Err(AiError::stop_requested(reason.clone()));
                }

                let mut pass = Pass::new();
                let result = self.fallthrough_async(&mut pass, &mut work).await;
                match &result {
                    Err(AiError::StopRequested(reason)) => {
                        tracing::info!("Batch item {} stopped: {}", index, reason);
                        let _ = cancelled.set(reason.clone());
                    }
                    Err(e) => tracing::warn!("Batch execution failed for item {}: {}", index, e),
                    Ok(_) => {}
                }
                result
            }
        });

        futures::future::join_all(slots).await
    }

    fn fallthrough<T, F>(&self, pass: &mut Pass, work: &mut F) -> Result<T, AiError>
    where
        F: FnMut(H) -> Result<T, AiError>,
    {
        for (index, backend) in self.backends.iter().enumerate() {
            let attempt_start = Instant::now();

            let handle = match backend.construct() {
                Ok(handle) => handle,
                Err(e) => {
                    self.construction_failed(pass, index, backend.id(), attempt_start, e)?;
                    continue;
                }
            };

            let attempt_id = Uuid::new_v4();
            let span = tracing::debug_span!("attempt", backend = backend.id(), %attempt_id);
            let result = span.in_scope(|| work(handle));

            if let Some(value) = self.settle(pass, index, backend.id(), attempt_id, attempt_start, result)? {
                return Ok(value);
            }
        }

        Err(pass.exhausted())
    }

    async fn fallthrough_async<T, F, Fut>(&self, pass: &mut Pass, work: &mut F) -> Result<T, AiError>
    where
        F: FnMut(H) -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
    {
        for (index, backend) in self.backends.iter().enumerate() {
            let attempt_start = Instant::now();
            tracing::debug!("Starting async attempt with backend {}", backend.id());

            let handle = match backend.construct_async().await {
                Ok(handle) => handle,
                Err(e) => {
                    self.construction_failed(pass, index, backend.id(), attempt_start, e)?;
                    continue;
                }
            };

            let attempt_id = Uuid::new_v4();
            let span = tracing::debug_span!("attempt", backend = backend.id(), %attempt_id);
            let result = work(handle).instrument(span).await;

            if let Some(value) = self.settle(pass, index, backend.id(), attempt_id, attempt_start, result)? {
                return Ok(value);
            }
        }

        Err(pass.exhausted())
    }

    fn construction_failed(
        &self,
        pass: &mut Pass,
        index: usize,
        backend_id: &str,
        attempt_start: Instant,
        error: AiError,
    ) -> Result<(), AiError> {
        if error.is_cancellation() {
            tracing::info!("Backend {} construction requested stop: {}", backend_id, error);
            return Err(error);
        }

        let duration = attempt_start.elapsed();
        tracing::error!("Error creating backend {} after {:.2?}: {}", backend_id, duration, error);
        let attempt = Attempt::failed(backend_id, Stage::Construction, duration, Arc::new(error));
        self.record(pass, index, attempt)
    }

    /// Records the execution attempt. `Ok(Some(_))` is the value to return,
    /// `Ok(None)` means move on to the next backend.
    fn settle<T>(
        &self,
        pass: &mut Pass,
        index: usize,
        backend_id: &str,
        attempt_id: Uuid,
        attempt_start: Instant,
        result: Result<T, AiError>,
    ) -> Result<Option<T>, AiError> {
        let duration = attempt_start.elapsed();

        match result {
            Ok(value) => {
                tracing::info!(
                    "Backend {} succeeded in {:.2?} (attempt {})",
                    backend_id,
                    duration,
                    attempt_id
                );
                let attempt = Attempt::succeeded(backend_id, duration).with_id(attempt_id);
                self.record(pass, index, attempt)?;
                Ok(Some(value))
            }
            Err(e) if e.is_cancellation() => {
                tracing::info!("Unit of work on {} requested stop: {}", backend_id, e);
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    "Error invoking unit of work on backend {} (attempt {}): {}",
                    backend_id,
                    attempt_id,
                    e
                );
                let attempt = Attempt::failed(backend_id, Stage::Execution, duration, Arc::new(e))
                    .with_id(attempt_id);
                self.record(pass, index, attempt)?;
                Ok(None)
            }
        }
    }

    fn record(&self, pass: &mut Pass, index: usize, attempt: Attempt) -> Result<(), AiError> {
        pass.session.push(attempt);

        let Some(callback) = &self.stop_callback else {
            return Ok(());
        };
        let Some(last_attempt) = pass.session.last_attempt() else {
            return Ok(());
        };

        let check = StopCheck {
            last_attempt,
            total_duration: pass.started.elapsed(),
            attempt_index: index,
            total_backends: self.backends.len(),
        };

        callback(&check).map_err(|e| {
            if e.is_cancellation() {
                tracing::warn!("Stop requested after attempt {}: {}", index, e);
            } else {
                tracing::error!("Stop callback failed after attempt {}: {}", index, e);
            }
            e
        })
    }
}

/// Per-call bookkeeping: the fresh session plus the call's start time.
struct Pass {
    session: ExecutionSession,
    started: Instant,
}

impl Pass {
    fn new() -> Self {
        Self {
            session: ExecutionSession::new(),
            started: Instant::now(),
        }
    }

    fn exhausted(&self) -> AiError {
        AiError::Exhausted(ExhaustedBackends {
            attempts: self.session.attempts().to_vec(),
        })
    }

    fn finish<T>(mut self, outcome: &Result<T, AiError>) -> ExecutionSession {
        let termination = match outcome {
            Ok(_) => Termination::Succeeded,
            Err(AiError::Exhausted(_)) => Termination::Exhausted,
            Err(AiError::StopRequested(reason)) => Termination::StopRequested(reason.clone()),
            Err(e) => Termination::CallbackFailed(e.to_string()),
        };
        self.session.terminate(termination);
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct TestBackend {
        name: &'static str,
        constructs: bool,
    }

    impl TestBackend {
        fn ok(name: &'static str) -> Self {
            Self { name, constructs: true }
        }

        fn broken(name: &'static str) -> Self {
            Self { name, constructs: false }
        }
    }

    #[async_trait]
    impl BackendDescriptor for TestBackend {
        type Handle = &'static str;

        fn id(&self) -> &str {
            self.name
        }

        fn construct(&self) -> Result<&'static str, AiError> {
            if self.constructs {
                Ok(self.name)
            } else {
                Err(AiError::configuration(format!("{} has no api key", self.name)))
            }
        }
    }

    fn engine(backends: Vec<TestBackend>) -> ExecutionEngine<&'static str> {
        backends
            .into_iter()
            .fold(ExecutionEngine::builder(), |b, d| b.backend(d))
            .build()
            .unwrap()
    }

    #[test]
    fn test_empty_backend_list_rejected() {
        let result = ExecutionEngine::<&'static str>::builder().build();
        assert!(matches!(result, Err(AiError::Configuration(_))));
    }

    #[test]
    fn test_fallthrough_construction_then_execution_then_success() {
        let engine = engine(vec![TestBackend::broken("x"), TestBackend::ok("y"), TestBackend::ok("z")]);

        let result = engine.run(|handle| {
            if handle == "y" {
                Err(AiError::provider("y is overloaded"))
            } else {
                Ok(format!("answer from {}", handle))
            }
        });

        assert_eq!(result.unwrap(), "answer from z");
        let session = engine.session();
        let stages: Vec<_> = session
            .attempts()
            .iter()
            .map(|a| (a.backend_id.as_str(), a.stage, a.success))
            .collect();
        assert_eq!(
            stages,
            vec![
                ("x", Stage::Construction, false),
                ("y", Stage::Execution, false),
                ("z", Stage::Execution, true),
            ]
        );
        assert_eq!(session.termination(), Some(&Termination::Succeeded));
    }

    #[test]
    fn test_first_success_stops_iteration() {
        let engine = engine(vec![TestBackend::ok("a"), TestBackend::ok("b"), TestBackend::ok("c")]);
        let calls = AtomicUsize::new(0);

        let result = engine.run(|handle| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(handle)
        });

        assert_eq!(result.unwrap(), "a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.attempt_count(), 1);
    }

    #[test]
    fn test_exhausted_carries_one_attempt_per_backend() {
        let engine = engine(vec![TestBackend::ok("a"), TestBackend::broken("b"), TestBackend::ok("c")]);

        let err = engine
            .run(|_| -> Result<(), AiError> { Err(AiError::timeout("slow")) })
            .unwrap_err();

        let attempts = err.attempts().expect("exhausted error");
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| !a.success));
        assert_eq!(attempts[1].stage, Stage::Construction);
        assert!(err.to_string().contains("Attempt 2 with c failed during 'execution' stage"));
        assert_eq!(engine.session().termination(), Some(&Termination::Exhausted));
    }

    #[test]
    fn test_session_resets_between_runs() {
        let engine = engine(vec![TestBackend::broken("a"), TestBackend::ok("b")]);

        engine.run(|h| Ok::<_, AiError>(h)).unwrap();
        assert_eq!(engine.attempt_count(), 2);

        engine.run(|h| Ok::<_, AiError>(h)).unwrap();
        assert_eq!(engine.attempt_count(), 2);
    }

    #[test]
    fn test_stop_callback_cancels_between_attempts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        let engine = ExecutionEngine::builder()
            .backend(TestBackend::ok("a"))
            .backend(TestBackend::ok("b"))
            .backend(TestBackend::ok("c"))
            .stop_callback(move |check| {
                seen_in_cb
                    .lock()
                    .unwrap()
                    .push((check.attempt_index, check.total_backends));
                if check.attempt_index == 1 {
                    Err(AiError::stop_requested("user closed the tab"))
                } else {
                    Ok(())
                }
            })
            .build()
            .unwrap();

        let err = engine
            .run(|_| -> Result<(), AiError> { Err(AiError::provider("nope")) })
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(*seen.lock().unwrap(), vec![(0, 3), (1, 3)]);
        assert_eq!(engine.attempt_count(), 2);
        assert_eq!(
            engine.session().termination(),
            Some(&Termination::StopRequested("user closed the tab".into()))
        );
    }

    #[test]
    fn test_stop_callback_other_error_aborts() {
        let engine = ExecutionEngine::builder()
            .backend(TestBackend::broken("a"))
            .backend(TestBackend::ok("b"))
            .stop_callback(|_| Err(AiError::other("callback bug")))
            .build()
            .unwrap();

        let err = engine.run(|h| Ok::<_, AiError>(h)).unwrap_err();
        assert!(matches!(err, AiError::Other(ref m) if m == "callback bug"));
        assert_eq!(engine.attempt_count(), 1);
    }

    #[test]
    fn test_work_cancellation_is_not_an_attempt() {
        let engine = engine(vec![TestBackend::ok("a"), TestBackend::ok("b")]);

        let err = engine
            .run(|_| -> Result<(), AiError> { Err(AiError::stop_requested("shutdown")) })
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(engine.attempt_count(), 0);
    }

    #[test]
    fn test_token_annotation() {
        let engine = engine(vec![TestBackend::ok("a")]);
        engine.run(|h| Ok::<_, AiError>(h)).unwrap();

        engine.set_last_attempt_tokens(100, 20, None);
        let tokens = engine.last_attempt().unwrap().tokens.unwrap();
        assert_eq!((tokens.input_tokens, tokens.output_tokens, tokens.total_tokens), (100, 20, 120));
    }

    #[test]
    fn test_token_annotation_on_failed_run_is_noop() {
        let engine = engine(vec![TestBackend::broken("a")]);
        let _ = engine.run(|h| Ok::<_, AiError>(h));

        engine.set_last_attempt_tokens(100, 20, None);
        assert!(engine.last_attempt().unwrap().tokens.is_none());
    }

    #[tokio::test]
    async fn test_run_async_fallthrough() {
        let engine = engine(vec![TestBackend::broken("x"), TestBackend::ok("y"), TestBackend::ok("z")]);

        let result = engine
            .run_async(|handle| async move {
                tokio::task::yield_now().await;
                if handle == "y" {
                    Err(AiError::provider("boom"))
                } else {
                    Ok(handle.len())
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(engine.attempt_count(), 3);
        assert_eq!(engine.last_attempt().unwrap().backend_id, "z");
    }

    #[tokio::test]
    async fn test_metered_run_publishes_its_own_tokens() {
        let engine = engine(vec![TestBackend::broken("a"), TestBackend::ok("b")]);

        let value = engine
            .run_async_metered(
                |handle| async move { Ok::<_, AiError>(handle.len() as u64 * 10) },
                |value| {
                    Some(TokenUsage {
                        input_tokens: *value,
                        output_tokens: 1,
                        total_tokens: *value + 1,
                    })
                },
            )
            .await
            .unwrap();

        assert_eq!(value, 10);
        let last = engine.last_attempt().unwrap();
        assert_eq!(last.backend_id, "b");
        assert_eq!(last.tokens.unwrap().total_tokens, 11);
    }

    #[tokio::test]
    async fn test_late_annotation_never_touches_a_newer_run() {
        let engine = engine(vec![TestBackend::ok("a")]);

        let (_, first_id) = engine
            .run_async_identified(|h| async move { Ok::<_, AiError>(h) }, |_| None)
            .await
            .unwrap();
        let (_, second_id) = engine
            .run_async_identified(|h| async move { Ok::<_, AiError>(h) }, |_| None)
            .await
            .unwrap();

        // the first call finishes its stream after the second run was published
        assert!(!engine.annotate_attempt(first_id, 100, 50, None));
        let published = engine.session();
        assert_eq!(published.attempt_count(), 1);
        assert_eq!(published.attempts()[0].id, second_id);
        assert!(published.attempts()[0].tokens.is_none());

        assert!(engine.annotate_attempt(second_id, 7, 3, None));
        assert_eq!(engine.last_attempt().unwrap().tokens.unwrap().total_tokens, 10);
    }

    #[test]
    fn test_bound_above_semaphore_limit_rejected() {
        let result = ExecutionEngine::builder()
            .backend(TestBackend::ok("a"))
            .config(EngineConfig::new().with_max_concurrent(Semaphore::MAX_PERMITS + 1))
            .build();
        assert!(matches!(result, Err(AiError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_batch_empty_input() {
        let engine = engine(vec![TestBackend::ok("a")]);
        let works: Vec<fn(&'static str) -> futures::future::Ready<Result<u32, AiError>>> = Vec::new();
        assert!(engine.run_batch_async(works).await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_respects_bound_and_order() {
        let engine = ExecutionEngine::builder()
            .backend(TestBackend::ok("a"))
            .config(EngineConfig::new().with_max_concurrent(3))
            .build()
            .unwrap();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let works: Vec<_> = (0..10u64)
            .map(|i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                move |_handle: &'static str| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        // later items finish first
                        tokio::time::sleep(Duration::from_millis(50 - i * 5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        if i == 4 {
                            Err(AiError::provider("item 4 fails"))
                        } else {
                            Ok(i)
                        }
                    }
                }
            })
            .collect();

        let results = engine.run_batch_async(works).await;

        assert_eq!(results.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        for (i, result) in results.iter().enumerate() {
            if i == 4 {
                assert!(matches!(result, Err(AiError::Exhausted(_))));
            } else {
                assert_eq!(*result.as_ref().unwrap(), i as u64);
            }
        }
    }

    #[tokio::test]
    async fn test_batch_cancellation_skips_pending_items() {
        let engine = ExecutionEngine::builder()
            .backend(TestBackend::ok("a"))
            .config(EngineConfig::new().with_max_concurrent(1))
            .build()
            .unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let works: Vec<_> = (0..3)
            .map(|i| {
                let started = started.clone();
                move |_h: &'static str| {
                    started.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if i == 0 {
                            Err(AiError::stop_requested("shutdown"))
                        } else {
                            Ok(i)
                        }
                    }
                }
            })
            .collect();

        let results = engine.run_batch_async(works).await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| matches!(r, Err(AiError::StopRequested(_)))));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }
}
