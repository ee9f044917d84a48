//! Question broker
//!
//! Lets a running job ask a human a question and suspend until the answer
//! arrives, without holding a runtime thread. Every question is resolved
//! exactly once: by an answer, by its deadline, or by cancellation. The
//! resolver is a `oneshot::Sender` stored in the pending table, and whoever
//! removes the entry under the lock owns the resolution.

use crate::config::OrchestratorConfig;
use crate::job::JobId;
use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Question identifier (UUID v4)
pub type QuestionId = String;

const RESOLVED_CAPACITY: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// What an unanswered question resolves to when its deadline elapses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Fail with [`OrchestratorError::Timeout`]
    Reject,
    /// Resolve with the given answer
    Fallback(String),
}

/// Question to ask on behalf of a job
#[derive(Debug, Clone)]
pub struct QuestionRequest {
    pub job_id: JobId,
    pub prompt: String,
    pub choices: Vec<String>,
    /// Reject answers that are not one of `choices`
    pub restrict_to_choices: bool,
    /// Overrides the broker default
    pub timeout: Option<Duration>,
    /// Overrides the broker default
    pub on_timeout: Option<TimeoutPolicy>,
}

impl QuestionRequest {
    pub fn new(job_id: impl Into<JobId>, prompt: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            prompt: prompt.into(),
            choices: Vec::new(),
            restrict_to_choices: false,
            timeout: None,
            on_timeout: None,
        }
    }

    pub fn with_choices(mut self, choices: Vec<String>) -> Self {
        self.choices = choices;
        self
    }

    pub fn restrict_to_choices(mut self) -> Self {
        self.restrict_to_choices = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.on_timeout = Some(policy);
        self
    }
}

/// The part of a pending question handed to the delivery channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionPrompt {
    pub question_id: QuestionId,
    pub job_id: JobId,
    pub prompt: String,
    pub choices: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// A validated answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question_id: QuestionId,
    pub answer: String,
    pub submitted_at: DateTime<Utc>,
}

/// Delivers a question to whoever can answer it
#[async_trait]
pub trait QuestionDelivery: Send + Sync {
    async fn deliver(&self, prompt: &QuestionPrompt) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedAs {
    Answered,
    TimedOut,
    Cancelled,
}

impl ResolvedAs {
    fn as_str(&self) -> &'static str {
        match self {
            ResolvedAs::Answered => "answered",
            ResolvedAs::TimedOut => "timed out",
            ResolvedAs::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
enum Resolution {
    Answered(AnswerRecord),
    Cancelled(String),
}

struct PendingQuestion {
    prompt: QuestionPrompt,
    restrict_to_choices: bool,
    admitted: u64,
    resolver: oneshot::Sender<Resolution>,
}

struct BrokerState {
    pending: HashMap<QuestionId, PendingQuestion>,
    by_job: HashMap<JobId, QuestionId>,
    resolved: LruCache<QuestionId, ResolvedAs>,
    next_admission: u64,
}

impl BrokerState {
    /// Remove an unresolved question. The caller owns its resolution.
    fn take(&mut self, question_id: &str, outcome: ResolvedAs) -> Option<PendingQuestion> {
        let pending = self.pending.remove(question_id)?;
        if self.by_job.get(&pending.prompt.job_id).map(String::as_str) == Some(question_id) {
            self.by_job.remove(&pending.prompt.job_id);
        }
        self.resolved.put(question_id.to_string(), outcome);
        Some(pending)
    }

    fn oldest(&self) -> Option<QuestionId> {
        self.pending
            .values()
            .min_by_key(|p| p.admitted)
            .map(|p| p.prompt.question_id.clone())
    }
}

struct Shared {
    state: Mutex<BrokerState>,
}

impl Shared {
    fn cancel(&self, question_id: &str, reason: &str) -> bool {
        let mut state = self.state.lock();
        match state.take(question_id, ResolvedAs::Cancelled) {
            Some(pending) => {
                let _ = pending.resolver.send(Resolution::Cancelled(reason.to_string()));
                true
            }
            None => false,
        }
    }
}

/// Process-wide broker for blocking questions
pub struct QuestionBroker {
    shared: Arc<Shared>,
    max_pending: usize,
    default_timeout: Duration,
    default_policy: TimeoutPolicy,
}

impl QuestionBroker {
    /// Create a broker admitting at most `max_pending` unresolved questions
    pub fn new(max_pending: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    pending: HashMap::new(),
                    by_job: HashMap::new(),
                    resolved: LruCache::new(RESOLVED_CAPACITY),
                    next_admission: 0,
                }),
            }),
            max_pending: max_pending.max(1),
            default_timeout: Duration::from_secs(600),
            default_policy: TimeoutPolicy::Reject,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.max_pending_questions)
            .with_defaults(config.question_timeout(), config.question_timeout_policy())
    }

    /// Set the timeout and policy used when a request leaves them unset
    pub fn with_defaults(mut self, timeout: Duration, policy: TimeoutPolicy) -> Self {
        self.default_timeout = timeout;
        self.default_policy = policy;
        self
    }

    /// Register a question, deliver it once and return the future of its answer.
    ///
    /// When the broker is full the oldest unresolved question is cancelled
    /// with `"queue overflow"` to make room.
    pub async fn ask(
        &self,
        request: QuestionRequest,
        delivery: &dyn QuestionDelivery,
    ) -> Result<AnswerFuture> {
        if request.prompt.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "question prompt must not be empty".to_string(),
            ));
        }
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        if timeout.is_zero() {
            return Err(OrchestratorError::Validation(
                "question timeout must be greater than 0".to_string(),
            ));
        }
        if request.restrict_to_choices && request.choices.is_empty() {
            return Err(OrchestratorError::Validation(
                "restricted question needs at least one choice".to_string(),
            ));
        }
        let policy = request
            .on_timeout
            .unwrap_or_else(|| self.default_policy.clone());

        let question_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        let prompt = QuestionPrompt {
            question_id: question_id.clone(),
            job_id: request.job_id.clone(),
            prompt: request.prompt,
            choices: request.choices,
            created_at,
            deadline: chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|d| created_at.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.shared.state.lock();
            if let Some(existing) = state.by_job.get(&request.job_id) {
                return Err(OrchestratorError::Conflict(format!(
                    "job {} already awaits an answer to question {}",
                    request.job_id, existing
                )));
            }

            while state.pending.len() >= self.max_pending {
                let Some(oldest) = state.oldest() else {
                    break;
                };
                if let Some(evicted) = state.take(&oldest, ResolvedAs::Cancelled) {
                    warn!(
                        question_id = %oldest,
                        job_id = %evicted.prompt.job_id,
                        "Evicting oldest question, pending queue is full"
                    );
                    let _ = evicted
                        .resolver
                        .send(Resolution::Cancelled("queue overflow".to_string()));
                }
            }

            let admitted = state.next_admission;
            state.next_admission += 1;
            state
                .by_job
                .insert(request.job_id.clone(), question_id.clone());
            state.pending.insert(
                question_id.clone(),
                PendingQuestion {
                    prompt: prompt.clone(),
                    restrict_to_choices: request.restrict_to_choices,
                    admitted,
                    resolver: tx,
                },
            );
        }

        let future = AnswerFuture {
            question_id: question_id.clone(),
            shared: Arc::clone(&self.shared),
            rx,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
            policy,
            done: false,
        };

        if let Err(e) = delivery.deliver(&prompt).await {
            warn!(question_id = %question_id, error = %e, "Question delivery failed");
            // dropping the future withdraws the question
            drop(future);
            return Err(e);
        }

        info!(
            question_id = %question_id,
            job_id = %prompt.job_id,
            choices = prompt.choices.len(),
            "Question asked"
        );
        Ok(future)
    }

    /// Resolve a question with `answer`
    pub fn submit(&self, question_id: &str, answer: impl Into<String>) -> Result<AnswerRecord> {
        let answer = answer.into();
        let mut state = self.shared.state.lock();

        let Some(pending) = state.pending.get(question_id) else {
            return Err(match state.resolved.peek(question_id) {
                Some(outcome) => OrchestratorError::Conflict(format!(
                    "question {} already {}",
                    question_id,
                    outcome.as_str()
                )),
                None => OrchestratorError::QuestionNotFound(question_id.to_string()),
            });
        };

        if answer.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "answer must not be empty".to_string(),
            ));
        }
        if pending.restrict_to_choices && !pending.prompt.choices.iter().any(|c| c == &answer) {
            return Err(OrchestratorError::Validation(format!(
                "answer '{}' is not one of {:?}",
                answer, pending.prompt.choices
            )));
        }

        let record = AnswerRecord {
            question_id: question_id.to_string(),
            answer,
            submitted_at: Utc::now(),
        };
        if let Some(pending) = state.take(question_id, ResolvedAs::Answered) {
            let _ = pending
                .resolver
                .send(Resolution::Answered(record.clone()));
            info!(question_id = %question_id, job_id = %pending.prompt.job_id, "Question answered");
        }
        Ok(record)
    }

    /// Cancel one question. Returns true when it was still unresolved.
    pub fn cancel(&self, question_id: &str, reason: &str) -> bool {
        let cancelled = self.shared.cancel(question_id, reason);
        if cancelled {
            info!(question_id = %question_id, reason, "Question cancelled");
        }
        cancelled
    }

    /// Cancel the unresolved question of a job, if any
    pub fn cancel_job(&self, job_id: &str, reason: &str) -> bool {
        let question_id = self.shared.state.lock().by_job.get(job_id).cloned();
        match question_id {
            Some(id) => self.cancel(&id, reason),
            None => false,
        }
    }

    /// Number of unresolved questions
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Unresolved question of a job
    pub fn pending_for(&self, job_id: &str) -> Option<QuestionPrompt> {
        let state = self.shared.state.lock();
        let question_id = state.by_job.get(job_id)?;
        state.pending.get(question_id).map(|p| p.prompt.clone())
    }

    /// All unresolved questions, oldest first
    pub fn pending(&self) -> Vec<QuestionPrompt> {
        let state = self.shared.state.lock();
        let mut pending: Vec<_> = state.pending.values().collect();
        pending.sort_by_key(|p| p.admitted);
        pending.into_iter().map(|p| p.prompt.clone()).collect()
    }
}

impl std::fmt::Debug for QuestionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuestionBroker")
            .field("max_pending", &self.max_pending)
            .field("pending", &self.pending_count())
            .field("default_timeout", &self.default_timeout)
            .field("default_policy", &self.default_policy)
            .finish()
    }
}

/// Future resolving to the answer of one question.
///
/// Dropping it before resolution withdraws the question.
#[must_use = "dropping an AnswerFuture withdraws its question"]
pub struct AnswerFuture {
    question_id: QuestionId,
    shared: Arc<Shared>,
    rx: oneshot::Receiver<Resolution>,
    sleep: Pin<Box<Sleep>>,
    policy: TimeoutPolicy,
    done: bool,
}

impl AnswerFuture {
    pub fn question_id(&self) -> &str {
        &self.question_id
    }

    fn settle(&mut self, resolution: std::result::Result<Resolution, oneshot::error::RecvError>) -> Result<String> {
        self.done = true;
        match resolution {
            Ok(Resolution::Answered(record)) => Ok(record.answer),
            Ok(Resolution::Cancelled(reason)) => Err(OrchestratorError::Cancelled(reason)),
            Err(_) => Err(OrchestratorError::Cancelled(format!(
                "question {} dropped by broker",
                self.question_id
            ))),
        }
    }
}

impl Future for AnswerFuture {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(Err(OrchestratorError::Conflict(format!(
                "question {} already resolved",
                this.question_id
            ))));
        }

        if let Poll::Ready(resolution) = Pin::new(&mut this.rx).poll(cx) {
            return Poll::Ready(this.settle(resolution));
        }

        if this.sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }

        let expired = this
            .shared
            .state
            .lock()
            .take(&this.question_id, ResolvedAs::TimedOut)
            .is_some();

        if !expired {
            // resolved concurrently; the value is already in the channel
            return match Pin::new(&mut this.rx).poll(cx) {
                Poll::Ready(resolution) => Poll::Ready(this.settle(resolution)),
                Poll::Pending => Poll::Pending,
            };
        }

        this.done = true;
        Poll::Ready(match &this.policy {
            TimeoutPolicy::Reject => {
                warn!(question_id = %this.question_id, "Question timed out");
                Err(OrchestratorError::Timeout(format!(
                    "question {} was not answered in time",
                    this.question_id
                )))
            }
            TimeoutPolicy::Fallback(answer) => {
                info!(question_id = %this.question_id, "Question timed out, using fallback answer");
                Ok(answer.clone())
            }
        })
    }
}

impl Drop for AnswerFuture {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let withdrawn = self
            .shared
            .state
            .lock()
            .take(&self.question_id, ResolvedAs::Cancelled)
            .is_some();
        if withdrawn {
            debug!(question_id = %self.question_id, "Question withdrawn");
        }
    }
}

impl std::fmt::Debug for AnswerFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerFuture")
            .field("question_id", &self.question_id)
            .field("policy", &self.policy)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<QuestionPrompt>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QuestionDelivery for Recorder {
        async fn deliver(&self, prompt: &QuestionPrompt) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.delivered.lock().push(prompt.clone());
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl QuestionDelivery for Unreachable {
        async fn deliver(&self, _prompt: &QuestionPrompt) -> Result<()> {
            Err(OrchestratorError::ChannelClosed("nobody listening".into()))
        }
    }

    fn color(job: &str) -> QuestionRequest {
        QuestionRequest::new(job, "Pick a color").with_choices(vec!["red".into(), "blue".into()])
    }

    #[tokio::test]
    async fn test_ask_then_submit() {
        let broker = QuestionBroker::new(10);
        let delivery = Recorder::default();

        let future = broker.ask(color("job-1"), &delivery).await.unwrap();
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 1);
        let id = future.question_id().to_string();
        assert_eq!(delivery.delivered.lock()[0].question_id, id);
        assert_eq!(broker.pending_for("job-1").unwrap().choices, vec!["red", "blue"]);

        let record = broker.submit(&id, "blue").unwrap();
        assert_eq!(record.answer, "blue");
        assert_eq!(future.await.unwrap(), "blue");
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_double_submit_conflicts() {
        let broker = QuestionBroker::new(10);
        let future = broker.ask(color("job-1"), &Recorder::default()).await.unwrap();
        let id = future.question_id().to_string();

        assert!(broker.submit(&id, "red").is_ok());
        let err = broker.submit(&id, "blue").unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(future.await.unwrap(), "red");
    }

    #[tokio::test]
    async fn test_submit_errors() {
        let broker = QuestionBroker::new(10);
        let future = broker
            .ask(color("job-1").restrict_to_choices(), &Recorder::default())
            .await
            .unwrap();
        let id = future.question_id().to_string();

        assert!(broker.submit("nope", "red").unwrap_err().is_not_found());
        assert!(matches!(
            broker.submit(&id, "  "),
            Err(OrchestratorError::Validation(_))
        ));
        assert!(matches!(
            broker.submit(&id, "green"),
            Err(OrchestratorError::Validation(_))
        ));
        // still answerable after rejected submissions
        assert!(broker.submit(&id, "red").is_ok());
        assert_eq!(future.await.unwrap(), "red");
    }

    #[tokio::test]
    async fn test_one_question_per_job() {
        let broker = QuestionBroker::new(10);
        let delivery = Recorder::default();
        let _first = broker.ask(color("job-1"), &delivery).await.unwrap();

        let err = broker.ask(color("job-1"), &delivery).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(broker.ask(color("job-2"), &delivery).await.is_ok());
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects() {
        let broker = QuestionBroker::new(10);
        let future = broker
            .ask(
                color("job-1").with_timeout(Duration::from_secs(5)),
                &Recorder::default(),
            )
            .await
            .unwrap();
        let id = future.question_id().to_string();

        let err = future.await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(_)));
        assert!(broker.submit(&id, "red").unwrap_err().is_conflict());
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fallback() {
        let broker = QuestionBroker::new(10)
            .with_defaults(Duration::from_secs(1), TimeoutPolicy::Fallback("red".into()));
        let future = broker.ask(color("job-1"), &Recorder::default()).await.unwrap();
        assert_eq!(future.await.unwrap(), "red");
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let broker = QuestionBroker::new(10);
        let delivery = Recorder::default();
        let mut futures = Vec::new();
        for i in 0..10 {
            futures.push(broker.ask(color(&format!("job-{i}")), &delivery).await.unwrap());
        }
        assert_eq!(broker.pending_count(), 10);

        let newest = broker.ask(color("job-10"), &delivery).await.unwrap();
        assert_eq!(broker.pending_count(), 10);

        let oldest = futures.remove(0);
        match oldest.await {
            Err(OrchestratorError::Cancelled(reason)) => assert_eq!(reason, "queue overflow"),
            other => panic!("expected overflow cancellation, got {:?}", other),
        }
        assert!(broker.submit(newest.question_id(), "blue").is_ok());
    }

    #[tokio::test]
    async fn test_cancel_job() {
        let broker = QuestionBroker::new(10);
        let future = broker.ask(color("job-1"), &Recorder::default()).await.unwrap();

        assert!(broker.cancel_job("job-1", "job cancelled"));
        assert!(!broker.cancel_job("job-1", "again"));
        assert!(matches!(
            future.await,
            Err(OrchestratorError::Cancelled(reason)) if reason == "job cancelled"
        ));
    }

    #[tokio::test]
    async fn test_drop_withdraws_question() {
        let broker = QuestionBroker::new(10);
        let future = broker.ask(color("job-1"), &Recorder::default()).await.unwrap();
        let id = future.question_id().to_string();
        drop(future);

        assert_eq!(broker.pending_count(), 0);
        assert!(broker.pending_for("job-1").is_none());
        assert!(broker.submit(&id, "red").unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_failed_delivery_leaves_nothing_behind() {
        let broker = QuestionBroker::new(10);
        let err = broker.ask(color("job-1"), &Unreachable).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ChannelClosed(_)));
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ask_validation() {
        let broker = QuestionBroker::new(10);
        let delivery = Recorder::default();
        assert!(broker
            .ask(QuestionRequest::new("job", " "), &delivery)
            .await
            .is_err());
        assert!(broker
            .ask(
                QuestionRequest::new("job", "why?").with_timeout(Duration::ZERO),
                &delivery
            )
            .await
            .is_err());
        assert!(broker
            .ask(QuestionRequest::new("job", "which?").restrict_to_choices(), &delivery)
            .await
            .is_err());
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_submits_have_one_winner() {
        let broker = Arc::new(QuestionBroker::new(10));
        let future = broker.ask(color("job-1"), &Recorder::default()).await.unwrap();
        let id = future.question_id().to_string();

        let handles: Vec<_> = ["red", "blue", "red", "blue"]
            .into_iter()
            .map(|answer| {
                let broker = Arc::clone(&broker);
                let id = id.clone();
                tokio::spawn(async move { broker.submit(&id, answer) })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            if let Ok(record) = handle.await.unwrap() {
                winners.push(record.answer);
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(future.await.unwrap(), winners[0]);
    }
}
