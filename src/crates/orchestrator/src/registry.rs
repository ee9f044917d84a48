//! Job registry
//!
//! Owns every job in the process. Creating a job validates its spec, stores
//! a [`JobHandle`] and spawns one tokio task running a
//! [`TaskExecutionOrchestrator`]. Terminal jobs stay visible for the
//! configured retention window, or until their outcome is collected with
//! [`JobRegistry::wait`].

use crate::api::{SubmitAnswerRequest, SubmitAnswerResponse};
use crate::broker::QuestionBroker;
use crate::classifier::StreamClassifier;
use crate::config::OrchestratorConfig;
use crate::job::{Job, JobId, JobOutcome, JobSpec, JobState};
use crate::llm::LlmClient;
use crate::orchestrator::TaskExecutionOrchestrator;
use crate::tools::ToolInvoker;
use crate::{OrchestratorError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared state of one job, held by the registry and its orchestrator
pub struct JobHandle {
    job: Mutex<Job>,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
    activity: Notify,
    outcome: watch::Sender<Option<JobOutcome>>,
    finished: Mutex<Option<Instant>>,
}

impl JobHandle {
    pub fn new(job: Job) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            job: Mutex::new(job),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            activity: Notify::new(),
            outcome,
            finished: Mutex::new(None),
        }
    }

    /// Snapshot of the job record
    pub fn snapshot(&self) -> Job {
        self.job.lock().clone()
    }

    pub fn state(&self) -> JobState {
        self.job.lock().state
    }

    /// Mutate the job record under its lock
    pub fn update<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        f(&mut self.job.lock())
    }

    /// Request cancellation. Returns false when the job already ended or
    /// was already cancelled.
    pub fn cancel(&self, reason: &str) -> bool {
        if self.cancel.is_cancelled() || self.state().is_terminal() {
            return false;
        }
        self.cancel_reason.lock().get_or_insert_with(|| reason.to_string());
        self.cancel.cancel();
        true
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.lock().clone()
    }

    /// Signal progress; resets the job's inactivity deadline
    pub fn touch(&self) {
        self.activity.notify_one();
    }

    pub(crate) fn activity(&self) -> &Notify {
        &self.activity
    }

    /// Publish the terminal outcome
    pub fn publish(&self, outcome: JobOutcome) {
        *self.finished.lock() = Some(Instant::now());
        self.outcome.send_replace(Some(outcome));
    }

    /// Terminal outcome, once published
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<JobOutcome>> {
        self.outcome.subscribe()
    }

    fn finished_at(&self) -> Option<Instant> {
        *self.finished.lock()
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let job = self.job.lock();
        f.debug_struct("JobHandle")
            .field("id", &job.id)
            .field("state", &job.state)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Registry of all jobs in the process
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<JobHandle>>,
    config: Arc<OrchestratorConfig>,
    broker: Arc<QuestionBroker>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolInvoker>,
}

impl JobRegistry {
    pub fn new(
        config: OrchestratorConfig,
        broker: Arc<QuestionBroker>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolInvoker>,
    ) -> Self {
        Self {
            jobs: DashMap::new(),
            config: Arc::new(config),
            broker,
            llm,
            tools,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<QuestionBroker> {
        &self.broker
    }

    /// Validate `spec`, register the job and start it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(&self, spec: JobSpec) -> Result<JobId> {
        self.evict_expired();

        if spec.prompt.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }
        let sliding = self
            .config
            .sliding_timeout_for(spec.kind, spec.sliding_timeout_ms)?;
        let hard = self.config.hard_timeout_for(spec.hard_timeout_ms)?;
        if spec.question_timeout_ms == Some(0) {
            return Err(OrchestratorError::Validation(
                "question_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "job id must not be empty".to_string(),
            ));
        }

        let mut job = Job::new(id.clone(), spec.kind, spec.prompt, sliding, hard);
        job.question_timeout_ms = spec.question_timeout_ms;
        let handle = Arc::new(JobHandle::new(job));

        match self.jobs.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(job_id = %id, "Rejecting job with colliding id");
                return Err(OrchestratorError::Conflict(format!("job {} already exists", id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
            }
        }

        let delivery = spec.delivery.name();
        let orchestrator = TaskExecutionOrchestrator::new(
            Arc::clone(&handle),
            Arc::clone(&self.config),
            StreamClassifier::new(id.clone()),
            Arc::clone(&self.broker),
            spec.delivery.into_channel(),
            Arc::clone(&self.llm),
            Arc::clone(&self.tools),
        );

        tokio::spawn(orchestrator.run());

        info!(
            job_id = %id,
            kind = ?spec.kind,
            delivery,
            sliding_timeout_ms = sliding.as_millis() as u64,
            "Job created"
        );
        Ok(id)
    }

    /// Snapshot of one job
    pub fn get(&self, job_id: &str) -> Result<Job> {
        self.handle(job_id).map(|h| h.snapshot())
    }

    /// Snapshots of all jobs, oldest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|e| e.value().snapshot()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Cancel a job. Returns true when a live job was signalled.
    pub fn cancel(&self, job_id: &str, reason: &str) -> bool {
        let Ok(handle) = self.handle(job_id) else {
            return false;
        };
        let signalled = handle.cancel(reason);
        if signalled {
            info!(job_id = %job_id, reason, "Job cancellation requested");
        }
        signalled
    }

    /// Cancel every live job. Returns how many were signalled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        self.jobs
            .iter()
            .filter(|e| e.value().cancel(reason))
            .count()
    }

    /// Explicit progress signal, resets the job's inactivity deadline
    pub fn touch(&self, job_id: &str) -> Result<()> {
        let handle = self.handle(job_id)?;
        if handle.state().is_terminal() {
            return Err(OrchestratorError::InvalidStateTransition {
                from: handle.state().to_string(),
                to: "touched".to_string(),
            });
        }
        handle.touch();
        Ok(())
    }

    /// Wait for a job's terminal outcome. The job is evicted once returned.
    pub async fn wait(&self, job_id: &str) -> Result<JobOutcome> {
        let handle = self.handle(job_id)?;
        let mut rx = handle.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| {
                OrchestratorError::ExecutionFailed(format!("job {} ended without an outcome", job_id))
            })?
            .clone();

        self.jobs
            .remove_if(job_id, |_, existing| Arc::ptr_eq(existing, &handle));
        debug!(job_id = %job_id, "Job outcome collected, evicted");

        outcome.ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    /// Route an answer to the question broker
    pub fn submit_answer(&self, request: SubmitAnswerRequest) -> SubmitAnswerResponse {
        let result = self.broker.submit(&request.question_id, request.answer);
        if let Err(e) = &result {
            debug!(question_id = %request.question_id, error = %e, "Answer rejected");
        }
        result.into()
    }

    /// Remove terminal jobs older than the retention window
    pub fn evict_expired(&self) -> usize {
        let retention = self.config.retention();
        let now = Instant::now();
        let before = self.jobs.len();
        self.jobs.retain(|_, handle| match handle.finished_at() {
            Some(finished) => now.saturating_duration_since(finished) < retention,
            None => true,
        });
        let evicted = before.saturating_sub(self.jobs.len());
        if evicted > 0 {
            debug!(evicted, "Evicted expired jobs");
        }
        evicted
    }

    /// Number of jobs not yet in a terminal state
    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .count()
    }

    /// Number of jobs held, including terminal ones awaiting eviction
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn handle(&self, job_id: &str) -> Result<Arc<JobHandle>> {
        self.jobs
            .get(job_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.len())
            .field("broker", &self.broker)
            .finish()
    }
}
