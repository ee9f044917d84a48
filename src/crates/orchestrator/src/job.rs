//! Job model
//!
//! A [`Job`] is the registry-owned record of one task execution. Its state
//! machine only moves forward into one of four terminal states and rejects
//! any transition out of them.

use crate::broker::QuestionId;
use crate::channel::DeliveryMode;
use crate::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Job identifier
pub type JobId = String;

/// Kind of job, selects the sliding timeout bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Long-running job that may pause on human answers
    #[default]
    Interactive,
    /// Short request with a tight timeout ceiling
    QuickQuery,
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    AwaitingAnswer,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    /// Whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        self.terminal_kind().is_some()
    }

    /// Terminal kind of this state, if terminal
    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        match self {
            JobState::Completed => Some(TerminalKind::Completed),
            JobState::Failed => Some(TerminalKind::Failed),
            JobState::TimedOut => Some(TerminalKind::TimedOut),
            JobState::Cancelled => Some(TerminalKind::Cancelled),
            _ => None,
        }
    }

    fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending, Failed | TimedOut | Cancelled) => true,
            (Running, AwaitingAnswer) => true,
            (Running, Completed | Failed | TimedOut | Cancelled) => true,
            (AwaitingAnswer, Running) => true,
            (AwaitingAnswer, Failed | TimedOut | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "Pending"),
            JobState::Running => write!(f, "Running"),
            JobState::AwaitingAnswer => write!(f, "AwaitingAnswer"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Failed => write!(f, "Failed"),
            JobState::TimedOut => write!(f, "TimedOut"),
            JobState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// How a job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TerminalKind {
    /// State a job enters when it ends this way
    pub fn state(&self) -> JobState {
        match self {
            TerminalKind::Completed => JobState::Completed,
            TerminalKind::Failed => JobState::Failed,
            TerminalKind::TimedOut => JobState::TimedOut,
            TerminalKind::Cancelled => JobState::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalKind::Completed => "completed",
            TerminalKind::Failed => "failed",
            TerminalKind::TimedOut => "timed_out",
            TerminalKind::Cancelled => "cancelled",
        }
    }
}

/// Result of one tool invocation, fed back into the next LLM turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the invocation this result answers
    pub call_id: String,

    /// Tool name
    pub name: String,

    /// Tool output, or the human answer for interactive tools
    pub output: Value,

    /// Whether the output describes an error
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, name: impl Into<String>, output: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            output,
            is_error: false,
        }
    }

    /// Result of a tool that failed; `output` carries the error message
    pub fn failure(call_id: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            output: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Submission parameters for a job
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Caller-chosen id; generated when absent
    pub id: Option<JobId>,

    /// Task prompt handed to the LLM
    pub prompt: String,

    /// Job kind
    pub kind: JobKind,

    /// Sliding inactivity timeout override
    pub sliding_timeout_ms: Option<u64>,

    /// Hard wall-clock cap override
    pub hard_timeout_ms: Option<u64>,

    /// Per-job question timeout override
    pub question_timeout_ms: Option<u64>,

    /// Where output events go
    pub delivery: DeliveryMode,
}

impl JobSpec {
    /// Create an interactive job spec delivering to the log
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            prompt: prompt.into(),
            kind: JobKind::Interactive,
            sliding_timeout_ms: None,
            hard_timeout_ms: None,
            question_timeout_ms: None,
            delivery: DeliveryMode::Log,
        }
    }

    /// Use an explicit job id
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set job kind
    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set sliding inactivity timeout
    pub fn with_sliding_timeout_ms(mut self, ms: u64) -> Self {
        self.sliding_timeout_ms = Some(ms);
        self
    }

    /// Set hard wall-clock cap
    pub fn with_hard_timeout_ms(mut self, ms: u64) -> Self {
        self.hard_timeout_ms = Some(ms);
        self
    }

    /// Set question timeout
    pub fn with_question_timeout_ms(mut self, ms: u64) -> Self {
        self.question_timeout_ms = Some(ms);
        self
    }

    /// Set delivery mode
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }
}

/// Registry-owned job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Job kind
    pub kind: JobKind,

    /// Task prompt
    pub prompt: String,

    /// Current state
    pub state: JobState,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Validated sliding inactivity timeout in milliseconds
    pub sliding_timeout_ms: u64,

    /// Validated hard wall-clock cap in milliseconds
    pub hard_timeout_ms: Option<u64>,

    /// Per-job question timeout in milliseconds
    pub question_timeout_ms: Option<u64>,

    /// Wall-clock view of the current inactivity deadline
    pub activity_deadline: Option<DateTime<Utc>>,

    /// Wall-clock view of the hard deadline
    pub absolute_deadline: Option<DateTime<Utc>>,

    /// Question the job is blocked on
    pub pending_question: Option<QuestionId>,

    /// Reason given when the job was cancelled
    pub cancel_reason: Option<String>,

    /// Tool results recorded so far
    pub tool_results: Vec<ToolResult>,

    /// Final result text
    pub result: Option<String>,

    /// Error message for failed or timed out jobs
    pub error: Option<String>,

    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job with validated timeouts
    pub fn new(
        id: impl Into<JobId>,
        kind: JobKind,
        prompt: impl Into<String>,
        sliding_timeout: Duration,
        hard_timeout: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            prompt: prompt.into(),
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            sliding_timeout_ms: sliding_timeout.as_millis() as u64,
            hard_timeout_ms: hard_timeout.map(|d| d.as_millis() as u64),
            question_timeout_ms: None,
            activity_deadline: None,
            absolute_deadline: None,
            pending_question: None,
            cancel_reason: None,
            tool_results: Vec::new(),
            result: None,
            error: None,
            finished_at: None,
        }
    }

    /// Move to `next`, rejecting transitions out of terminal states
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.pending_question = None;
            self.activity_deadline = None;
            self.absolute_deadline = None;
        }
        Ok(())
    }

    /// Record that the inactivity deadline moved
    pub fn touch(&mut self, sliding: Duration) {
        let now = Utc::now();
        self.updated_at = now;
        if !self.state.is_terminal() {
            self.activity_deadline = chrono::Duration::from_std(sliding)
                .ok()
                .map(|d| now + d);
        }
    }

    /// Whether the job has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Outcome of a terminal job
    pub fn outcome(&self) -> Option<JobOutcome> {
        let kind = self.state.terminal_kind()?;
        Some(JobOutcome {
            job_id: self.id.clone(),
            kind,
            result: self.result.clone(),
            error: self.error.clone(),
            tool_results: self.tool_results.clone(),
            finished_at: self.finished_at.unwrap_or(self.updated_at),
        })
    }
}

/// Terminal outcome returned to the submitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub kind: TerminalKind,
    pub result: Option<String>,
    pub error: Option<String>,
    pub tool_results: Vec<ToolResult>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.kind == TerminalKind::Completed
    }
}
