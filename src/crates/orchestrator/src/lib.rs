//! Interactive task execution core for acolib
//!
//! This crate runs long-lived, LLM-driven jobs to completion while streaming
//! their output incrementally and letting a job pause on a human answer.
//!
//! # Components
//!
//! - [`StreamClassifier`] - turns raw incremental text into ordered [`SemanticEvent`]s
//! - [`QuestionBroker`] - blocking ask-and-resume with exactly-once resolution
//! - [`TaskExecutionOrchestrator`] - drives one job from `Pending` to a terminal state
//! - [`JobRegistry`] - owns the set of jobs, creates, cancels and evicts them
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use task_orchestrator::{
//!     DeliveryMode, JobRegistry, JobSpec, OrchestratorConfig, QuestionBroker,
//!     ScriptedLlmClient, ToolRegistry,
//! };
//!
//! let config = OrchestratorConfig::default();
//! let broker = Arc::new(QuestionBroker::from_config(&config));
//! let registry = JobRegistry::new(
//!     config,
//!     broker,
//!     Arc::new(ScriptedLlmClient::new(vec![vec!["<completion>done</completion>".into()]])),
//!     Arc::new(ToolRegistry::new()),
//! );
//!
//! let (mode, mut events) = DeliveryMode::stream(64);
//! let job_id = registry.create(JobSpec::new("summarize the repo").with_delivery(mode))?;
//! let outcome = registry.wait(&job_id).await?;
//! ```

pub mod api;
pub mod broker;
pub mod channel;
pub mod classifier;
pub mod config;
pub mod job;
pub mod llm;
pub mod orchestrator;
pub mod registry;
pub mod timer;
pub mod tools;

use thiserror::Error;

pub use api::{SubmitAnswerRequest, SubmitAnswerResponse};
pub use broker::{
    AnswerFuture, AnswerRecord, QuestionBroker, QuestionDelivery, QuestionId, QuestionPrompt,
    QuestionRequest, TimeoutPolicy,
};
pub use channel::{
    BroadcastChannel, DeliveryMode, EventType, LogChannel, OutputChannel, OutputEvent,
    OutputPayload, OutputStream, StreamChannel,
};
pub use classifier::{EventKind, EventPayload, SemanticEvent, StreamClassifier, ToolInvocation};
pub use config::{OrchestratorConfig, QuestionTimeoutMode};
pub use job::{Job, JobId, JobKind, JobOutcome, JobSpec, JobState, TerminalKind, ToolResult};
pub use llm::{FragmentStream, LlmClient, LlmRequest, ScriptStep, ScriptedLlmClient};
pub use orchestrator::TaskExecutionOrchestrator;
pub use registry::{JobHandle, JobRegistry};
pub use tools::{ToolInvoker, ToolRegistry};

/// Errors that can occur during orchestration
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad configuration or request shape, rejected before any state change
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Question not found
    #[error("Question not found: {0}")]
    QuestionNotFound(String),

    /// Duplicate submission or colliding identifier
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A deadline elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Explicit cancel, consumer disconnect or queue-overflow eviction
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Job execution error
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Tool invocation error
    #[error("Tool '{name}' failed: {message}")]
    Tool { name: String, message: String },

    /// LLM client error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Invalid state transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Output channel is gone
    #[error("Output channel closed: {0}")]
    ChannelClosed(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of [`OrchestratorError`] used to branch on retryability
/// and to map errors onto the external answer surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Timeout,
    Cancelled,
    Execution,
    Internal,
}

impl OrchestratorError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_) => ErrorKind::Validation,
            OrchestratorError::JobNotFound(_) | OrchestratorError::QuestionNotFound(_) => {
                ErrorKind::NotFound
            }
            OrchestratorError::Conflict(_) => ErrorKind::Conflict,
            OrchestratorError::Timeout(_) => ErrorKind::Timeout,
            OrchestratorError::Cancelled(_) | OrchestratorError::ChannelClosed(_) => {
                ErrorKind::Cancelled
            }
            OrchestratorError::ExecutionFailed(_)
            | OrchestratorError::Tool { .. }
            | OrchestratorError::Llm(_) => ErrorKind::Execution,
            OrchestratorError::InvalidStateTransition { .. }
            | OrchestratorError::Config(_)
            | OrchestratorError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error is a not-found error
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Whether this error is a conflict error
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Get version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
