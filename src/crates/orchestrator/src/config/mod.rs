//! Orchestrator configuration
//!
//! Timeout bounds, question broker limits and job retention. Values are
//! loaded from YAML (see [`loader`]), overridden by `ACOLIB_TASK_*`
//! environment variables and validated before use. Out-of-range values are
//! rejected with [`OrchestratorError::Validation`], never clamped.

pub mod loader;

pub use loader::{load_yaml_config, load_yaml_file};

use crate::broker::TimeoutPolicy;
use crate::job::JobKind;
use crate::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Lower bound for every job timeout, in milliseconds
pub const MIN_TIMEOUT_MS: u64 = 1_000;

/// Absolute ceiling for the sliding inactivity timeout (24 h)
pub const SLIDING_TIMEOUT_CEILING_MS: u64 = 86_400_000;

/// Ceiling for quick-query jobs (5 min)
pub const QUICK_QUERY_CEILING_MS: u64 = 300_000;

/// What happens to a question whose deadline elapses unanswered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionTimeoutMode {
    /// Fail the waiting future with a timeout error
    Reject,
    /// Resolve with `question_fallback_answer`
    Fallback,
}

/// Configuration for the task execution core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Sliding inactivity timeout used when a job does not supply one
    pub default_sliding_timeout_ms: u64,

    /// Upper bound accepted for a job's sliding timeout
    pub max_sliding_timeout_ms: u64,

    /// Sliding timeout for quick-query jobs
    pub quick_query_timeout_ms: u64,

    /// Optional wall-clock cap applied to every job
    pub hard_timeout_ms: Option<u64>,

    /// How long a question waits for an answer
    pub question_timeout_ms: u64,

    /// Behaviour of unanswered questions
    pub question_timeout_policy: QuestionTimeoutMode,

    /// Answer used by the fallback policy
    pub question_fallback_answer: Option<String>,

    /// Maximum unresolved questions across the whole process
    pub max_pending_questions: usize,

    /// How long terminal jobs stay visible before eviction
    pub retention_secs: u64,

    /// Buffer size of stream delivery channels
    pub channel_buffer: usize,

    /// Maximum LLM turns per job
    pub max_turns: u32,

    /// Tools answered by a human through the question broker
    pub interactive_tools: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_sliding_timeout_ms: 1_800_000,
            max_sliding_timeout_ms: SLIDING_TIMEOUT_CEILING_MS,
            quick_query_timeout_ms: 30_000,
            hard_timeout_ms: None,
            question_timeout_ms: 600_000,
            question_timeout_policy: QuestionTimeoutMode::Reject,
            question_fallback_answer: None,
            max_pending_questions: 10,
            retention_secs: 300,
            channel_buffer: 100,
            max_turns: 25,
            interactive_tools: vec!["ask_followup_question".to_string()],
        }
    }
}

fn check_bounds(name: &str, value_ms: u64, min_ms: u64, max_ms: u64) -> Result<Duration> {
    if value_ms < min_ms || value_ms > max_ms {
        warn!(
            setting = name,
            value_ms, min_ms, max_ms, "Rejecting out-of-bounds timeout"
        );
        return Err(OrchestratorError::Validation(format!(
            "{} must be within [{}ms, {}ms], got {}ms",
            name, min_ms, max_ms, value_ms
        )));
    }
    Ok(Duration::from_millis(value_ms))
}

impl OrchestratorConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_yaml_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, then apply environment overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config: Self = load_yaml_config(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Create configuration from defaults plus environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - ACOLIB_TASK_SLIDING_TIMEOUT_MS
    /// - ACOLIB_TASK_MAX_SLIDING_TIMEOUT_MS
    /// - ACOLIB_TASK_QUICK_QUERY_TIMEOUT_MS
    /// - ACOLIB_TASK_HARD_TIMEOUT_MS
    /// - ACOLIB_TASK_QUESTION_TIMEOUT_MS
    /// - ACOLIB_TASK_MAX_PENDING_QUESTIONS
    /// - ACOLIB_TASK_RETENTION_SECS
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(variable = name, value = %raw, "Ignoring non-numeric override");
                    None
                }
            }
        };

        if let Some(v) = parse("ACOLIB_TASK_SLIDING_TIMEOUT_MS") {
            self.default_sliding_timeout_ms = v;
        }
        if let Some(v) = parse("ACOLIB_TASK_MAX_SLIDING_TIMEOUT_MS") {
            self.max_sliding_timeout_ms = v;
        }
        if let Some(v) = parse("ACOLIB_TASK_QUICK_QUERY_TIMEOUT_MS") {
            self.quick_query_timeout_ms = v;
        }
        if let Some(v) = parse("ACOLIB_TASK_HARD_TIMEOUT_MS") {
            self.hard_timeout_ms = Some(v);
        }
        if let Some(v) = parse("ACOLIB_TASK_QUESTION_TIMEOUT_MS") {
            self.question_timeout_ms = v;
        }
        if let Some(v) = parse("ACOLIB_TASK_MAX_PENDING_QUESTIONS") {
            self.max_pending_questions = v as usize;
        }
        if let Some(v) = parse("ACOLIB_TASK_RETENTION_SECS") {
            self.retention_secs = v;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        check_bounds(
            "max_sliding_timeout_ms",
            self.max_sliding_timeout_ms,
            MIN_TIMEOUT_MS,
            SLIDING_TIMEOUT_CEILING_MS,
        )?;
        check_bounds(
            "default_sliding_timeout_ms",
            self.default_sliding_timeout_ms,
            MIN_TIMEOUT_MS,
            self.max_sliding_timeout_ms,
        )?;
        check_bounds(
            "quick_query_timeout_ms",
            self.quick_query_timeout_ms,
            MIN_TIMEOUT_MS,
            QUICK_QUERY_CEILING_MS,
        )?;
        if let Some(hard) = self.hard_timeout_ms {
            check_bounds("hard_timeout_ms", hard, MIN_TIMEOUT_MS, u64::MAX)?;
        }

        if self.question_timeout_ms == 0 {
            return Err(OrchestratorError::Validation(
                "question_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.question_timeout_policy == QuestionTimeoutMode::Fallback
            && self.question_fallback_answer.is_none()
        {
            return Err(OrchestratorError::Validation(
                "fallback question policy requires question_fallback_answer".to_string(),
            ));
        }
        if self.max_pending_questions == 0 {
            return Err(OrchestratorError::Validation(
                "max_pending_questions must be at least 1".to_string(),
            ));
        }
        if self.channel_buffer == 0 {
            return Err(OrchestratorError::Validation(
                "channel_buffer must be at least 1".to_string(),
            ));
        }
        if self.max_turns == 0 {
            return Err(OrchestratorError::Validation(
                "max_turns must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve and validate the sliding timeout of a job.
    ///
    /// Interactive jobs accept `[1s, max_sliding_timeout_ms]`, quick queries
    /// `[1s, 300s]`. `None` selects the configured default for the kind.
    pub fn sliding_timeout_for(&self, kind: JobKind, requested_ms: Option<u64>) -> Result<Duration> {
        match kind {
            JobKind::Interactive => check_bounds(
                "sliding_timeout_ms",
                requested_ms.unwrap_or(self.default_sliding_timeout_ms),
                MIN_TIMEOUT_MS,
                self.max_sliding_timeout_ms,
            ),
            JobKind::QuickQuery => check_bounds(
                "quick_query_timeout_ms",
                requested_ms.unwrap_or(self.quick_query_timeout_ms),
                MIN_TIMEOUT_MS,
                QUICK_QUERY_CEILING_MS,
            ),
        }
    }

    /// Resolve and validate the hard wall-clock cap of a job
    pub fn hard_timeout_for(&self, requested_ms: Option<u64>) -> Result<Option<Duration>> {
        requested_ms
            .or(self.hard_timeout_ms)
            .map(|ms| check_bounds("hard_timeout_ms", ms, MIN_TIMEOUT_MS, u64::MAX))
            .transpose()
    }

    /// Default wait for a question
    pub fn question_timeout(&self) -> Duration {
        Duration::from_millis(self.question_timeout_ms)
    }

    /// Default timeout policy for questions
    pub fn question_timeout_policy(&self) -> TimeoutPolicy {
        match (&self.question_timeout_policy, &self.question_fallback_answer) {
            (QuestionTimeoutMode::Fallback, Some(answer)) => TimeoutPolicy::Fallback(answer.clone()),
            _ => TimeoutPolicy::Reject,
        }
    }

    /// Retention window for terminal jobs
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Whether `tool` is served by a human answer
    pub fn is_interactive_tool(&self, tool: &str) -> bool {
        self.interactive_tools.iter().any(|t| t == tool)
    }

    /// Set the default sliding timeout
    pub fn with_default_sliding_timeout_ms(mut self, ms: u64) -> Self {
        self.default_sliding_timeout_ms = ms;
        self
    }

    /// Set the hard wall-clock cap
    pub fn with_hard_timeout_ms(mut self, ms: u64) -> Self {
        self.hard_timeout_ms = Some(ms);
        self
    }

    /// Set the default question timeout
    pub fn with_question_timeout_ms(mut self, ms: u64) -> Self {
        self.question_timeout_ms = ms;
        self
    }

    /// Resolve unanswered questions with `answer` instead of failing them
    pub fn with_fallback_answer(mut self, answer: impl Into<String>) -> Self {
        self.question_timeout_policy = QuestionTimeoutMode::Fallback;
        self.question_fallback_answer = Some(answer.into());
        self
    }

    /// Set the pending question capacity
    pub fn with_max_pending_questions(mut self, max: usize) -> Self {
        self.max_pending_questions = max;
        self
    }

    /// Set the retention window for terminal jobs
    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    /// Set the maximum number of LLM turns per job
    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = turns;
        self
    }
}
