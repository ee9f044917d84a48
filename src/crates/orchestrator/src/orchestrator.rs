//! Task execution orchestrator
//!
//! Drives one job from `Pending` to a terminal state:
//!
//! 1. Pull raw fragments from the [`LlmClient`] and feed them to the job's
//!    [`StreamClassifier`]
//! 2. Emit every classified event as `progress` on the output channel
//! 3. Run tool calls, routing interactive tools through the
//!    [`QuestionBroker`] and suspending until they are answered
//! 4. Start another turn with the tool results until the model completes
//!
//! Every suspension point is raced against cancellation, consumer
//! disconnect, the job's deadlines and explicit progress signals. Exactly
//! one terminal event (`completion` or `error`) is emitted per job.

use crate::broker::{QuestionBroker, QuestionDelivery, QuestionPrompt, QuestionRequest};
use crate::channel::{EventType, OutputChannel, OutputEvent, OutputPayload};
use crate::classifier::{EventKind, SemanticEvent, StreamClassifier, ToolInvocation};
use crate::config::OrchestratorConfig;
use crate::job::{JobId, JobOutcome, JobState, TerminalKind, ToolResult};
use crate::llm::{LlmClient, LlmRequest};
use crate::registry::JobHandle;
use crate::timer::JobTimers;
use crate::tools::ToolInvoker;
use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CONSUMER_DISCONNECTED: &str = "consumer disconnected";

/// How long the terminal event may wait on a full output channel
const TERMINAL_EMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a job stopped early
#[derive(Debug)]
enum Termination {
    Failed(String),
    TimedOut(String),
    Cancelled(String),
}

type Step<T> = std::result::Result<T, Termination>;

impl Termination {
    fn from_error(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Timeout(reason) => Termination::TimedOut(reason),
            OrchestratorError::Cancelled(reason) => Termination::Cancelled(reason),
            OrchestratorError::ChannelClosed(_) => {
                Termination::Cancelled(CONSUMER_DISCONNECTED.to_string())
            }
            other => Termination::Failed(other.to_string()),
        }
    }
}

/// Emits questions on the job's output channel
struct ChannelDelivery {
    channel: Arc<dyn OutputChannel>,
}

#[async_trait]
impl QuestionDelivery for ChannelDelivery {
    async fn deliver(&self, prompt: &QuestionPrompt) -> Result<()> {
        self.channel
            .emit(OutputEvent::new(
                prompt.job_id.clone(),
                EventType::QuestionAsk,
                OutputPayload::Question(prompt.clone()),
            ))
            .await
    }
}

/// Runs one job. Created by the registry, consumed by [`run`](Self::run).
pub struct TaskExecutionOrchestrator {
    job_id: JobId,
    handle: Arc<JobHandle>,
    config: Arc<OrchestratorConfig>,
    classifier: StreamClassifier,
    broker: Arc<QuestionBroker>,
    channel: Arc<dyn OutputChannel>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolInvoker>,
    timers: JobTimers,
    question_timeout: Option<Duration>,
    text: String,
    completion: Option<String>,
}

impl TaskExecutionOrchestrator {
    pub fn new(
        handle: Arc<JobHandle>,
        config: Arc<OrchestratorConfig>,
        classifier: StreamClassifier,
        broker: Arc<QuestionBroker>,
        channel: Arc<dyn OutputChannel>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolInvoker>,
    ) -> Self {
        let job = handle.snapshot();
        Self {
            job_id: job.id,
            timers: JobTimers::new(
                Duration::from_millis(job.sliding_timeout_ms),
                job.hard_timeout_ms.map(Duration::from_millis),
            ),
            question_timeout: job.question_timeout_ms.map(Duration::from_millis),
            handle,
            config,
            classifier,
            broker,
            channel,
            llm,
            tools,
            text: String::new(),
            completion: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Execute the job and return its terminal outcome
    pub async fn run(mut self) -> JobOutcome {
        let ending = self.execute().await;
        self.finish(ending).await
    }

    async fn execute(&mut self) -> Step<Option<String>> {
        self.check_cancelled()?;
        self.transition(JobState::Running)?;
        self.timers.arm();

        let sliding = self.timers.sliding();
        let hard = self.timers.hard();
        let job = self.handle.update(|job| {
            job.touch(sliding);
            job.absolute_deadline = hard
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .and_then(|d| Utc::now().checked_add_signed(d));
            job.clone()
        });

        info!(
            job_id = %self.job_id,
            kind = ?job.kind,
            sliding_timeout_ms = job.sliding_timeout_ms,
            hard_timeout_ms = ?job.hard_timeout_ms,
            "Job started"
        );
        self.emit(
            EventType::Start,
            OutputPayload::Start {
                kind: job.kind,
                prompt: job.prompt.clone(),
            },
        )
        .await?;

        let max_turns = self.config.max_turns;
        for turn in 0..max_turns {
            let tool_calls = self.run_turn(turn, &job.prompt).await?;

            if let Some(result) = self.completion.clone() {
                return Ok(Some(result));
            }
            if tool_calls == 0 {
                let text = self.text.trim();
                return Ok((!text.is_empty()).then(|| text.to_string()));
            }
            debug!(job_id = %self.job_id, turn, tool_calls, "Turn ended with tool results");
        }

        Err(Termination::Failed(format!(
            "no completion after {} turns",
            max_turns
        )))
    }

    /// Stream one model turn. Returns the number of tool calls it made.
    async fn run_turn(&mut self, turn: u32, prompt: &str) -> Step<usize> {
        let turn_cancel = self.handle.cancel_token().child_token();
        let request = LlmRequest {
            job_id: self.job_id.clone(),
            prompt: prompt.to_string(),
            tool_results: self.handle.snapshot().tool_results,
            turn,
            cancel: turn_cancel.clone(),
        };

        let llm = Arc::clone(&self.llm);
        let mut stream = self
            .race(async move { llm.stream(request).await })
            .await?
            .map_err(|e| {
                warn!(job_id = %self.job_id, turn, error = %e, "LLM request failed");
                Termination::Failed(e.to_string())
            })?;

        let mut tool_calls = 0;
        let streamed = loop {
            let fragment = match self.race(stream.next()).await {
                Ok(Some(Ok(fragment))) => fragment,
                Ok(Some(Err(e))) => {
                    warn!(job_id = %self.job_id, turn, error = %e, "LLM stream failed");
                    break Err(Termination::Failed(e.to_string()));
                }
                Ok(None) => break Ok(()),
                Err(ending) => break Err(ending),
            };

            self.touch();
            let events = self.classifier.feed(&fragment);
            match self.dispatch(events).await {
                Ok(n) => tool_calls += n,
                Err(ending) => break Err(ending),
            }
            if self.completion.is_some() {
                break Ok(());
            }
        };

        drop(stream);
        turn_cancel.cancel();
        streamed?;

        let trailing = self.classifier.finish();
        tool_calls += self.dispatch(trailing).await?;
        Ok(tool_calls)
    }

    /// Emit classified events and run the tool calls among them
    async fn dispatch(&mut self, events: Vec<SemanticEvent>) -> Step<usize> {
        let mut tool_calls = 0;
        for event in events {
            if self.completion.is_some() {
                debug!(
                    job_id = %self.job_id,
                    seq = event.seq,
                    kind = event.kind.as_str(),
                    "Discarding event after completion"
                );
                continue;
            }

            match event.kind {
                EventKind::Text => self.text.push_str(event.text().unwrap_or_default()),
                EventKind::Completion => {
                    self.completion = Some(event.text().unwrap_or_default().to_string());
                }
                EventKind::Thinking | EventKind::ToolCall => {}
            }

            let call = event.tool_call().cloned();
            self.emit(EventType::Progress, OutputPayload::Event(event))
                .await?;

            if let Some(call) = call {
                tool_calls += 1;
                let result = self.run_tool(call).await?;
                self.handle.update(|job| job.tool_results.push(result));
            }
        }
        Ok(tool_calls)
    }

    async fn run_tool(&mut self, call: ToolInvocation) -> Step<ToolResult> {
        self.check_cancelled()?;
        self.touch();

        let output = if self.config.is_interactive_tool(&call.name) {
            self.ask_human(&call).await?
        } else {
            debug!(job_id = %self.job_id, tool = %call.name, call_id = %call.id, "Invoking tool");
            let tools = Arc::clone(&self.tools);
            let name = call.name.clone();
            let args = call.arguments.clone();
            match self.race(async move { tools.invoke(&name, args).await }).await? {
                Ok(output) => output,
                Err(e) => {
                    warn!(job_id = %self.job_id, tool = %call.name, error = %e, "Tool failed");
                    let failed = ToolResult::failure(call.id.clone(), call.name.clone(), e.to_string());
                    self.handle.update(|job| job.tool_results.push(failed));
                    return Err(Termination::Failed(e.to_string()));
                }
            }
        };

        self.check_cancelled()?;
        self.touch();
        Ok(ToolResult::success(call.id, call.name, output))
    }

    /// Ask the question carried by an interactive tool call and wait for
    /// the answer. The inactivity deadline is suspended meanwhile; the
    /// question's own timeout and the hard cap still apply.
    async fn ask_human(&mut self, call: &ToolInvocation) -> Step<Value> {
        let question = call.str_arg(&["question", "prompt"]).ok_or_else(|| {
            Termination::Failed(format!("tool '{}' requires a question argument", call.name))
        })?;
        let choices: Vec<String> = ["options", "choices"]
            .iter()
            .find_map(|key| call.arguments.get(*key))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut request = QuestionRequest::new(self.job_id.clone(), question).with_choices(choices);
        let timeout = call
            .arguments
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .or(self.question_timeout);
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }

        self.transition(JobState::AwaitingAnswer)?;
        self.timers.suspend_activity();

        let broker = Arc::clone(&self.broker);
        let delivery = ChannelDelivery {
            channel: Arc::clone(&self.channel),
        };
        let pending = self
            .race(async move { broker.ask(request, &delivery).await })
            .await?
            .map_err(Termination::from_error)?;

        let question_id = pending.question_id().to_string();
        self.handle
            .update(|job| job.pending_question = Some(question_id.clone()));
        info!(job_id = %self.job_id, question_id = %question_id, "Awaiting answer");

        let answer = self.race(pending).await?.map_err(Termination::from_error)?;

        self.handle.update(|job| job.pending_question = None);
        self.timers.resume_activity();
        self.transition(JobState::Running)?;
        self.touch();
        info!(job_id = %self.job_id, question_id = %question_id, "Answer received, resuming");

        Ok(Value::String(answer))
    }

    /// Await `fut` unless the job is cancelled, disconnected or times out
    /// first. Progress signals reset the inactivity deadline meanwhile.
    async fn race<F: Future>(&mut self, fut: F) -> Step<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.handle.cancel_token().cancelled() => return Err(self.cancelled()),
                _ = self.channel.closed() => {
                    return Err(Termination::Cancelled(CONSUMER_DISCONNECTED.to_string()));
                }
                expiry = self.timers.expired() => {
                    let reason = expiry.describe(self.timers.sliding(), self.timers.hard());
                    return Err(Termination::TimedOut(reason));
                }
                _ = self.handle.activity().notified() => self.touch(),
                output = &mut fut => return Ok(output),
            }
        }
    }

    async fn emit(&mut self, event_type: EventType, payload: OutputPayload) -> Step<()> {
        let channel = Arc::clone(&self.channel);
        let event = OutputEvent::new(self.job_id.clone(), event_type, payload);
        self.race(async move { channel.emit(event).await })
            .await?
            .map_err(Termination::from_error)
    }

    fn check_cancelled(&self) -> Step<()> {
        if self.handle.cancel_token().is_cancelled() {
            return Err(self.cancelled());
        }
        if self.channel.is_closed() {
            return Err(Termination::Cancelled(CONSUMER_DISCONNECTED.to_string()));
        }
        Ok(())
    }

    fn cancelled(&self) -> Termination {
        Termination::Cancelled(
            self.handle
                .cancel_reason()
                .unwrap_or_else(|| "cancelled".to_string()),
        )
    }

    fn touch(&mut self) {
        self.timers.touch();
        let sliding = self.timers.sliding();
        self.handle.update(|job| job.touch(sliding));
    }

    fn transition(&self, state: JobState) -> Step<()> {
        self.handle
            .update(|job| job.transition(state))
            .map_err(|e| Termination::Failed(e.to_string()))
    }

    /// Record the terminal state, publish the outcome and emit the single
    /// terminal event
    async fn finish(mut self, ending: Step<Option<String>>) -> JobOutcome {
        self.timers.clear();

        let (kind, result, reason) = match ending {
            Ok(result) => (TerminalKind::Completed, result, None),
            Err(Termination::Failed(reason)) => (TerminalKind::Failed, None, Some(reason)),
            Err(Termination::TimedOut(reason)) => (TerminalKind::TimedOut, None, Some(reason)),
            Err(Termination::Cancelled(reason)) => (TerminalKind::Cancelled, None, Some(reason)),
        };

        if let Some(reason) = &reason {
            self.broker.cancel_job(&self.job_id, reason);
        }

        let outcome = self.handle.update(|job| {
            job.result = result.clone();
            job.error = reason.clone();
            if kind == TerminalKind::Cancelled {
                job.cancel_reason = reason.clone();
            }
            if let Err(e) = job.transition(kind.state()) {
                error!(job_id = %job.id, error = %e, "Terminal transition rejected");
            }
            JobOutcome {
                job_id: job.id.clone(),
                kind,
                result: result.clone(),
                error: reason.clone(),
                tool_results: job.tool_results.clone(),
                finished_at: job.finished_at.unwrap_or_else(Utc::now),
            }
        });

        let (event_type, payload) = match &reason {
            None => (
                EventType::Completion,
                OutputPayload::Completion {
                    result: outcome.result.clone(),
                    tool_results: outcome.tool_results.clone(),
                },
            ),
            Some(reason) => (
                EventType::Error,
                OutputPayload::Error {
                    kind,
                    reason: reason.clone(),
                },
            ),
        };
        // waiters must not depend on the consumer draining its channel
        self.handle.publish(outcome.clone());

        let event = OutputEvent::new(self.job_id.clone(), event_type, payload);
        let channel = Arc::clone(&self.channel);
        tokio::select! {
            biased;
            _ = self.channel.closed() => {
                debug!(job_id = %self.job_id, "Consumer gone, terminal event dropped");
            }
            delivered = tokio::time::timeout(TERMINAL_EMIT_TIMEOUT, channel.emit(event)) => {
                match delivered {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(job_id = %self.job_id, error = %e, "Terminal event not delivered")
                    }
                    Err(_) => warn!(
                        job_id = %self.job_id,
                        timeout_ms = TERMINAL_EMIT_TIMEOUT.as_millis() as u64,
                        "Consumer not reading, terminal event dropped"
                    ),
                }
            }
        }

        match kind {
            TerminalKind::Completed => info!(job_id = %self.job_id, "Job completed"),
            TerminalKind::Failed => {
                error!(job_id = %self.job_id, reason = ?outcome.error, "Job failed")
            }
            TerminalKind::TimedOut => {
                warn!(job_id = %self.job_id, reason = ?outcome.error, "Job timed out")
            }
            TerminalKind::Cancelled => {
                info!(job_id = %self.job_id, reason = ?outcome.error, "Job cancelled")
            }
        }

        outcome
    }
}

impl std::fmt::Debug for TaskExecutionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutionOrchestrator")
            .field("job_id", &self.job_id)
            .field("timers", &self.timers)
            .finish()
    }
}
