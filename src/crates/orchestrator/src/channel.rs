//! Output channels
//!
//! Every job writes [`OutputEvent`]s to exactly one [`OutputChannel`], chosen
//! at creation through an explicit [`DeliveryMode`]. A channel also reports
//! consumer disconnect, which the orchestrator treats as cancellation.

use crate::broker::QuestionPrompt;
use crate::classifier::SemanticEvent;
use crate::job::{JobId, JobKind, TerminalKind, ToolResult};
use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, trace};

/// Type of output event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Job started executing
    Start,
    /// Classified LLM output
    Progress,
    /// Job is waiting on a human answer
    QuestionAsk,
    /// Job completed successfully
    Completion,
    /// Job failed, timed out or was cancelled
    Error,
}

impl EventType {
    /// Convert event type to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Progress => "progress",
            EventType::QuestionAsk => "question_ask",
            EventType::Completion => "completion",
            EventType::Error => "error",
        }
    }

    /// Whether this is one of the two terminal event types
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Completion | EventType::Error)
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPayload {
    Start {
        kind: JobKind,
        prompt: String,
    },
    Event(SemanticEvent),
    Question(QuestionPrompt),
    Completion {
        result: Option<String>,
        tool_results: Vec<ToolResult>,
    },
    Error {
        kind: TerminalKind,
        reason: String,
    },
}

/// Event written to an output channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub job_id: JobId,
    pub event_type: EventType,
    pub payload: OutputPayload,
    pub timestamp: DateTime<Utc>,
}

impl OutputEvent {
    pub fn new(job_id: impl Into<JobId>, event_type: EventType, payload: OutputPayload) -> Self {
        Self {
            job_id: job_id.into(),
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Semantic event carried by a progress event
    pub fn semantic(&self) -> Option<&SemanticEvent> {
        match &self.payload {
            OutputPayload::Event(event) => Some(event),
            _ => None,
        }
    }

    /// Question carried by a question event
    pub fn question(&self) -> Option<&QuestionPrompt> {
        match &self.payload {
            OutputPayload::Question(prompt) => Some(prompt),
            _ => None,
        }
    }

    /// Serialize as one JSON line
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Sink for one job's output
#[async_trait]
pub trait OutputChannel: Send + Sync {
    /// Deliver one event
    async fn emit(&self, event: OutputEvent) -> Result<()>;

    /// Resolves when the consumer has gone away. Channels without a notion
    /// of disconnect never resolve.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }

    /// Non-blocking disconnect check
    fn is_closed(&self) -> bool {
        false
    }
}

/// Receiving side of a [`StreamChannel`]
pub type OutputStream = mpsc::Receiver<OutputEvent>;

/// Bounded single-consumer channel. Dropping the receiver cancels the job.
#[derive(Debug, Clone)]
pub struct StreamChannel {
    tx: mpsc::Sender<OutputEvent>,
}

impl StreamChannel {
    pub fn new(buffer_size: usize) -> (Self, OutputStream) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OutputChannel for StreamChannel {
    async fn emit(&self, event: OutputEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| OrchestratorError::ChannelClosed(format!("stream for job {}", e.0.job_id)))
    }

    async fn closed(&self) {
        self.tx.closed().await
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Fan-out to any number of subscribers. Events sent while nobody is
/// subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    tx: broadcast::Sender<OutputEvent>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<OutputEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl OutputChannel for BroadcastChannel {
    async fn emit(&self, event: OutputEvent) -> Result<()> {
        if self.tx.send(event).is_err() {
            trace!("No broadcast subscribers, event dropped");
        }
        Ok(())
    }
}

/// Writes events as `tracing` records
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl OutputChannel for LogChannel {
    async fn emit(&self, event: OutputEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        info!(
            target: "task_orchestrator::output",
            job_id = %event.job_id,
            event_type = event.event_type.as_str(),
            payload = %payload,
            "Job output"
        );
        Ok(())
    }
}

/// Where a job's output goes. Always chosen explicitly at job creation.
#[derive(Clone, Default)]
pub enum DeliveryMode {
    Stream(StreamChannel),
    Broadcast(BroadcastChannel),
    #[default]
    Log,
    Custom(Arc<dyn OutputChannel>),
}

impl DeliveryMode {
    /// Stream mode with its receiver
    pub fn stream(buffer_size: usize) -> (Self, OutputStream) {
        let (channel, rx) = StreamChannel::new(buffer_size);
        (DeliveryMode::Stream(channel), rx)
    }

    /// Broadcast mode with a first subscriber
    pub fn broadcast(capacity: usize) -> (Self, broadcast::Receiver<OutputEvent>) {
        let (channel, rx) = BroadcastChannel::new(capacity);
        (DeliveryMode::Broadcast(channel), rx)
    }

    pub fn custom(channel: Arc<dyn OutputChannel>) -> Self {
        DeliveryMode::Custom(channel)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeliveryMode::Stream(_) => "stream",
            DeliveryMode::Broadcast(_) => "broadcast",
            DeliveryMode::Log => "log",
            DeliveryMode::Custom(_) => "custom",
        }
    }

    /// Build the channel the orchestrator writes to
    pub fn into_channel(self) -> Arc<dyn OutputChannel> {
        match self {
            DeliveryMode::Stream(channel) => Arc::new(channel),
            DeliveryMode::Broadcast(channel) => Arc::new(channel),
            DeliveryMode::Log => Arc::new(LogChannel),
            DeliveryMode::Custom(channel) => channel,
        }
    }
}

impl std::fmt::Debug for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
