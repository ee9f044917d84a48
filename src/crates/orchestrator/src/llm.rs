//! LLM collaborator boundary
//!
//! The orchestrator treats the model as an opaque source of raw text
//! fragments. Provider clients live outside this crate; [`ScriptedLlmClient`]
//! replays fixed turns for tests and the demo runner.

use crate::job::{JobId, ToolResult};
use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stream of raw text fragments
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One model turn
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub job_id: JobId,
    pub prompt: String,
    /// Results of every tool invoked so far in this job
    pub tool_results: Vec<ToolResult>,
    /// Zero-based turn number
    pub turn: u32,
    /// Cancelled when the job ends; clients should stop producing
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Start a turn and return its fragment stream
    async fn stream(&self, request: LlmRequest) -> Result<FragmentStream>;
}

/// One step of a scripted turn
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Yield a fragment
    Fragment(String),
    /// Sleep before the next step
    Delay(Duration),
    /// Yield an error and end the stream
    Fail(String),
    /// Stop producing until the request is cancelled
    Hang,
}

impl From<&str> for ScriptStep {
    fn from(fragment: &str) -> Self {
        ScriptStep::Fragment(fragment.to_string())
    }
}

/// Number of most recent requests a [`ScriptedLlmClient`] keeps
const REQUEST_HISTORY: usize = 32;

/// Replays predefined turns. Turn `n` of every job plays `turns[n]`.
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    turns: Vec<Vec<ScriptStep>>,
    requests: Mutex<VecDeque<LlmRequest>>,
}

impl ScriptedLlmClient {
    /// Turns made of plain fragments
    pub fn new(turns: Vec<Vec<String>>) -> Self {
        Self::from_steps(
            turns
                .into_iter()
                .map(|turn| turn.into_iter().map(ScriptStep::Fragment).collect())
                .collect(),
        )
    }

    pub fn from_steps(turns: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            turns,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Most recent requests received, oldest first
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn stream(&self, request: LlmRequest) -> Result<FragmentStream> {
        let steps = self
            .turns
            .get(request.turn as usize)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::Llm(format!("script has no turn {}", request.turn))
            })?;
        let cancel = request.cancel.clone();
        {
            let mut requests = self.requests.lock();
            if requests.len() == REQUEST_HISTORY {
                requests.pop_front();
            }
            requests.push_back(request);
        }

        let stream = async_stream::stream! {
            for step in steps {
                match step {
                    ScriptStep::Fragment(fragment) => yield Ok(fragment),
                    ScriptStep::Delay(delay) => tokio::time::sleep(delay).await,
                    ScriptStep::Fail(message) => {
                        yield Err(OrchestratorError::Llm(message));
                        return;
                    }
                    ScriptStep::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn request(turn: u32) -> LlmRequest {
        LlmRequest {
            job_id: "job".into(),
            prompt: "p".into(),
            tool_results: Vec::new(),
            turn,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_scripted_turns() {
        let client = ScriptedLlmClient::new(vec![vec!["a".into(), "b".into()]]);
        let fragments: Vec<_> = client
            .stream(request(0))
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["a", "b"]);
        assert_eq!(client.requests().len(), 1);

        let err = client.stream(request(1)).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Llm(_)));
    }

    #[tokio::test]
    async fn test_request_history_is_bounded() {
        let client = ScriptedLlmClient::new(vec![vec!["a".into()]]);
        for i in 0..(REQUEST_HISTORY + 8) {
            let mut req = request(0);
            req.job_id = format!("job-{i}");
            client.stream(req).await.unwrap();
        }

        let requests = client.requests();
        assert_eq!(requests.len(), REQUEST_HISTORY);
        assert_eq!(requests[0].job_id, "job-8");
        assert_eq!(
            requests.last().unwrap().job_id,
            format!("job-{}", REQUEST_HISTORY + 7)
        );
    }

    #[tokio::test]
    async fn test_fail_step_ends_stream() {
        let client = ScriptedLlmClient::from_steps(vec![vec![
            "x".into(),
            ScriptStep::Fail("rate limited".into()),
            "never".into(),
        ]]);
        let mut stream = client.stream(request(0)).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "x");
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_hang_ends_on_cancel() {
        let client = ScriptedLlmClient::from_steps(vec![vec![ScriptStep::Hang]]);
        let req = request(0);
        let cancel = req.cancel.clone();
        let mut stream = client.stream(req).await.unwrap();

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
