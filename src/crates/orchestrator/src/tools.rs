//! Tool collaborator boundary
//!
//! [`ToolInvoker`] is what the orchestrator calls for every non-interactive
//! tool invocation. [`ToolRegistry`] is the in-process implementation: a
//! name to async handler map.

use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Future returned by a tool handler
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Tool handler function
pub type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Run tool `name` with `args`
    async fn invoke(&self, name: &str, args: Value) -> Result<Value>;
}

struct RegisteredTool {
    description: String,
    handler: ToolHandler,
}

/// Collection of available tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create a new empty tool registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: ToolHandler,
    ) {
        self.tools.insert(
            name.into(),
            RegisteredTool {
                description: description.into(),
                handler,
            },
        );
    }

    /// Register an async function as a tool
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, description: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, description, Arc::new(move |args| Box::pin(f(args))));
    }

    /// Builder form of [`ToolRegistry::register_fn`]
    pub fn with_tool<F, Fut>(mut self, name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register_fn(name, description, f);
        self
    }

    /// Check if a tool exists
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Description of a tool
    pub fn description(&self, name: &str) -> Option<&str> {
        self.tools.get(name).map(|t| t.description.as_str())
    }

    /// Get all tool names, sorted
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        let tool = self.tools.get(name).ok_or_else(|| OrchestratorError::Tool {
            name: name.to_string(),
            message: format!("tool not found, available tools: {}", self.tool_names().join(", ")),
        })?;

        debug!(tool = name, "Invoking tool");
        (tool.handler)(args).await.map_err(|e| match e {
            err @ OrchestratorError::Tool { .. } => err,
            other => OrchestratorError::Tool {
                name: name.to_string(),
                message: other.to_string(),
            },
        })
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ToolRegistry {
        ToolRegistry::new()
            .with_tool("echo", "Echo arguments back", |args| async move { Ok(args) })
            .with_tool("fail", "Always fails", |_| async move {
                Err(OrchestratorError::ExecutionFailed("disk full".into()))
            })
    }

    #[tokio::test]
    async fn test_invoke_registered_tool() {
        let tools = registry();
        let out = tools.invoke("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
        assert_eq!(tools.tool_names(), vec!["echo", "fail"]);
        assert_eq!(tools.description("echo"), Some("Echo arguments back"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_tool_error() {
        let err = registry().invoke("missing", json!({})).await.unwrap_err();
        match err {
            OrchestratorError::Tool { name, message } => {
                assert_eq!(name, "missing");
                assert!(message.contains("echo"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_errors_are_wrapped() {
        let err = registry().invoke("fail", json!({})).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Tool { ref name, .. } if name == "fail"));
        assert!(err.to_string().contains("disk full"));
    }
}
