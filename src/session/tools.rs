//! Client-side tools the assistant can call during a session.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{ToolKind, ToolSpec};

/// Default timeout for one tool call (30 seconds)
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("tool {name} timed out after {secs}s")]
    Timeout { name: String, secs: u64 },

    #[error("{0}")]
    Failed(String),
}

/// A tool the assistant may invoke
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    /// JSON schema of the parameters. Tools without one are not advertised.
    fn parameters_schema(&self) -> Option<Value> {
        None
    }

    /// Run the tool with its decoded parameters, returning the content sent back
    async fn call(&self, parameters: Value) -> Result<String, ToolFailure>;
}

/// Registered tool handlers, looked up by name
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ToolHandler + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn ToolHandler>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations for the session settings, sorted by name
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .filter_map(|tool| {
                let schema = tool.parameters_schema()?;
                Some(ToolSpec {
                    kind: ToolKind::Function,
                    name: tool.name().to_string(),
                    parameters: schema.to_string(),
                    description: tool.description().map(str::to_string),
                    fallback_content: None,
                })
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Run a tool by name with timeout protection
    pub async fn invoke(&self, name: &str, parameters_json: &str) -> Result<String, ToolFailure> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolFailure::NotFound(name.to_string()))?;

        let parameters: Value = if parameters_json.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(parameters_json)
                .map_err(|e| ToolFailure::InvalidParameters(e.to_string()))?
        };

        debug!(tool = name, timeout_secs = self.timeout.as_secs(), "Invoking tool");

        match tokio::time::timeout(self.timeout, tool.call(parameters)).await {
            Ok(result) => result,
            Err(_) => Err(ToolFailure::Timeout {
                name: name.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
