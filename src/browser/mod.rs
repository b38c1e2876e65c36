//! Browser driver boundary.
//!
//! The engine never talks to a browser directly: it launches a
//! [`BrowserSession`] through a [`BrowserDriver`] and invokes it through the
//! [`ToolExecutor`], which adds the slow-call watchdog.

mod command;
mod executor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::{CommandDriver, CommandDriverConfig};
pub use executor::ToolExecutor;

/// Browser driver errors.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to launch browser session: {0}")]
    Launch(String),
    #[error("Driver command failed: {0}")]
    CommandFailed(String),
    #[error("Invalid driver output: {0}")]
    InvalidOutput(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How much work a tool call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeKind {
    /// Full browser-automation run for the step.
    Full,
    /// Look at the current state only.
    Observe,
}

impl InvokeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Observe => "observe",
        }
    }
}

/// Parameters handed to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub run_id: String,
    pub step_id: String,
    pub goal: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
    /// Location the previous step left the browser at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
}

/// Structured output of a successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub log_count: u32,
}

/// Result of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<ToolOutput>,
}

impl ToolOutcome {
    pub fn success(location_id: Option<String>, log_count: u32) -> Self {
        Self {
            ok: true,
            error: None,
            output: Some(ToolOutput {
                location_id,
                log_count,
            }),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            output: None,
        }
    }

    pub fn location_id(&self) -> Option<&str> {
        self.output.as_ref().and_then(|o| o.location_id.as_deref())
    }

    pub fn log_count(&self) -> u32 {
        self.output.as_ref().map(|o| o.log_count).unwrap_or(0)
    }
}

/// Launch parameters for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
    pub tool_model: String,
}

/// Starts isolated browser sessions, one per run.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(
        &self,
        run_id: &str,
        options: &LaunchOptions,
    ) -> Result<Box<dyn BrowserSession>, ToolError>;
}

/// A live browser session owned by exactly one run.
///
/// `Sync` so a step runner borrowing its executor can be held across awaits
/// on a spawned task.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Run one tool call. Driver failures are reported in the outcome, not
    /// as an error.
    async fn invoke(&mut self, kind: InvokeKind, request: &ToolRequest) -> ToolOutcome;

    /// Release the browser process, context and working directory.
    async fn close(&mut self) -> Result<(), ToolError>;
}
