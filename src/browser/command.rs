//! Browser driver backed by an external program.
//!
//! The program is called once per operation:
//!
//! - `<program> launch --run-id <id> [--headless] [--model <name>]`
//! - `<program> invoke --kind full|observe` with the JSON [`ToolRequest`] on
//!   stdin, printing a JSON [`ToolOutcome`] on stdout
//! - `<program> close --run-id <id>`
//!
//! Every call runs inside the run's own working directory, which is created
//! on launch and removed on close.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{
    BrowserDriver, BrowserSession, InvokeKind, LaunchOptions, ToolError, ToolOutcome, ToolRequest,
};

/// Configuration for [`CommandDriver`].
#[derive(Debug, Clone)]
pub struct CommandDriverConfig {
    /// Driver executable.
    pub program: String,
    /// Arguments placed before the sub-command.
    pub args: Vec<String>,
    /// Parent of the per-run working directories.
    pub work_root: PathBuf,
}

impl Default for CommandDriverConfig {
    fn default() -> Self {
        Self {
            program: "browser-driver".to_string(),
            args: Vec::new(),
            work_root: std::env::temp_dir().join("browser-agent"),
        }
    }
}

impl CommandDriverConfig {
    /// Split a command line such as `node driver.js` into program and args.
    pub fn from_command_line(command: &str, work_root: impl Into<PathBuf>) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            work_root: work_root.into(),
        })
    }
}

/// Launches one driver-backed session per run.
pub struct CommandDriver {
    config: CommandDriverConfig,
}

impl CommandDriver {
    pub fn new(config: CommandDriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserDriver for CommandDriver {
    async fn launch(
        &self,
        run_id: &str,
        options: &LaunchOptions,
    ) -> Result<Box<dyn BrowserSession>, ToolError> {
        let work_dir = self.config.work_root.join(run_id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let session = CommandSession {
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            work_dir,
            run_id: run_id.to_string(),
            closed: false,
        };

        let mut launch_args = vec!["launch".to_string(), "--run-id".to_string(), run_id.to_string()];
        if options.headless {
            launch_args.push("--headless".to_string());
        }
        if !options.tool_model.is_empty() {
            launch_args.push("--model".to_string());
            launch_args.push(options.tool_model.clone());
        }

        match session.run(&launch_args, None).await {
            Ok(output) if output.status.success() => {
                tracing::info!(run_id, work_dir = %session.work_dir.display(), "Browser session launched");
                Ok(Box::new(session))
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let _ = tokio::fs::remove_dir_all(&session.work_dir).await;
                Err(ToolError::Launch(stderr))
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&session.work_dir).await;
                Err(ToolError::Launch(e.to_string()))
            }
        }
    }
}

struct CommandSession {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
    run_id: String,
    closed: bool,
}

impl CommandSession {
    async fn run(
        &self,
        sub_args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<std::process::Output, ToolError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(sub_args)
            .current_dir(&self.work_dir)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&bytes).await?;
                pipe.shutdown().await?;
            }
        }

        Ok(child.wait_with_output().await?)
    }
}

/// Read the driver's JSON answer, tolerating log lines before it.
fn parse_outcome(stdout: &str) -> Option<ToolOutcome> {
    if let Ok(outcome) = serde_json::from_str::<ToolOutcome>(stdout.trim()) {
        return Some(outcome);
    }
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<ToolOutcome>(line).ok())
}

#[async_trait]
impl BrowserSession for CommandSession {
    async fn invoke(&mut self, kind: InvokeKind, request: &ToolRequest) -> ToolOutcome {
        if self.closed {
            return ToolOutcome::failure("browser session already closed");
        }
        let payload = match serde_json::to_vec(request) {
            Ok(payload) => payload,
            Err(e) => return ToolOutcome::failure(format!("failed to encode request: {}", e)),
        };
        let args = vec![
            "invoke".to_string(),
            "--kind".to_string(),
            kind.as_str().to_string(),
        ];

        let output = match self.run(&args, Some(payload)).await {
            Ok(output) => output,
            Err(e) => return ToolOutcome::failure(e.to_string()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_outcome(&stdout) {
            Some(outcome) => outcome,
            None if output.status.success() => ToolOutcome::failure(
                ToolError::InvalidOutput(stdout.chars().take(200).collect()).to_string(),
            ),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                ToolOutcome::failure(ToolError::CommandFailed(stderr).to_string())
            }
        }
    }

    async fn close(&mut self) -> Result<(), ToolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let args = vec![
            "close".to_string(),
            "--run-id".to_string(),
            self.run_id.clone(),
        ];
        let result = self.run(&args, None).await;
        // The working directory goes regardless of what the driver said.
        if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
            tracing::warn!(run_id = %self.run_id, "Failed to remove working directory: {}", e);
        }

        match result {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(ToolError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outcome_plain_json() {
        let outcome =
            parse_outcome(r#"{"ok": true, "output": {"location_id": "a.com/x", "log_count": 3}}"#)
                .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.location_id(), Some("a.com/x"));
        assert_eq!(outcome.log_count(), 3);
    }

    #[test]
    fn test_parse_outcome_after_log_lines() {
        let stdout = "starting chromium\nnavigating...\n{\"ok\": false, \"error\": \"element not found\"}\n";
        let outcome = parse_outcome(stdout).unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("element not found"));
        assert!(parse_outcome("no json here").is_none());
    }

    #[test]
    fn test_config_from_command_line() {
        let config = CommandDriverConfig::from_command_line("node driver.js --verbose", "/tmp/w")
            .unwrap();
        assert_eq!(config.program, "node");
        assert_eq!(config.args, vec!["driver.js", "--verbose"]);
        assert!(CommandDriverConfig::from_command_line("   ", "/tmp/w").is_none());
    }

    #[tokio::test]
    async fn test_launch_failure_cleans_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let driver = CommandDriver::new(CommandDriverConfig {
            program: "definitely-not-a-real-browser-driver".to_string(),
            args: Vec::new(),
            work_root: dir.path().to_path_buf(),
        });
        let options = LaunchOptions {
            headless: true,
            tool_model: String::new(),
        };

        let result = driver.launch("run-x", &options).await;
        assert!(matches!(result, Err(ToolError::Launch(_))));
        assert!(!dir.path().join("run-x").exists());
    }
}
