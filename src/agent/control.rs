//! Run lifecycle controls: create, stop, resume, step override.
//!
//! Paused and pending runs are edited directly in their checkpoint. A run
//! that is executing owns its checkpoint, so requests for it are queued in
//! the checkpoint store and picked up by the step runner at its next loop
//! boundary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::events::{EngineEvent, EventSink};
use super::plan::{PlanError, StepStatus};
use super::run::{RunOptions, RunSnapshot, RunStatus};
use crate::store::{CheckpointError, CheckpointStore};

/// Out-of-band request for an executing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Stop,
    OverrideStep { step_id: String, status: StepStatus },
}

impl ControlRequest {
    pub fn describe(&self) -> String {
        match self {
            Self::Stop => "stop".to_string(),
            Self::OverrideStep { step_id, status } => {
                format!("override {} -> {}", step_id, status.as_str())
            }
        }
    }
}

/// Apply drained requests to a snapshot the caller owns. Returns `true` on
/// a stop; requests queued after it are dropped.
pub(crate) fn apply_queued(
    snapshot: &mut RunSnapshot,
    requests: Vec<ControlRequest>,
    events: &EventSink,
) -> bool {
    let run_id = snapshot.run.id.clone();
    for request in requests {
        events.emit(EngineEvent::ControlApplied {
            run_id: run_id.clone(),
            request: request.describe(),
        });
        match request {
            ControlRequest::Stop => return true,
            ControlRequest::OverrideStep { step_id, status } => {
                if let Err(e) = snapshot.checkpoint.plan.override_status(&step_id, status) {
                    tracing::warn!(run_id = %run_id, step_id = %step_id, "Step override rejected: {}", e);
                }
            }
        }
    }
    false
}

/// Control errors.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Run not found: {0}")]
    NotFound(String),
    #[error("Run {run_id} is {status}, cannot {action}")]
    InvalidState {
        run_id: String,
        status: &'static str,
        action: &'static str,
    },
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
}

/// What a control call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Written to the checkpoint.
    Applied,
    /// Queued for the executing run.
    Queued,
    /// Nothing to do.
    Unchanged,
}

/// Lifecycle operations on stored runs.
#[derive(Clone)]
pub struct RunController {
    checkpoints: Arc<dyn CheckpointStore>,
}

impl RunController {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self { checkpoints }
    }

    /// Create and persist a pending run.
    pub async fn create(
        &self,
        goal: impl Into<String>,
        options: RunOptions,
    ) -> Result<RunSnapshot, ControlError> {
        let mut snapshot = RunSnapshot::new(goal, options);
        snapshot.touch();
        self.checkpoints.save(snapshot.id(), &snapshot).await?;
        tracing::info!(run_id = %snapshot.id(), "Run created");
        Ok(snapshot)
    }

    pub async fn status(&self, run_id: &str) -> Result<RunSnapshot, ControlError> {
        self.checkpoints
            .load(run_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(run_id.to_string()))
    }

    /// Stop a run. Terminal runs are left alone.
    ///
    /// The stop is always queued as well, so an engine that loaded the run
    /// before the status write still sees it at its next boundary.
    pub async fn stop(&self, run_id: &str) -> Result<ControlOutcome, ControlError> {
        let mut snapshot = self.status(run_id).await?;
        if snapshot.run.status.is_terminal() {
            return Ok(ControlOutcome::Unchanged);
        }
        self.checkpoints
            .push_control(run_id, ControlRequest::Stop)
            .await?;
        match snapshot.run.status {
            RunStatus::Running => Ok(ControlOutcome::Queued),
            _ => {
                snapshot.finish(RunStatus::Stopped, None);
                snapshot.touch();
                self.checkpoints.save(run_id, &snapshot).await?;
                tracing::info!(run_id, "Run stopped");
                Ok(ControlOutcome::Applied)
            }
        }
    }

    /// Make a paused run runnable again.
    ///
    /// For a run waiting on approval, `step_id` (or, without one, the step
    /// that asked) is granted. For a run waiting on a human, `step_id` is
    /// reset for a fresh set of attempts. The caller runs the engine
    /// afterwards.
    pub async fn resume(
        &self,
        run_id: &str,
        step_id: Option<&str>,
    ) -> Result<ControlOutcome, ControlError> {
        let mut snapshot = self.status(run_id).await?;
        let status = snapshot.run.status;
        if status.is_terminal() {
            return Err(ControlError::InvalidState {
                run_id: run_id.to_string(),
                status: status.as_str(),
                action: "resume",
            });
        }

        let checkpoint = &mut snapshot.checkpoint;
        match status {
            RunStatus::WaitingApproval => {
                let granted = step_id
                    .map(str::to_string)
                    .or_else(|| checkpoint.approval_request_step_id.clone());
                if let Some(granted) = granted {
                    if checkpoint.approval_request_step_id.as_deref() == Some(granted.as_str()) {
                        checkpoint.approval_request_step_id = None;
                    }
                    tracing::info!(run_id, step_id = %granted, "Approval granted");
                    checkpoint.approval_granted_step_ids.insert(granted);
                }
            }
            RunStatus::WaitingHuman => {
                if let Some(step_id) = step_id {
                    checkpoint.plan.retry_step(step_id)?;
                }
                checkpoint.escalation = None;
                checkpoint.last_error = None;
            }
            RunStatus::Pending => {
                if let Some(step_id) = step_id {
                    checkpoint.plan.retry_step(step_id)?;
                } else {
                    return Ok(ControlOutcome::Unchanged);
                }
            }
            // Left in `running` by a process that is gone; the engine
            // requeues interrupted steps on entry.
            _ => return Ok(ControlOutcome::Unchanged),
        }

        snapshot.run.status = RunStatus::Pending;
        snapshot.run.error = None;
        snapshot.touch();
        self.checkpoints.save(run_id, &snapshot).await?;
        Ok(ControlOutcome::Applied)
    }

    /// Force a step into a status.
    pub async fn override_step_status(
        &self,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
    ) -> Result<ControlOutcome, ControlError> {
        let mut snapshot = self.status(run_id).await?;
        let run_status = snapshot.run.status;
        if run_status.is_terminal() {
            return Err(ControlError::InvalidState {
                run_id: run_id.to_string(),
                status: run_status.as_str(),
                action: "override a step",
            });
        }
        if run_status == RunStatus::Running {
            self.checkpoints
                .push_control(
                    run_id,
                    ControlRequest::OverrideStep {
                        step_id: step_id.to_string(),
                        status,
                    },
                )
                .await?;
            return Ok(ControlOutcome::Queued);
        }

        snapshot.checkpoint.plan.override_status(step_id, status)?;
        snapshot.touch();
        self.checkpoints.save(run_id, &snapshot).await?;
        tracing::info!(run_id, step_id, status = status.as_str(), "Step status overridden");
        Ok(ControlOutcome::Applied)
    }
}
