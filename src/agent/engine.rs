//! Control loop: load a run, launch its browser session, hand it to the
//! step runner and finalize whatever comes back.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use super::control::{self, RunController};
use super::events::{EngineEvent, EventSink};
use super::loop_guard::normalize_title;
use super::plan::{Plan, PlanError, StepStatus};
use super::policy;
use super::run::{RunSnapshot, RunStatus, Verification};
use super::runner::{last_known_location, RunnerExit, StepRunner};
use crate::browser::{BrowserDriver, LaunchOptions, ToolError, ToolExecutor};
use crate::planner::{Planner, PlannerContext, PlannerError, ReplanReason, StepView};
use crate::store::{tags, CheckpointError, CheckpointStore, MemoryStore, MemoryWriteOutcome};

/// Steps of history and lookahead shown to the planner.
const PLAN_EXCERPT_BEFORE: usize = 5;
const PLAN_EXCERPT_AFTER: usize = 8;

/// Words of the goal used as the long-term memory key.
const MEMORY_KEY_WORDS: usize = 8;

/// Engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Run not found: {0}")]
    NotFound(String),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),
    #[error("Browser error: {0}")]
    Tool(#[from] ToolError),
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
}

/// Where a run ended up after one pass of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub steps_executed: u32,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub verification: Option<Verification>,
}

impl RunReport {
    fn from_snapshot(snapshot: &RunSnapshot) -> Self {
        let checkpoint = &snapshot.checkpoint;
        Self {
            run_id: snapshot.run.id.clone(),
            status: snapshot.run.status,
            error: snapshot.run.error.clone(),
            steps_executed: checkpoint.counters.steps_executed,
            completed_steps: checkpoint.plan.completed_count(),
            total_steps: checkpoint.plan.len(),
            verification: checkpoint.verification.clone(),
        }
    }
}

/// Runs agent runs. Cheap to clone; every clone shares the collaborators.
#[derive(Clone)]
pub struct Engine {
    pub(crate) planner: Arc<dyn Planner>,
    pub(crate) driver: Arc<dyn BrowserDriver>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) memory: Arc<dyn MemoryStore>,
    pub(crate) events: EventSink,
}

impl Engine {
    pub fn new(
        planner: Arc<dyn Planner>,
        driver: Arc<dyn BrowserDriver>,
        checkpoints: Arc<dyn CheckpointStore>,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            planner,
            driver,
            checkpoints,
            memory,
            events: EventSink::new(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Lifecycle controls over the same checkpoint store.
    pub fn controller(&self) -> RunController {
        RunController::new(self.checkpoints.clone())
    }

    /// Run on a separate tokio task.
    pub fn spawn(&self, run_id: impl Into<String>) -> JoinHandle<Result<RunReport, EngineError>> {
        let engine = self.clone();
        let run_id = run_id.into();
        tokio::spawn(async move { engine.run(&run_id).await })
    }

    /// Execute a run until it completes, fails, stops or pauses.
    pub async fn run(&self, run_id: &str) -> Result<RunReport, EngineError> {
        let mut snapshot = self
            .checkpoints
            .load(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(run_id.to_string()))?;

        if snapshot.run.status.is_terminal() {
            tracing::info!(run_id, status = snapshot.run.status.as_str(), "Run already finished");
            return Ok(RunReport::from_snapshot(&snapshot));
        }
        // Only an explicit resume clears a human escalation. A run waiting on
        // approval re-enters and stops again at the gate.
        if snapshot.run.status == RunStatus::WaitingHuman {
            tracing::info!(run_id, "Run is waiting for a human, resume it first");
            return Ok(RunReport::from_snapshot(&snapshot));
        }

        let requeued = snapshot.checkpoint.plan.requeue_interrupted();
        if requeued > 0 {
            tracing::info!(run_id, requeued, "Requeued interrupted steps");
        }
        snapshot.run.status = RunStatus::Running;
        snapshot.run.error = None;
        snapshot.run.started_at.get_or_insert_with(chrono::Utc::now);
        self.save(&mut snapshot).await?;
        self.events.emit(EngineEvent::RunStarted {
            run_id: run_id.to_string(),
            goal: snapshot.run.goal.clone(),
        });

        // A stop that raced the load above is only visible in the queue.
        let requests = self.checkpoints.drain_controls(run_id).await?;
        let exit = if control::apply_queued(&mut snapshot, requests, &self.events) {
            RunnerExit::Stopped
        } else {
            match self.drive(&mut snapshot).await {
                Ok(exit) => exit,
                Err(e) => {
                    tracing::error!(run_id, "Run aborted: {}", e);
                    RunnerExit::Failed {
                        error: e.to_string(),
                    }
                }
            }
        };

        match exit {
            RunnerExit::Completed => snapshot.finish(RunStatus::Completed, None),
            RunnerExit::Failed { error } => snapshot.finish(RunStatus::Failed, Some(error)),
            RunnerExit::Stopped => snapshot.finish(RunStatus::Stopped, None),
            RunnerExit::WaitingApproval { .. } => snapshot.run.status = RunStatus::WaitingApproval,
            RunnerExit::WaitingHuman { .. } => snapshot.run.status = RunStatus::WaitingHuman,
        }
        self.save(&mut snapshot).await?;

        self.events.emit(EngineEvent::RunFinished {
            run_id: run_id.to_string(),
            status: snapshot.run.status,
            error: snapshot.run.error.clone(),
        });
        Ok(RunReport::from_snapshot(&snapshot))
    }

    async fn save(&self, snapshot: &mut RunSnapshot) -> Result<(), EngineError> {
        snapshot.touch();
        self.checkpoints.save(&snapshot.run.id, snapshot).await?;
        Ok(())
    }

    /// Plan, launch, execute, clean up.
    async fn drive(&self, snapshot: &mut RunSnapshot) -> Result<RunnerExit, EngineError> {
        if snapshot.checkpoint.plan.is_empty() {
            self.initial_plan(snapshot).await?;
            if snapshot.checkpoint.plan.is_empty() {
                return Ok(RunnerExit::Failed {
                    error: "Planner returned an empty plan".to_string(),
                });
            }
        }

        let options = LaunchOptions {
            headless: snapshot.checkpoint.preferences.headless,
            tool_model: snapshot.run.tool_model.clone(),
        };
        let session = self.driver.launch(&snapshot.run.id, &options).await?;
        let slow_warning = Duration::from_millis(snapshot.checkpoint.settings.slow_tool_warning_ms);
        let mut executor = ToolExecutor::new(session, slow_warning);

        let result = StepRunner::new(self, snapshot, &mut executor).run().await;

        if let Err(e) = executor.close().await {
            tracing::warn!(run_id = %snapshot.run.id, "Failed to close browser session: {}", e);
        }

        match result? {
            RunnerExit::Completed => self.finalize(snapshot).await,
            other => Ok(other),
        }
    }

    async fn initial_plan(&self, snapshot: &mut RunSnapshot) -> Result<(), EngineError> {
        snapshot.checkpoint.task_type = policy::classify_task(&snapshot.run.goal);
        let ctx = self.planner_context(snapshot, Vec::new()).await;
        let drafts = self.planner.build_plan(&ctx, ReplanReason::Initial).await?;

        let max_attempts = snapshot.checkpoint.settings.max_step_attempts;
        snapshot.checkpoint.plan = Plan::new(
            drafts
                .into_iter()
                .filter(|draft| !draft.title.trim().is_empty())
                .map(|draft| draft.into_step(max_attempts))
                .collect(),
        );
        self.save(snapshot).await?;
        self.events.emit(EngineEvent::PlanCreated {
            run_id: snapshot.run.id.clone(),
            steps: snapshot.checkpoint.plan.len(),
        });
        Ok(())
    }

    /// Verify the goal, keep the lessons.
    async fn finalize(&self, snapshot: &mut RunSnapshot) -> Result<RunnerExit, EngineError> {
        let ctx = self
            .planner_context(snapshot, vec!["all plan steps finished".to_string()])
            .await;

        let verification = match self.planner.verify(&ctx).await {
            Ok(verification) => verification,
            Err(e) => {
                tracing::warn!(run_id = %snapshot.run.id, "Verification unavailable: {}", e);
                None
            }
        };
        let exit = match &verification {
            Some(v) if !v.achieved => RunnerExit::Failed {
                error: if v.summary.trim().is_empty() {
                    "Goal not achieved".to_string()
                } else {
                    v.summary.clone()
                },
            },
            _ => RunnerExit::Completed,
        };
        snapshot.checkpoint.verification = verification;
        self.save(snapshot).await?;

        match self.planner.reflect(&ctx).await {
            Ok(Some(lesson)) => {
                self.remember(snapshot, &lesson, &[tags::SELF_IMPROVEMENT], 0.6)
                    .await
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(run_id = %snapshot.run.id, "Reflection unavailable: {}", e),
        }

        let achieved = exit == RunnerExit::Completed;
        let plan = &snapshot.checkpoint.plan;
        let completed: Vec<&str> = plan
            .steps()
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .map(|step| step.title.as_str())
            .collect();
        let summary = format!(
            "Run for goal \"{}\" {} after {} of {} steps: {}",
            snapshot.run.goal,
            if achieved { "succeeded" } else { "fell short" },
            completed.len(),
            plan.len(),
            completed.join("; ")
        );
        let importance = if achieved { 0.7 } else { 0.4 };
        self.remember(snapshot, &summary, &[tags::AGENT_RUN], importance)
            .await;

        Ok(exit)
    }

    /// Planner view of a run.
    pub(crate) async fn planner_context(
        &self,
        snapshot: &RunSnapshot,
        signals: Vec<String>,
    ) -> PlannerContext {
        let memory = match self.memory.session_summaries(&snapshot.run.id).await {
            Ok(memory) => memory,
            Err(e) => {
                tracing::warn!(run_id = %snapshot.run.id, "Session memory unavailable: {}", e);
                Vec::new()
            }
        };

        let checkpoint = &snapshot.checkpoint;
        let plan = &checkpoint.plan;
        let center = plan.active_index().unwrap_or(plan.len());
        let start = center.saturating_sub(PLAN_EXCERPT_BEFORE);
        let end = (center + PLAN_EXCERPT_AFTER).min(plan.len());

        PlannerContext {
            run_id: snapshot.run.id.clone(),
            goal: snapshot.run.goal.clone(),
            task_type: checkpoint.task_type,
            memory,
            plan: plan.steps()[start..end].iter().map(StepView::from).collect(),
            active_step: plan.active_step().map(StepView::from),
            last_error: checkpoint.last_error.clone(),
            current_location: last_known_location(snapshot),
            signals,
            completed_steps: plan.completed_count() as u32,
        }
    }

    /// Long-term memory write; a rejection or store failure never fails the
    /// run.
    pub(crate) async fn remember(
        &self,
        snapshot: &RunSnapshot,
        content: &str,
        tags: &[&str],
        importance: f32,
    ) {
        let key = memory_key(&snapshot.run.goal);
        match self
            .memory
            .add_validated_long_term(&key, content, tags, importance)
            .await
        {
            Ok(MemoryWriteOutcome::Accepted) => {
                tracing::debug!(run_id = %snapshot.run.id, ?tags, "Long-term memory stored")
            }
            Ok(MemoryWriteOutcome::Skipped { reason }) => {
                tracing::info!(run_id = %snapshot.run.id, "Long-term memory skipped: {}", reason);
                self.events.emit(EngineEvent::MemoryRejected {
                    run_id: snapshot.run.id.clone(),
                    reason,
                });
            }
            Err(e) => {
                tracing::warn!(run_id = %snapshot.run.id, "Long-term memory write failed: {}", e)
            }
        }
    }
}

/// Goal-derived key shared by runs with the same goal.
fn memory_key(goal: &str) -> String {
    normalize_title(goal)
        .split(' ')
        .take(MEMORY_KEY_WORDS)
        .collect::<Vec<_>>()
        .join("-")
}
