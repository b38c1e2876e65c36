//! Run record and checkpoint document.
//!
//! A [`RunSnapshot`] is what the checkpoint store persists: the run record
//! plus everything the step runner needs to pick the run up again without
//! replaying completed steps.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::Plan;

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    WaitingApproval,
    WaitingHuman,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn is_paused(self) -> bool {
        matches!(self, Self::WaitingApproval | Self::WaitingHuman)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::WaitingHuman => "waiting_human",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Coarse classification of the goal, drives extraction checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Navigation,
    Extraction,
    Transaction,
    #[default]
    General,
}

/// Engine tuning, fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Hard cap on step executions (including retries) per run.
    pub max_steps: u32,
    pub max_step_attempts: u32,
    /// Global quota shared by every replan trigger.
    pub max_replans: u32,
    pub max_self_checks: u32,
    pub loop_guard_threshold: u32,
    pub loop_guard_window: usize,
    /// Recorded outcomes to ignore after a loop-guard decision.
    pub loop_guard_cooldown_steps: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Adaptive review every N completed steps.
    pub scheduled_replan_interval: u32,
    pub memory_summary_interval: u32,
    pub self_check_interval: u32,
    pub stagnation_threshold: u32,
    pub no_context_threshold: u32,
    pub extraction_min_completed: u32,
    /// Consecutive failures that count as a dead end.
    pub dead_end_failures: u32,
    pub slow_tool_warning_ms: u64,
    pub session_memory_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_steps: 40,
            max_step_attempts: 3,
            max_replans: 3,
            max_self_checks: 2,
            loop_guard_threshold: 3,
            loop_guard_window: 12,
            loop_guard_cooldown_steps: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            scheduled_replan_interval: 3,
            memory_summary_interval: 5,
            self_check_interval: 6,
            stagnation_threshold: 3,
            no_context_threshold: 2,
            extraction_min_completed: 4,
            dead_end_failures: 2,
            slow_tool_warning_ms: 45_000,
            session_memory_limit: 6,
        }
    }
}

/// Operator preferences, fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub require_human_approval: bool,
    pub headless: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            require_human_approval: false,
            headless: true,
        }
    }
}

/// Free-text orientation for whoever looks at a paused run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBrief {
    pub summary: String,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

/// Remediation budgets consumed so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCounters {
    pub steps_executed: u32,
    pub replans_used: u32,
    pub self_checks_used: u32,
    pub loop_reviews: u32,
    /// Extraction steps that produced output.
    pub evidence_count: u32,
    pub extraction_replan_done: bool,
}

/// Who asked for a human and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationSource {
    LoopGuard,
    SelfCheck,
    ErrorClassifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub source: EscalationSource,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub raised_at: DateTime<Utc>,
}

/// Final verdict recorded at finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub achieved: bool,
    pub summary: String,
}

/// Everything the step runner needs to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub plan: Plan,
    #[serde(default)]
    pub active_step_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub approval_request_step_id: Option<String>,
    #[serde(default)]
    pub approval_granted_step_ids: BTreeSet<String>,
    /// Completed-step count at the last memory summary.
    #[serde(default)]
    pub memory_summary_watermark: u32,
    pub settings: Settings,
    pub preferences: Preferences,
    #[serde(default)]
    pub brief: Option<CheckpointBrief>,
    /// (active step, last error) pair the brief was generated for.
    #[serde(default)]
    pub brief_key: Option<String>,
    #[serde(default)]
    pub branched_step_ids: BTreeSet<String>,
    #[serde(default)]
    pub counters: RunCounters,
    #[serde(default)]
    pub escalation: Option<Escalation>,
    #[serde(default)]
    pub verification: Option<Verification>,
}

impl Checkpoint {
    pub fn new(settings: Settings, preferences: Preferences) -> Self {
        Self {
            plan: Plan::default(),
            active_step_id: None,
            last_error: None,
            task_type: TaskType::General,
            approval_request_step_id: None,
            approval_granted_step_ids: BTreeSet::new(),
            memory_summary_watermark: 0,
            settings,
            preferences,
            brief: None,
            brief_key: None,
            branched_step_ids: BTreeSet::new(),
            counters: RunCounters::default(),
            escalation: None,
            verification: None,
        }
    }

    /// Recompute the active step reference from the plan.
    pub fn sync_active_step(&mut self) {
        self.active_step_id = self.plan.active_step().map(|step| step.id.clone());
    }

    pub fn replans_remaining(&self) -> bool {
        self.counters.replans_used < self.settings.max_replans
    }

    pub fn is_granted(&self, step_id: &str) -> bool {
        self.approval_granted_step_ids.contains(step_id)
    }
}

/// Options supplied when a run is created.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub planner_model: String,
    pub tool_model: String,
    pub settings: Settings,
    pub preferences: Preferences,
}

/// One execution instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub goal: String,
    pub planner_model: String,
    pub tool_model: String,
    pub headless: bool,
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub active_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checkpointed_at: Option<DateTime<Utc>>,
}

/// Run record plus checkpoint, the unit the checkpoint store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub checkpoint: Checkpoint,
}

impl RunSnapshot {
    /// Create a pending run.
    pub fn new(goal: impl Into<String>, options: RunOptions) -> Self {
        let run = Run {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            planner_model: options.planner_model,
            tool_model: options.tool_model,
            headless: options.preferences.headless,
            status: RunStatus::Pending,
            error: None,
            active_step_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            checkpointed_at: None,
        };
        Self {
            run,
            checkpoint: Checkpoint::new(options.settings, options.preferences),
        }
    }

    pub fn id(&self) -> &str {
        &self.run.id
    }

    /// Stamp the snapshot right before it is written.
    pub fn touch(&mut self) {
        self.checkpoint.sync_active_step();
        self.run.active_step_id = self.checkpoint.active_step_id.clone();
        self.run.checkpointed_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.run.status = status;
        self.run.error = error;
        if status.is_terminal() {
            self.run.finished_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::plan::{PlanStep, ToolSelector};

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert_eq!(settings.max_step_attempts, 3);
        assert_eq!(settings.loop_guard_threshold, 3);
        assert!(settings.scheduled_replan_interval < settings.memory_summary_interval);
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let mut snapshot = RunSnapshot::new("find the cheapest flight", RunOptions::default());
        snapshot.checkpoint.plan = Plan::new(vec![
            PlanStep::new("Open search", ToolSelector::Browser, 3).with_id("s1"),
            PlanStep::new("Read prices", ToolSelector::Observe, 3).with_id("s2"),
        ]);
        snapshot.checkpoint.approval_granted_step_ids.insert("s2".into());
        snapshot.checkpoint.branched_step_ids.insert("s1".into());
        snapshot.touch();

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: RunSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);
        assert_eq!(restored.run.active_step_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_settings_backfill_missing_fields() {
        let settings: Settings = serde_json::from_str(r#"{"max_steps": 7}"#).unwrap();
        assert_eq!(settings.max_steps, 7);
        assert_eq!(settings.max_replans, Settings::default().max_replans);
    }

    #[test]
    fn test_finish_sets_timestamp_only_when_terminal() {
        let mut snapshot = RunSnapshot::new("goal", RunOptions::default());
        snapshot.finish(RunStatus::WaitingHuman, None);
        assert!(snapshot.run.finished_at.is_none());
        snapshot.finish(RunStatus::Stopped, None);
        assert!(snapshot.run.finished_at.is_some());
    }
}
