//! Plan and step model for the step runner.
//!
//! A plan is an ordered list of steps. Order is execution order. The active
//! step is always the first step that is neither completed nor skipped, and
//! every mutation that inserts or replaces steps is refused when it would
//! touch anything before that point.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step is waiting to run.
    #[default]
    Pending,
    /// Step is currently executing.
    Running,
    /// Step completed successfully.
    Completed,
    /// Last attempt failed; the step may still be retried.
    Failed,
    /// Step was superseded (branched away or skipped by an operator).
    Skipped,
}

impl StepStatus {
    /// Completed and skipped steps are history and never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse a status name as typed by an operator.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" | "done" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" | "skip" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Which tool a step needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolSelector {
    /// Bookkeeping step, completes without touching the browser.
    None,
    /// Full browser-automation run for this step.
    #[default]
    Browser,
    /// Lightweight look at the current page state.
    Observe,
}

/// A single unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable id, survives replans.
    pub id: String,
    pub title: String,
    pub tool: ToolSelector,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
    /// Location id reported by the last tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<String>,
    #[serde(default)]
    pub last_log_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PlanStep {
    /// Create a new pending step with a fresh id.
    pub fn new(title: impl Into<String>, tool: ToolSelector, max_attempts: u32) -> Self {
        Self {
            id: new_step_id(),
            title: title.into(),
            tool,
            status: StepStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            phase: None,
            priority: None,
            expected_observation: None,
            success_criteria: None,
            last_snapshot: None,
            last_log_count: 0,
            last_error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Mark the step running and count the attempt.
    pub fn begin_attempt(&mut self) {
        self.status = StepStatus::Running;
        self.attempts += 1;
    }

    pub fn complete(&mut self, snapshot: Option<String>, log_count: u32) {
        self.status = StepStatus::Completed;
        self.last_snapshot = snapshot;
        self.last_log_count = log_count;
        self.last_error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.last_error = Some(error.into());
    }

    pub fn skip(&mut self) {
        self.status = StepStatus::Skipped;
    }

    /// Put the step back in the queue with a fresh attempt budget.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Plan mutation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("step not found: {0}")]
    StepNotFound(String),
    #[error("refusing to rewrite history before index {active} (requested {requested})")]
    HistoryRewrite { active: usize, requested: usize },
}

/// Ordered plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PlanStep> {
        self.steps.get_mut(index)
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.id == step_id)
    }

    pub fn find(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// Index of the first step that is not history yet.
    pub fn active_index(&self) -> Option<usize> {
        self.steps.iter().position(|step| !step.status.is_terminal())
    }

    pub fn active_step(&self) -> Option<&PlanStep> {
        self.active_index().and_then(|index| self.steps.get(index))
    }

    pub fn completed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .count()
    }

    /// Steps that already ran (completed, failed or superseded) before `index`,
    /// most recent last, limited to `window` entries.
    pub fn recent_history(&self, index: usize, window: usize) -> Vec<&PlanStep> {
        let end = index.min(self.steps.len());
        let tried: Vec<&PlanStep> = self.steps[..end]
            .iter()
            .chain(self.steps.get(index).filter(|step| step.attempts > 0))
            .filter(|step| step.attempts > 0 || step.status == StepStatus::Completed)
            .collect();
        let skip = tried.len().saturating_sub(window);
        tried.into_iter().skip(skip).collect()
    }

    fn check_cut(&self, cut: usize) -> Result<(), PlanError> {
        let active = self.active_index().unwrap_or(self.steps.len());
        if cut < active {
            return Err(PlanError::HistoryRewrite {
                active,
                requested: cut,
            });
        }
        Ok(())
    }

    /// Insert steps right after `index`.
    pub fn insert_after(&mut self, index: usize, steps: Vec<PlanStep>) -> Result<(), PlanError> {
        let at = (index + 1).min(self.steps.len());
        self.check_cut(at)?;
        self.steps.splice(at..at, steps);
        Ok(())
    }

    /// Drop everything from `cut` onwards and append `steps`.
    pub fn replace_from(&mut self, cut: usize, steps: Vec<PlanStep>) -> Result<(), PlanError> {
        let cut = cut.min(self.steps.len());
        self.check_cut(cut)?;
        self.steps.truncate(cut);
        self.steps.extend(steps);
        Ok(())
    }

    /// Operator override of a step status. Only steps at or after the active
    /// index may be changed.
    pub fn override_status(&mut self, step_id: &str, status: StepStatus) -> Result<(), PlanError> {
        let index = self
            .position(step_id)
            .ok_or_else(|| PlanError::StepNotFound(step_id.to_string()))?;
        self.check_cut(index)?;
        let step = &mut self.steps[index];
        match status {
            StepStatus::Pending => step.reset(),
            other => step.status = other,
        }
        Ok(())
    }

    /// Reset a step so it gets retried with a fresh attempt budget.
    pub fn retry_step(&mut self, step_id: &str) -> Result<(), PlanError> {
        self.override_status(step_id, StepStatus::Pending)
    }

    /// Steps left behind in `running` by a crash are queued again.
    pub fn requeue_interrupted(&mut self) -> usize {
        let mut requeued = 0;
        for step in &mut self.steps {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
                requeued += 1;
            }
        }
        requeued
    }

    /// Get statistics.
    pub fn stats(&self) -> PlanStats {
        let mut stats = PlanStats::default();
        for step in &self.steps {
            stats.total += 1;
            match step.status {
                StepStatus::Pending => stats.pending += 1,
                StepStatus::Running => stats.running += 1,
                StepStatus::Completed => stats.completed += 1,
                StepStatus::Failed => stats.failed += 1,
                StepStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }
}

/// Plan statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PlanStats {
    /// Calculate completion percentage.
    pub fn completion_percentage(&self) -> f32 {
        if self.total == 0 {
            100.0
        } else {
            ((self.completed + self.skipped) as f32 / self.total as f32) * 100.0
        }
    }
}

/// Generate a short step id.
pub fn new_step_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("step_{}", &id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_of(titles: &[&str]) -> Plan {
        Plan::new(
            titles
                .iter()
                .map(|title| PlanStep::new(*title, ToolSelector::Browser, 3))
                .collect(),
        )
    }

    #[test]
    fn test_step_lifecycle() {
        let mut step = PlanStep::new("Open the site", ToolSelector::Browser, 2);
        assert_eq!(step.status, StepStatus::Pending);

        step.begin_attempt();
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.attempts, 1);

        step.fail("timeout");
        assert_eq!(step.last_error.as_deref(), Some("timeout"));
        assert!(!step.attempts_exhausted());

        step.begin_attempt();
        step.complete(Some("example.com/home".into()), 4);
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.last_error.is_none());
        assert!(step.attempts_exhausted());
    }

    #[test]
    fn test_active_index_skips_history() {
        let mut plan = plan_of(&["a", "b", "c"]);
        assert_eq!(plan.active_index(), Some(0));

        plan.get_mut(0).unwrap().complete(None, 0);
        plan.get_mut(1).unwrap().skip();
        assert_eq!(plan.active_index(), Some(2));

        plan.get_mut(2).unwrap().complete(None, 0);
        assert_eq!(plan.active_index(), None);
    }

    #[test]
    fn test_insert_after_keeps_order() {
        let mut plan = plan_of(&["a", "b"]);
        plan.insert_after(0, vec![PlanStep::new("a2", ToolSelector::Observe, 3)])
            .unwrap();
        let titles: Vec<_> = plan.steps().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "a2", "b"]);
    }

    #[test]
    fn test_history_is_never_rewritten() {
        let mut plan = plan_of(&["a", "b", "c"]);
        plan.get_mut(0).unwrap().complete(None, 0);
        plan.get_mut(1).unwrap().complete(None, 0);

        let err = plan.replace_from(1, Vec::new()).unwrap_err();
        assert_eq!(
            err,
            PlanError::HistoryRewrite {
                active: 2,
                requested: 1
            }
        );
        assert!(plan.insert_after(0, Vec::new()).is_err());

        plan.replace_from(2, vec![PlanStep::new("x", ToolSelector::None, 1)])
            .unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.get(2).unwrap().title, "x");
    }

    #[test]
    fn test_override_and_retry() {
        let mut plan = plan_of(&["a", "b"]);
        let first = plan.get(0).unwrap().id.clone();
        let second = plan.get(1).unwrap().id.clone();

        plan.get_mut(1).unwrap().begin_attempt();
        plan.get_mut(1).unwrap().fail("boom");
        plan.retry_step(&second).unwrap();
        assert_eq!(plan.find(&second).unwrap().attempts, 0);

        plan.override_status(&first, StepStatus::Skipped).unwrap();
        assert_eq!(plan.active_index(), Some(1));
        assert!(plan.override_status(&first, StepStatus::Pending).is_err());
        assert!(matches!(
            plan.override_status("missing", StepStatus::Completed),
            Err(PlanError::StepNotFound(_))
        ));
    }

    #[test]
    fn test_recent_history_window() {
        let mut plan = plan_of(&["a", "b", "c", "d"]);
        for index in 0..3 {
            let step = plan.get_mut(index).unwrap();
            step.begin_attempt();
            step.complete(None, 0);
        }
        let history = plan.recent_history(3, 2);
        let titles: Vec<_> = history.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "c"]);
    }

    #[test]
    fn test_status_parse_and_stats() {
        assert_eq!(StepStatus::parse("Done"), Some(StepStatus::Completed));
        assert_eq!(StepStatus::parse("nope"), None);

        let mut plan = plan_of(&["a", "b"]);
        plan.get_mut(0).unwrap().complete(None, 0);
        let stats = plan.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completion_percentage(), 50.0);
    }
}
