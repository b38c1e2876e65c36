//! Planner client interface.
//!
//! The planner is an external service the engine consults for plans and
//! reviews. Every call is a plain request/response: the engine builds a
//! [`PlannerContext`], the planner answers, and the engine decides what to do
//! with the answer. `Ok(None)` or an empty list always means "no change".

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::plan::{PlanStep, StepStatus, ToolSelector};
use crate::agent::run::{CheckpointBrief, TaskType, Verification};
use crate::model::ModelError;

pub use http::HttpPlanner;

/// Planner errors.
#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("Model request failed: {0}")]
    Model(#[from] ModelError),
    #[error("Planner unavailable: {0}")]
    Unavailable(String),
}

/// Why a fresh plan (or plan tail) is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanReason {
    /// First plan for a new run.
    Initial,
    /// The active step ran out of attempts.
    StepFailure,
    /// Consecutive failures suggest the current approach cannot work.
    DeadEnd,
    /// The page changed under an observe-only step.
    ContextShift,
    /// Several successes without leaving the same location.
    Stagnation,
    /// Several successes without any location at all.
    NoContext,
    /// Extraction task with nothing extracted yet.
    MissingExtraction,
}

impl ReplanReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::StepFailure => "step_failure",
            Self::DeadEnd => "dead_end",
            Self::ContextShift => "context_shift",
            Self::Stagnation => "stagnation",
            Self::NoContext => "no_context",
            Self::MissingExtraction => "missing_extraction",
        }
    }
}

/// Compact view of a plan step handed to the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepView {
    pub id: String,
    pub title: String,
    pub tool: ToolSelector,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl From<&PlanStep> for StepView {
    fn from(step: &PlanStep) -> Self {
        Self {
            id: step.id.clone(),
            title: step.title.clone(),
            tool: step.tool,
            status: step.status,
            attempts: step.attempts,
            last_error: step.last_error.clone(),
            location: step.last_snapshot.clone(),
        }
    }
}

/// Everything a planner call gets to see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannerContext {
    pub run_id: String,
    pub goal: String,
    pub task_type: TaskType,
    /// Rolling session summaries, oldest first.
    #[serde(default)]
    pub memory: Vec<String>,
    /// Plan excerpt around the active step.
    #[serde(default)]
    pub plan: Vec<StepView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_step: Option<StepView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    /// Free-form observations from the runner, e.g. "loop detected".
    #[serde(default)]
    pub signals: Vec<String>,
    pub completed_steps: u32,
}

/// A step proposed by the planner, not yet part of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDraft {
    pub title: String,
    #[serde(default)]
    pub tool: ToolSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
}

impl StepDraft {
    pub fn new(title: impl Into<String>, tool: ToolSelector) -> Self {
        Self {
            title: title.into(),
            tool,
            phase: None,
            priority: None,
            expected_observation: None,
            success_criteria: None,
        }
    }

    /// Turn the draft into a pending step with a fresh id.
    pub fn into_step(self, max_attempts: u32) -> PlanStep {
        let mut step = PlanStep::new(self.title, self.tool, max_attempts);
        step.phase = self.phase;
        step.priority = self.priority;
        step.expected_observation = self.expected_observation;
        step.success_criteria = self.success_criteria;
        step
    }
}

/// Answer to a scheduled adaptive review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveReview {
    #[serde(default)]
    pub should_replan: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub steps: Vec<StepDraft>,
}

/// Answer to a loop-guard review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum LoopGuardDecision {
    Continue,
    /// Replace everything after the current step.
    Replan {
        #[serde(default)]
        reason: String,
        #[serde(default)]
        steps: Vec<StepDraft>,
    },
    EscalateHuman {
        #[serde(default)]
        reason: String,
    },
}

/// Answer to a self-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SelfCheckVerdict {
    OnTrack,
    Replan {
        #[serde(default)]
        reason: String,
        #[serde(default)]
        steps: Vec<StepDraft>,
    },
    Escalate {
        #[serde(default)]
        reason: String,
    },
}

/// Risk attached to an approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub requires_approval: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub risk: RiskLevel,
}

/// External planning and review service.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Build a plan. For anything but [`ReplanReason::Initial`] the result
    /// replaces the not-yet-executed part of the current plan.
    async fn build_plan(
        &self,
        ctx: &PlannerContext,
        reason: ReplanReason,
    ) -> Result<Vec<StepDraft>, PlannerError>;

    /// Alternative steps to try instead of the failed active step.
    async fn branch(&self, ctx: &PlannerContext) -> Result<Vec<StepDraft>, PlannerError>;

    async fn adaptive_review(
        &self,
        ctx: &PlannerContext,
    ) -> Result<Option<AdaptiveReview>, PlannerError>;

    async fn loop_guard_review(
        &self,
        ctx: &PlannerContext,
    ) -> Result<Option<LoopGuardDecision>, PlannerError>;

    async fn self_check(&self, ctx: &PlannerContext)
        -> Result<Option<SelfCheckVerdict>, PlannerError>;

    async fn approval_gate(
        &self,
        ctx: &PlannerContext,
    ) -> Result<Option<ApprovalDecision>, PlannerError>;

    /// Condense recent progress into one session-memory line.
    async fn summarize(&self, ctx: &PlannerContext) -> Result<Option<String>, PlannerError>;

    async fn brief(&self, ctx: &PlannerContext) -> Result<Option<CheckpointBrief>, PlannerError>;

    /// Decide whether the goal was actually achieved.
    async fn verify(&self, ctx: &PlannerContext) -> Result<Option<Verification>, PlannerError>;

    /// A lesson worth keeping for future runs.
    async fn reflect(&self, ctx: &PlannerContext) -> Result<Option<String>, PlannerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_into_step() {
        let mut draft = StepDraft::new("Open the cart", ToolSelector::Browser);
        draft.phase = Some("checkout".into());
        draft.success_criteria = Some("cart page visible".into());

        let step = draft.into_step(3);
        assert_eq!(step.title, "Open the cart");
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.max_attempts, 3);
        assert_eq!(step.phase.as_deref(), Some("checkout"));
        assert!(step.id.starts_with("step_"));
    }

    #[test]
    fn test_decision_wire_format() {
        let decision: LoopGuardDecision =
            serde_json::from_str(r#"{"decision": "escalate_human", "reason": "captcha wall"}"#)
                .unwrap();
        assert_eq!(
            decision,
            LoopGuardDecision::EscalateHuman {
                reason: "captcha wall".into()
            }
        );

        let verdict: SelfCheckVerdict = serde_json::from_str(
            r#"{"verdict": "replan", "steps": [{"title": "Search again", "tool": "browser"}]}"#,
        )
        .unwrap();
        assert!(matches!(verdict, SelfCheckVerdict::Replan { ref steps, .. } if steps.len() == 1));
    }
}
