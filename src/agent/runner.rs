//! Step runner: drives the plan one step at a time.
//!
//! Every iteration starts at a loop boundary (controls, step budget, brief),
//! then gates, executes and applies one attempt of the active step. Loop
//! detection, failure remediation and periodic maintenance follow, with at
//! most one [`PlanChange`] applied per iteration. The runner returns when the
//! run has to pause or the plan is exhausted; the engine decides what that
//! means for the run record.

use chrono::Utc;

use super::control;
use super::engine::{Engine, EngineError};
use super::events::EngineEvent;
use super::loop_guard::{LoopCheck, LoopGuard};
use super::plan::{PlanError, PlanStep, ToolSelector};
use super::policy::{self, ApprovalHint};
use super::run::{Checkpoint, Escalation, EscalationSource, RunSnapshot, Settings, TaskType};
use crate::browser::{InvokeKind, ToolExecutor, ToolRequest};
use crate::planner::{
    LoopGuardDecision, PlannerContext, PlannerError, ReplanReason, RiskLevel, SelfCheckVerdict,
    StepDraft,
};
use crate::store::tags;

/// Why the runner handed control back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerExit {
    /// No active step left.
    Completed,
    WaitingApproval {
        step_id: String,
        reason: String,
        risk: RiskLevel,
    },
    WaitingHuman {
        reason: String,
    },
    Stopped,
    Failed {
        error: String,
    },
}

/// Result of one attempt of the active step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTransition {
    Completed {
        location: Option<String>,
        log_count: u32,
        /// `None` for steps that need no tool.
        dispatched: Option<InvokeKind>,
    },
    Failed {
        error: String,
    },
}

/// What caused a plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTrigger {
    Branch,
    AdaptiveReview,
    Replan(ReplanReason),
    LoopGuard,
    SelfCheck,
}

impl ChangeTrigger {
    pub fn label(self) -> &'static str {
        match self {
            Self::Branch => "branch",
            Self::AdaptiveReview => "adaptive_review",
            Self::Replan(reason) => reason.as_str(),
            Self::LoopGuard => "loop_guard",
            Self::SelfCheck => "self_check",
        }
    }

    fn memory_tag(self) -> &'static str {
        match self {
            Self::Branch => tags::BRANCH,
            Self::AdaptiveReview => tags::REPLAN,
            Self::Replan(ReplanReason::DeadEnd) => tags::DEAD_END,
            Self::Replan(ReplanReason::ContextShift) => tags::CONTEXT_SHIFT,
            Self::Replan(ReplanReason::Stagnation) => tags::STAGNATION,
            Self::Replan(ReplanReason::NoContext) => tags::NO_CONTEXT,
            Self::Replan(ReplanReason::MissingExtraction) => tags::MISSING_EXTRACTION,
            Self::Replan(_) => tags::REPLAN,
            Self::LoopGuard => tags::LOOP_GUARD,
            Self::SelfCheck => tags::SELF_CHECK,
        }
    }

    /// Branches, loop-guard and self-check changes have budgets of their own.
    fn counts_against_quota(self) -> bool {
        matches!(self, Self::AdaptiveReview | Self::Replan(_))
    }
}

/// A single mutation of the plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanChange {
    /// Insert steps right after `after`. For a branch the step at `after`
    /// is the failed one and gets skipped.
    Insert {
        after: usize,
        steps: Vec<PlanStep>,
        trigger: ChangeTrigger,
    },
    /// Replace everything from `cut` onwards.
    Replace {
        cut: usize,
        steps: Vec<PlanStep>,
        trigger: ChangeTrigger,
    },
}

impl PlanChange {
    pub fn trigger(&self) -> ChangeTrigger {
        match self {
            Self::Insert { trigger, .. } | Self::Replace { trigger, .. } => *trigger,
        }
    }

    pub fn steps(&self) -> &[PlanStep] {
        match self {
            Self::Insert { steps, .. } | Self::Replace { steps, .. } => steps,
        }
    }

    /// Apply the change to a checkpoint. Returns the number of new steps.
    pub fn apply(self, checkpoint: &mut Checkpoint) -> Result<usize, PlanError> {
        let trigger = self.trigger();
        // The last error belongs to the active step; it only goes away with it.
        let active = checkpoint.plan.active_index();
        let clears_error = match &self {
            Self::Insert { .. } => trigger == ChangeTrigger::Branch,
            Self::Replace { cut, .. } => active.map_or(true, |active| *cut <= active),
        };
        let added = match self {
            Self::Insert { after, steps, .. } => {
                let added = steps.len();
                if trigger == ChangeTrigger::Branch {
                    let failed_id = checkpoint
                        .plan
                        .get(after)
                        .map(|step| step.id.clone())
                        .ok_or_else(|| PlanError::StepNotFound(format!("#{}", after)))?;
                    checkpoint.plan.insert_after(after, steps)?;
                    if let Some(failed) = checkpoint.plan.get_mut(after) {
                        failed.skip();
                    }
                    checkpoint.branched_step_ids.insert(failed_id);
                } else {
                    checkpoint.plan.insert_after(after, steps)?;
                }
                added
            }
            Self::Replace { cut, steps, .. } => {
                let added = steps.len();
                checkpoint.plan.replace_from(cut, steps)?;
                added
            }
        };
        if trigger.counts_against_quota() {
            checkpoint.counters.replans_used += 1;
        }
        if clears_error {
            checkpoint.last_error = None;
        }
        checkpoint.sync_active_step();
        Ok(added)
    }
}

enum Flow {
    Proceed,
    Changed,
    Exit(RunnerExit),
}

/// Counters that only make sense for the current browser session.
#[derive(Debug, Default)]
struct SessionState {
    consecutive_failures: u32,
    stagnation: u32,
    no_context: u32,
    last_location: Option<String>,
    tool_calls: u32,
    context_shift: bool,
}

fn settle<T>(result: Result<T, PlannerError>, call: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(call, "Planner call failed, treating as no change: {}", e);
            None
        }
    }
}

/// Executes a run's plan against one browser session.
pub struct StepRunner<'a> {
    engine: &'a Engine,
    snapshot: &'a mut RunSnapshot,
    executor: &'a mut ToolExecutor,
    guard: LoopGuard,
    state: SessionState,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        engine: &'a Engine,
        snapshot: &'a mut RunSnapshot,
        executor: &'a mut ToolExecutor,
    ) -> Self {
        let guard = LoopGuard::new(&snapshot.checkpoint.settings);
        let state = SessionState {
            last_location: last_known_location(snapshot),
            ..SessionState::default()
        };
        Self {
            engine,
            snapshot,
            executor,
            guard,
            state,
        }
    }

    pub async fn run(&mut self) -> Result<RunnerExit, EngineError> {
        loop {
            if let Some(exit) = self.apply_controls().await? {
                return Ok(exit);
            }

            let Some(index) = self.snapshot.checkpoint.plan.active_index() else {
                return Ok(RunnerExit::Completed);
            };

            let max_steps = self.settings().max_steps;
            if self.snapshot.checkpoint.counters.steps_executed >= max_steps {
                return Ok(RunnerExit::Failed {
                    error: format!("Step budget exhausted after {} executions", max_steps),
                });
            }

            self.refresh_brief().await?;

            // Covers resumed runs whose step already used every attempt.
            if self.step(index)?.attempts_exhausted() {
                if let Flow::Exit(exit) = self.remediate_exhausted(index).await? {
                    return Ok(exit);
                }
                continue;
            }

            if let Some(exit) = self.approval_gate(index).await? {
                return Ok(exit);
            }

            if let Flow::Exit(exit) = self.execute_step(index).await? {
                return Ok(exit);
            }
        }
    }

    fn settings(&self) -> &Settings {
        &self.snapshot.checkpoint.settings
    }

    fn run_id(&self) -> String {
        self.snapshot.run.id.clone()
    }

    fn step(&self, index: usize) -> Result<PlanStep, EngineError> {
        self.snapshot
            .checkpoint
            .plan
            .get(index)
            .cloned()
            .ok_or_else(|| EngineError::Plan(PlanError::StepNotFound(format!("#{}", index))))
    }

    fn step_mut(&mut self, index: usize) -> Result<&mut PlanStep, EngineError> {
        self.snapshot
            .checkpoint
            .plan
            .get_mut(index)
            .ok_or_else(|| EngineError::Plan(PlanError::StepNotFound(format!("#{}", index))))
    }

    async fn persist(&mut self) -> Result<(), EngineError> {
        self.snapshot.touch();
        self.engine
            .checkpoints
            .save(&self.snapshot.run.id, &*self.snapshot)
            .await?;
        Ok(())
    }

    async fn context(&self, signals: Vec<String>) -> PlannerContext {
        self.engine.planner_context(&*self.snapshot, signals).await
    }

    async fn apply_controls(&mut self) -> Result<Option<RunnerExit>, EngineError> {
        let requests = self.engine.checkpoints.drain_controls(&self.snapshot.run.id).await?;
        if requests.is_empty() {
            return Ok(None);
        }
        let stopped = control::apply_queued(&mut *self.snapshot, requests, &self.engine.events);
        self.persist().await?;
        Ok(stopped.then_some(RunnerExit::Stopped))
    }

    /// Regenerate the brief when the (active step, last error) pair moved.
    async fn refresh_brief(&mut self) -> Result<(), EngineError> {
        let checkpoint = &self.snapshot.checkpoint;
        let key = format!(
            "{}|{}",
            checkpoint
                .plan
                .active_step()
                .map(|step| step.id.as_str())
                .unwrap_or_default(),
            checkpoint.last_error.as_deref().unwrap_or_default()
        );
        if checkpoint.brief_key.as_deref() == Some(key.as_str()) {
            return Ok(());
        }

        let ctx = self.context(Vec::new()).await;
        if let Some(brief) = settle(self.engine.planner.brief(&ctx).await, "brief").flatten() {
            self.snapshot.checkpoint.brief = Some(brief);
        }
        self.snapshot.checkpoint.brief_key = Some(key);
        self.persist().await
    }

    async fn approval_gate(&mut self, index: usize) -> Result<Option<RunnerExit>, EngineError> {
        if !self.snapshot.checkpoint.preferences.require_human_approval {
            return Ok(None);
        }
        let step = self.step(index)?;
        if self.snapshot.checkpoint.is_granted(&step.id) {
            return Ok(None);
        }

        let verdict = match policy::approval_hint(&step) {
            ApprovalHint::Required { reason } => Some((reason, RiskLevel::High)),
            ApprovalHint::NotRequired => None,
            ApprovalHint::Inconclusive => {
                let ctx = self
                    .context(vec!["approval check before execution".to_string()])
                    .await;
                match self.engine.planner.approval_gate(&ctx).await {
                    Ok(Some(decision)) if decision.requires_approval => {
                        Some((decision.reason, decision.risk))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(step_id = %step.id, "Approval gate unavailable, proceeding: {}", e);
                        None
                    }
                }
            }
        };

        let Some((reason, risk)) = verdict else {
            return Ok(None);
        };

        self.snapshot.checkpoint.approval_request_step_id = Some(step.id.clone());
        self.engine.events.emit(EngineEvent::ApprovalRequested {
            run_id: self.run_id(),
            step_id: step.id.clone(),
            reason: reason.clone(),
            risk: risk.as_str().to_string(),
        });
        self.persist().await?;
        Ok(Some(RunnerExit::WaitingApproval {
            step_id: step.id,
            reason,
            risk,
        }))
    }

    async fn execute_step(&mut self, index: usize) -> Result<Flow, EngineError> {
        let run_id = self.run_id();
        let (step_id, title, attempt) = {
            let step = self.step_mut(index)?;
            step.begin_attempt();
            (step.id.clone(), step.title.clone(), step.attempts)
        };
        self.snapshot.checkpoint.counters.steps_executed += 1;
        self.engine.events.emit(EngineEvent::StepStarted {
            run_id,
            step_id,
            title,
            attempt,
        });
        self.persist().await?;

        let transition = self.dispatch(index).await?;
        let (succeeded, location) = match &transition {
            StepTransition::Completed { location, .. } => (true, location.clone()),
            StepTransition::Failed { .. } => (false, None),
        };

        if let Flow::Exit(exit) = self.apply_transition(index, transition).await? {
            return Ok(Flow::Exit(exit));
        }

        let flow = match self.check_loop(index, location.as_deref()).await? {
            Flow::Proceed if succeeded => self.maintain(index).await?,
            Flow::Proceed => self.remediate_failure(index).await?,
            other => other,
        };

        if succeeded && !matches!(flow, Flow::Exit(_)) {
            self.summarize_memory().await?;
        }
        Ok(flow)
    }

    /// `browser` always runs in full; `observe` only looks when there is a
    /// page to look at.
    fn dispatch_kind(&self, step: &PlanStep) -> Option<InvokeKind> {
        match step.tool {
            ToolSelector::None => None,
            ToolSelector::Browser => Some(InvokeKind::Full),
            ToolSelector::Observe => {
                let needs_full = self.state.tool_calls == 0
                    || self.state.last_location.is_none()
                    || policy::is_extraction_step(step);
                Some(if needs_full {
                    InvokeKind::Full
                } else {
                    InvokeKind::Observe
                })
            }
        }
    }

    async fn dispatch(&mut self, index: usize) -> Result<StepTransition, EngineError> {
        let step = self.step(index)?;
        let Some(kind) = self.dispatch_kind(&step) else {
            return Ok(StepTransition::Completed {
                location: None,
                log_count: 0,
                dispatched: None,
            });
        };

        let request = ToolRequest {
            run_id: self.run_id(),
            step_id: step.id.clone(),
            goal: self.snapshot.run.goal.clone(),
            instruction: step.title.clone(),
            expected_observation: step.expected_observation.clone(),
            success_criteria: step.success_criteria.clone(),
            current_location: self.state.last_location.clone(),
        };
        self.state.tool_calls += 1;
        let outcome = self.executor.invoke(kind, &request).await;

        Ok(if outcome.ok {
            StepTransition::Completed {
                location: outcome.location_id().map(str::to_string),
                log_count: outcome.log_count(),
                dispatched: Some(kind),
            }
        } else {
            StepTransition::Failed {
                error: outcome
                    .error
                    .unwrap_or_else(|| "tool call failed without an error message".to_string()),
            }
        })
    }

    async fn apply_transition(
        &mut self,
        index: usize,
        transition: StepTransition,
    ) -> Result<Flow, EngineError> {
        let run_id = self.run_id();
        let task_type = self.snapshot.checkpoint.task_type;

        match transition {
            StepTransition::Completed {
                location,
                log_count,
                dispatched,
            } => {
                let step = self.step_mut(index)?;
                step.complete(location.clone(), log_count);
                let extraction = task_type == TaskType::Extraction && policy::is_extraction_step(step);
                let step_id = step.id.clone();

                self.snapshot.checkpoint.last_error = None;
                if extraction {
                    self.snapshot.checkpoint.counters.evidence_count += 1;
                }

                let state = &mut self.state;
                state.consecutive_failures = 0;
                state.context_shift = false;
                if let Some(kind) = dispatched {
                    match &location {
                        Some(now) => {
                            let same = state.last_location.as_deref() == Some(now.as_str());
                            state.context_shift = kind == InvokeKind::Observe
                                && state.last_location.is_some()
                                && !same;
                            state.stagnation = if same { state.stagnation + 1 } else { 1 };
                            state.no_context = 0;
                            state.last_location = Some(now.clone());
                        }
                        None => {
                            state.no_context += 1;
                            state.stagnation = 0;
                        }
                    }
                }

                self.engine.events.emit(EngineEvent::StepCompleted {
                    run_id,
                    step_id,
                    location,
                });
                self.persist().await?;
                Ok(Flow::Proceed)
            }
            StepTransition::Failed { error } => {
                let step = self.step_mut(index)?;
                step.fail(error.clone());
                let step_id = step.id.clone();
                let attempt = step.attempts;

                self.snapshot.checkpoint.last_error = Some(error.clone());
                self.state.consecutive_failures += 1;
                self.engine.events.emit(EngineEvent::StepFailed {
                    run_id,
                    step_id: step_id.clone(),
                    attempt,
                    error: error.clone(),
                });

                if policy::is_human_required(&error) {
                    return self
                        .escalate(EscalationSource::ErrorClassifier, error, Some(step_id))
                        .await;
                }
                self.persist().await?;
                Ok(Flow::Proceed)
            }
        }
    }

    async fn escalate(
        &mut self,
        source: EscalationSource,
        reason: String,
        step_id: Option<String>,
    ) -> Result<Flow, EngineError> {
        self.snapshot.checkpoint.escalation = Some(Escalation {
            source,
            reason: reason.clone(),
            step_id,
            raised_at: Utc::now(),
        });
        self.engine.events.emit(EngineEvent::HumanRequired {
            run_id: self.run_id(),
            reason: reason.clone(),
        });
        self.persist().await?;
        Ok(Flow::Exit(RunnerExit::WaitingHuman { reason }))
    }

    async fn check_loop(&mut self, index: usize, location: Option<&str>) -> Result<Flow, EngineError> {
        let step = self.step(index)?;
        let LoopCheck::Review { backoff, period } = self.guard.record(&step, location) else {
            return Ok(Flow::Proceed);
        };

        let run_id = self.run_id();
        self.engine.events.emit(EngineEvent::LoopGuardBackoff {
            run_id: run_id.clone(),
            delay_ms: backoff.as_millis() as u64,
        });
        tokio::time::sleep(backoff).await;

        self.snapshot.checkpoint.counters.loop_reviews += 1;
        let threshold = self.settings().loop_guard_threshold;
        let ctx = self
            .context(vec![format!(
                "loop detected: the same {} step outcome(s) repeated {} times",
                period, threshold
            )])
            .await;
        let decision = settle(
            self.engine.planner.loop_guard_review(&ctx).await,
            "loop_guard_review",
        )
        .flatten()
        .unwrap_or(LoopGuardDecision::Continue);

        let label = match &decision {
            LoopGuardDecision::Continue => "continue",
            LoopGuardDecision::Replan { .. } => "replan",
            LoopGuardDecision::EscalateHuman { .. } => "escalate_human",
        };
        self.engine.events.emit(EngineEvent::LoopGuardReviewed {
            run_id,
            decision: label.to_string(),
        });

        match decision {
            LoopGuardDecision::Continue => {
                self.persist().await?;
                Ok(Flow::Proceed)
            }
            LoopGuardDecision::Replan { reason, steps } => {
                let steps = self.screen(index, steps);
                if steps.is_empty() {
                    self.persist().await?;
                    return Ok(Flow::Proceed);
                }
                self.apply_change(
                    PlanChange::Replace {
                        cut: index + 1,
                        steps,
                        trigger: ChangeTrigger::LoopGuard,
                    },
                    &reason,
                )
                .await
            }
            LoopGuardDecision::EscalateHuman { reason } => {
                self.escalate(EscalationSource::LoopGuard, reason, Some(step.id))
                    .await
            }
        }
    }

    /// Turn planner drafts into steps, minus anything tried recently.
    fn screen(&self, index: usize, drafts: Vec<StepDraft>) -> Vec<PlanStep> {
        let settings = self.settings();
        let offered = drafts.len();
        let recent = self
            .snapshot
            .checkpoint
            .plan
            .recent_history(index, settings.loop_guard_window);
        let steps: Vec<PlanStep> = LoopGuard::screen_candidates(drafts, &recent)
            .into_iter()
            .map(|draft| draft.into_step(settings.max_step_attempts))
            .collect();
        if steps.len() < offered {
            tracing::debug!(
                dropped = offered - steps.len(),
                "Dropped candidate steps that repeat recent history"
            );
        }
        steps
    }

    async fn apply_change(&mut self, change: PlanChange, reason: &str) -> Result<Flow, EngineError> {
        let trigger = change.trigger();
        let titles: Vec<String> = change.steps().iter().map(|s| s.title.clone()).collect();
        let added = change.apply(&mut self.snapshot.checkpoint)?;
        self.state.consecutive_failures = 0;

        self.engine.events.emit(EngineEvent::PlanChanged {
            run_id: self.run_id(),
            reason: trigger.label().to_string(),
            steps: added,
        });
        self.persist().await?;

        let reason = if reason.trim().is_empty() {
            trigger.label()
        } else {
            reason.trim()
        };
        let content = format!(
            "{} for goal \"{}\": {}. New steps: {}",
            trigger.label(),
            self.snapshot.run.goal,
            reason,
            titles.join("; ")
        );
        self.engine
            .remember(&*self.snapshot, &content, &[trigger.memory_tag()], 0.3)
            .await;
        Ok(Flow::Changed)
    }

    async fn try_replan(
        &mut self,
        index: usize,
        cut: usize,
        reason: ReplanReason,
        signal: String,
    ) -> Result<Flow, EngineError> {
        let ctx = self.context(vec![signal.clone()]).await;
        let drafts = settle(
            self.engine.planner.build_plan(&ctx, reason).await,
            reason.as_str(),
        )
        .unwrap_or_default();
        let steps = self.screen(index, drafts);
        if steps.is_empty() {
            tracing::debug!(reason = reason.as_str(), "Replan produced no usable steps");
            return Ok(Flow::Proceed);
        }
        self.apply_change(
            PlanChange::Replace {
                cut,
                steps,
                trigger: ChangeTrigger::Replan(reason),
            },
            &signal,
        )
        .await
    }

    /// After a failure with attempts left: retry, unless the failures have
    /// piled up into a dead end.
    async fn remediate_failure(&mut self, index: usize) -> Result<Flow, EngineError> {
        let step = self.step(index)?;
        if step.attempts_exhausted() {
            // Handled at the next boundary.
            return Ok(Flow::Proceed);
        }

        let dead_end = self.settings().dead_end_failures;
        if dead_end == 0
            || self.state.consecutive_failures < dead_end
            || !self.snapshot.checkpoint.replans_remaining()
        {
            return Ok(Flow::Proceed);
        }

        let failures = std::mem::take(&mut self.state.consecutive_failures);
        let signal = format!(
            "dead end: {} consecutive failures, last: {}",
            failures,
            step.last_error.as_deref().unwrap_or("unknown error")
        );
        self.try_replan(index, index, ReplanReason::DeadEnd, signal)
            .await
    }

    /// Branch, then replan, then dead-end replan, then give up.
    async fn remediate_exhausted(&mut self, index: usize) -> Result<Flow, EngineError> {
        let step = self.step(index)?;
        let signal = format!(
            "step \"{}\" failed {} of {} attempts: {}",
            step.title,
            step.attempts,
            step.max_attempts,
            step.last_error.as_deref().unwrap_or("unknown error")
        );

        if !self.snapshot.checkpoint.branched_step_ids.contains(&step.id) {
            self.snapshot
                .checkpoint
                .branched_step_ids
                .insert(step.id.clone());
            let ctx = self.context(vec![signal.clone()]).await;
            let drafts = settle(self.engine.planner.branch(&ctx).await, "branch").unwrap_or_default();
            let steps = self.screen(index, drafts);
            if !steps.is_empty() {
                return self
                    .apply_change(
                        PlanChange::Insert {
                            after: index,
                            steps,
                            trigger: ChangeTrigger::Branch,
                        },
                        &signal,
                    )
                    .await;
            }
            self.persist().await?;
        }

        for reason in [ReplanReason::StepFailure, ReplanReason::DeadEnd] {
            if !self.snapshot.checkpoint.replans_remaining() {
                break;
            }
            if let Flow::Changed = self
                .try_replan(index, index, reason, signal.clone())
                .await?
            {
                return Ok(Flow::Changed);
            }
        }

        Ok(Flow::Exit(RunnerExit::Failed {
            error: format!(
                "Step \"{}\" failed after {} attempts: {}",
                step.title,
                step.attempts,
                step.last_error.as_deref().unwrap_or("unknown error")
            ),
        }))
    }

    /// Triggered replans and scheduled reviews after a success. The first
    /// one that changes the plan wins.
    async fn maintain(&mut self, index: usize) -> Result<Flow, EngineError> {
        let settings = self.settings().clone();
        let cut = index + 1;
        let completed = self.snapshot.checkpoint.plan.completed_count() as u32;

        if std::mem::take(&mut self.state.context_shift)
            && self.snapshot.checkpoint.replans_remaining()
        {
            let signal = format!(
                "page changed to {} during an observe step",
                self.state.last_location.as_deref().unwrap_or("unknown")
            );
            if let Flow::Changed = self
                .try_replan(index, cut, ReplanReason::ContextShift, signal)
                .await?
            {
                return Ok(Flow::Changed);
            }
        }

        if settings.stagnation_threshold > 0 && self.state.stagnation >= settings.stagnation_threshold
        {
            let repeats = std::mem::take(&mut self.state.stagnation);
            if self.snapshot.checkpoint.replans_remaining() {
                let signal = format!("{} successes without leaving the same page", repeats);
                if let Flow::Changed = self
                    .try_replan(index, cut, ReplanReason::Stagnation, signal)
                    .await?
                {
                    return Ok(Flow::Changed);
                }
            }
        }

        if settings.no_context_threshold > 0 && self.state.no_context >= settings.no_context_threshold
        {
            let repeats = std::mem::take(&mut self.state.no_context);
            if self.snapshot.checkpoint.replans_remaining() {
                let signal = format!("{} successes without any page context", repeats);
                if let Flow::Changed = self
                    .try_replan(index, cut, ReplanReason::NoContext, signal)
                    .await?
                {
                    return Ok(Flow::Changed);
                }
            }
        }

        let counters = &self.snapshot.checkpoint.counters;
        if self.snapshot.checkpoint.task_type == TaskType::Extraction
            && counters.evidence_count == 0
            && !counters.extraction_replan_done
            && completed >= settings.extraction_min_completed
        {
            self.snapshot.checkpoint.counters.extraction_replan_done = true;
            self.persist().await?;
            if self.snapshot.checkpoint.replans_remaining() {
                let signal = format!(
                    "extraction task with no extracted data after {} completed steps",
                    completed
                );
                if let Flow::Changed = self
                    .try_replan(index, cut, ReplanReason::MissingExtraction, signal)
                    .await?
                {
                    return Ok(Flow::Changed);
                }
            }
        }

        let due = |interval: u32| interval > 0 && completed > 0 && completed % interval == 0;

        if due(settings.scheduled_replan_interval) && self.snapshot.checkpoint.replans_remaining() {
            let ctx = self
                .context(vec![format!(
                    "scheduled review after {} completed steps",
                    completed
                )])
                .await;
            let review = settle(
                self.engine.planner.adaptive_review(&ctx).await,
                "adaptive_review",
            )
            .flatten();
            if let Some(review) = review.filter(|r| r.should_replan) {
                let steps = self.screen(index, review.steps);
                if !steps.is_empty() {
                    return self
                        .apply_change(
                            PlanChange::Insert {
                                after: index,
                                steps,
                                trigger: ChangeTrigger::AdaptiveReview,
                            },
                            &review.reason,
                        )
                        .await;
                }
            }
        }

        if due(settings.self_check_interval)
            && self.snapshot.checkpoint.counters.self_checks_used < settings.max_self_checks
        {
            self.snapshot.checkpoint.counters.self_checks_used += 1;
            self.persist().await?;
            let ctx = self
                .context(vec![format!("self-check after {} completed steps", completed)])
                .await;
            match settle(self.engine.planner.self_check(&ctx).await, "self_check").flatten() {
                Some(SelfCheckVerdict::Replan { reason, steps }) => {
                    let steps = self.screen(index, steps);
                    if !steps.is_empty() {
                        return self
                            .apply_change(
                                PlanChange::Replace {
                                    cut,
                                    steps,
                                    trigger: ChangeTrigger::SelfCheck,
                                },
                                &reason,
                            )
                            .await;
                    }
                }
                Some(SelfCheckVerdict::Escalate { reason }) => {
                    return self
                        .escalate(EscalationSource::SelfCheck, reason, None)
                        .await;
                }
                Some(SelfCheckVerdict::OnTrack) | None => {}
            }
        }

        Ok(Flow::Proceed)
    }

    async fn summarize_memory(&mut self) -> Result<(), EngineError> {
        let interval = self.settings().memory_summary_interval;
        let completed = self.snapshot.checkpoint.plan.completed_count() as u32;
        if interval == 0
            || completed.saturating_sub(self.snapshot.checkpoint.memory_summary_watermark) < interval
        {
            return Ok(());
        }

        let ctx = self.context(Vec::new()).await;
        if let Some(summary) = settle(self.engine.planner.summarize(&ctx).await, "summarize").flatten()
        {
            let limit = self.settings().session_memory_limit;
            if let Err(e) = self
                .engine
                .memory
                .add_session_summary(&self.snapshot.run.id, &summary, limit)
                .await
            {
                tracing::warn!(run_id = %self.snapshot.run.id, "Failed to store session summary: {}", e);
            }
        }
        self.snapshot.checkpoint.memory_summary_watermark = completed;
        self.persist().await
    }
}

/// Location left behind by the most recent step that reported one.
pub(crate) fn last_known_location(snapshot: &RunSnapshot) -> Option<String> {
    snapshot
        .checkpoint
        .plan
        .steps()
        .iter()
        .rev()
        .find_map(|step| step.last_snapshot.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::plan::{Plan, StepStatus};
    use crate::agent::run::{Preferences, Settings};

    fn checkpoint_with(steps: Vec<PlanStep>) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(Settings::default(), Preferences::default());
        checkpoint.plan = Plan::new(steps);
        checkpoint
    }

    fn exhausted(title: &str) -> PlanStep {
        let mut step = PlanStep::new(title, ToolSelector::Browser, 3);
        for _ in 0..3 {
            step.begin_attempt();
            step.fail("timeout");
        }
        step
    }

    #[test]
    fn test_replan_from_failed_step_resets_active_index() {
        let mut checkpoint = checkpoint_with(vec![exhausted("Open flights")]);
        checkpoint.last_error = Some("timeout".into());

        let change = PlanChange::Replace {
            cut: 0,
            steps: vec![
                PlanStep::new("Open airline site", ToolSelector::Browser, 3),
                PlanStep::new("Read fares", ToolSelector::Observe, 3),
            ],
            trigger: ChangeTrigger::Replan(ReplanReason::StepFailure),
        };
        assert_eq!(change.apply(&mut checkpoint).unwrap(), 2);

        assert_eq!(checkpoint.plan.active_index(), Some(0));
        assert_eq!(checkpoint.plan.len(), 2);
        assert!(checkpoint.last_error.is_none());
        assert_eq!(checkpoint.counters.replans_used, 1);
        assert_eq!(
            checkpoint.active_step_id.as_deref(),
            Some(checkpoint.plan.get(0).unwrap().id.as_str())
        );
    }

    #[test]
    fn test_branch_skips_failed_step_and_keeps_history() {
        let mut done = PlanStep::new("Open site", ToolSelector::Browser, 3);
        done.begin_attempt();
        done.complete(Some("site/home".into()), 1);
        let failed = exhausted("Click login");
        let failed_id = failed.id.clone();
        let mut checkpoint = checkpoint_with(vec![
            done,
            failed,
            PlanStep::new("Read inbox", ToolSelector::Observe, 3),
        ]);

        let change = PlanChange::Insert {
            after: 1,
            steps: vec![PlanStep::new("Use sign-in link", ToolSelector::Browser, 3)],
            trigger: ChangeTrigger::Branch,
        };
        change.apply(&mut checkpoint).unwrap();

        let titles: Vec<&str> = checkpoint.plan.steps().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Open site", "Click login", "Use sign-in link", "Read inbox"]);
        assert_eq!(checkpoint.plan.get(1).unwrap().status, StepStatus::Skipped);
        assert_eq!(checkpoint.plan.active_index(), Some(2));
        assert!(checkpoint.branched_step_ids.contains(&failed_id));
        // Branches have their own budget.
        assert_eq!(checkpoint.counters.replans_used, 0);
    }

    #[test]
    fn test_replace_after_failed_step_keeps_its_error() {
        let mut failed = PlanStep::new("Open pricing tab", ToolSelector::Browser, 3);
        failed.begin_attempt();
        failed.fail("selector not found");
        let mut checkpoint = checkpoint_with(vec![
            failed,
            PlanStep::new("Click next page", ToolSelector::Browser, 3),
        ]);
        checkpoint.last_error = Some("selector not found".into());

        let change = PlanChange::Replace {
            cut: 1,
            steps: vec![PlanStep::new("Use the search box", ToolSelector::Browser, 3)],
            trigger: ChangeTrigger::LoopGuard,
        };
        change.apply(&mut checkpoint).unwrap();

        assert_eq!(checkpoint.plan.active_index(), Some(0));
        assert_eq!(checkpoint.last_error.as_deref(), Some("selector not found"));
        assert_eq!(checkpoint.plan.get(1).unwrap().title, "Use the search box");
    }

    #[test]
    fn test_change_cannot_rewrite_history() {
        let mut done = PlanStep::new("Open site", ToolSelector::Browser, 3);
        done.begin_attempt();
        done.complete(None, 0);
        let mut checkpoint = checkpoint_with(vec![done, PlanStep::new("Next", ToolSelector::Browser, 3)]);

        let change = PlanChange::Replace {
            cut: 0,
            steps: vec![PlanStep::new("Other", ToolSelector::Browser, 3)],
            trigger: ChangeTrigger::LoopGuard,
        };
        assert!(matches!(
            change.apply(&mut checkpoint),
            Err(PlanError::HistoryRewrite { active: 1, requested: 0 })
        ));
        assert_eq!(checkpoint.plan.len(), 2);
    }
}
