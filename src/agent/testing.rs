//! Scripted collaborators for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::control::ControlRequest;
use super::events::{EngineEvent, EventSink};
use super::run::{CheckpointBrief, Verification};
use crate::browser::{
    BrowserDriver, BrowserSession, InvokeKind, LaunchOptions, ToolError, ToolOutcome, ToolRequest,
};
use crate::planner::{
    AdaptiveReview, ApprovalDecision, LoopGuardDecision, Planner, PlannerContext, PlannerError,
    ReplanReason, SelfCheckVerdict, StepDraft,
};
use crate::store::CheckpointStore;

/// Event sink that records everything it sees.
pub fn collect_events() -> (EventSink, Arc<Mutex<Vec<EngineEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let events = events.clone();
        EventSink::with_callback(move |event| events.lock().unwrap().push(event.clone()))
    };
    (sink, events)
}

#[derive(Default)]
struct Script {
    plans: HashMap<ReplanReason, VecDeque<Vec<StepDraft>>>,
    default_plan: Vec<StepDraft>,
    branches: VecDeque<Vec<StepDraft>>,
    reviews: VecDeque<AdaptiveReview>,
    loop_decisions: VecDeque<LoopGuardDecision>,
    self_checks: VecDeque<SelfCheckVerdict>,
    approvals: VecDeque<ApprovalDecision>,
    verification: Option<Verification>,
    reflection: Option<String>,
    calls: Vec<String>,
}

/// Planner that answers from queues. Anything unscripted means "no change".
#[derive(Default)]
pub struct ScriptedPlanner {
    script: Mutex<Script>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(self, reason: ReplanReason, drafts: Vec<StepDraft>) -> Self {
        self.script
            .lock()
            .unwrap()
            .plans
            .entry(reason)
            .or_default()
            .push_back(drafts);
        self
    }

    /// Initial plan handed to every run that has no scripted one.
    pub fn with_default_plan(self, drafts: Vec<StepDraft>) -> Self {
        self.script.lock().unwrap().default_plan = drafts;
        self
    }

    pub fn with_branch(self, drafts: Vec<StepDraft>) -> Self {
        self.script.lock().unwrap().branches.push_back(drafts);
        self
    }

    pub fn with_review(self, review: AdaptiveReview) -> Self {
        self.script.lock().unwrap().reviews.push_back(review);
        self
    }

    pub fn with_loop_decision(self, decision: LoopGuardDecision) -> Self {
        self.script.lock().unwrap().loop_decisions.push_back(decision);
        self
    }

    pub fn with_self_check(self, verdict: SelfCheckVerdict) -> Self {
        self.script.lock().unwrap().self_checks.push_back(verdict);
        self
    }

    pub fn with_approval(self, decision: ApprovalDecision) -> Self {
        self.script.lock().unwrap().approvals.push_back(decision);
        self
    }

    pub fn with_verification(self, verification: Verification) -> Self {
        self.script.lock().unwrap().verification = Some(verification);
        self
    }

    pub fn with_reflection(self, lesson: impl Into<String>) -> Self {
        self.script.lock().unwrap().reflection = Some(lesson.into());
        self
    }

    /// How many times `name` was called.
    pub fn calls(&self, name: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.as_str() == name)
            .count()
    }

    pub fn call_log(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    fn record(&self, name: impl Into<String>) -> std::sync::MutexGuard<'_, Script> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(name.into());
        script
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn build_plan(
        &self,
        _ctx: &PlannerContext,
        reason: ReplanReason,
    ) -> Result<Vec<StepDraft>, PlannerError> {
        let mut script = self.record(format!("build_plan:{}", reason.as_str()));
        let scripted = script.plans.get_mut(&reason).and_then(VecDeque::pop_front);
        Ok(match scripted {
            Some(drafts) => drafts,
            None if reason == ReplanReason::Initial => script.default_plan.clone(),
            None => Vec::new(),
        })
    }

    async fn branch(&self, _ctx: &PlannerContext) -> Result<Vec<StepDraft>, PlannerError> {
        Ok(self.record("branch").branches.pop_front().unwrap_or_default())
    }

    async fn adaptive_review(
        &self,
        _ctx: &PlannerContext,
    ) -> Result<Option<AdaptiveReview>, PlannerError> {
        Ok(self.record("adaptive_review").reviews.pop_front())
    }

    async fn loop_guard_review(
        &self,
        _ctx: &PlannerContext,
    ) -> Result<Option<LoopGuardDecision>, PlannerError> {
        Ok(self.record("loop_guard_review").loop_decisions.pop_front())
    }

    async fn self_check(
        &self,
        _ctx: &PlannerContext,
    ) -> Result<Option<SelfCheckVerdict>, PlannerError> {
        Ok(self.record("self_check").self_checks.pop_front())
    }

    async fn approval_gate(
        &self,
        _ctx: &PlannerContext,
    ) -> Result<Option<ApprovalDecision>, PlannerError> {
        Ok(self.record("approval_gate").approvals.pop_front())
    }

    async fn summarize(&self, ctx: &PlannerContext) -> Result<Option<String>, PlannerError> {
        self.record("summarize");
        Ok(Some(format!(
            "{} steps completed toward {}",
            ctx.completed_steps, ctx.goal
        )))
    }

    async fn brief(&self, _ctx: &PlannerContext) -> Result<Option<CheckpointBrief>, PlannerError> {
        self.record("brief");
        Ok(None)
    }

    async fn verify(&self, _ctx: &PlannerContext) -> Result<Option<Verification>, PlannerError> {
        Ok(self.record("verify").verification.clone())
    }

    async fn reflect(&self, _ctx: &PlannerContext) -> Result<Option<String>, PlannerError> {
        Ok(self.record("reflect").reflection.clone())
    }
}

/// One recorded tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub run_id: String,
    pub step_id: String,
    pub kind: InvokeKind,
    pub instruction: String,
    pub current_location: Option<String>,
}

#[derive(Default)]
struct DriverState {
    outcomes: VecDeque<ToolOutcome>,
    invocations: Vec<Invocation>,
    launches: usize,
    closes: usize,
    control: Option<(Arc<dyn CheckpointStore>, ControlRequest)>,
}

/// Driver whose sessions answer from a shared outcome queue.
pub struct FakeDriver {
    state: Arc<Mutex<DriverState>>,
    default_outcome: ToolOutcome,
    fail_launch: bool,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DriverState::default())),
            default_outcome: ToolOutcome::success(Some("page/1".to_string()), 1),
            fail_launch: false,
        }
    }

    /// Queue an outcome; once the queue is empty the default is returned.
    pub fn with_outcome(self, outcome: ToolOutcome) -> Self {
        self.state.lock().unwrap().outcomes.push_back(outcome);
        self
    }

    pub fn with_default(mut self, outcome: ToolOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Push `request` for the invoking run during the first tool call.
    pub fn with_control_on_first_invoke(
        self,
        store: Arc<dyn CheckpointStore>,
        request: ControlRequest,
    ) -> Self {
        self.state.lock().unwrap().control = Some((store, request));
        self
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    pub fn launches(&self) -> usize {
        self.state.lock().unwrap().launches
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn launch(
        &self,
        run_id: &str,
        _options: &LaunchOptions,
    ) -> Result<Box<dyn BrowserSession>, ToolError> {
        if self.fail_launch {
            return Err(ToolError::Launch("no browser available".to_string()));
        }
        self.state.lock().unwrap().launches += 1;
        Ok(Box::new(FakeSession {
            run_id: run_id.to_string(),
            state: self.state.clone(),
            default_outcome: self.default_outcome.clone(),
        }))
    }
}

struct FakeSession {
    run_id: String,
    state: Arc<Mutex<DriverState>>,
    default_outcome: ToolOutcome,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn invoke(&mut self, kind: InvokeKind, request: &ToolRequest) -> ToolOutcome {
        let (outcome, control) = {
            let mut state = self.state.lock().unwrap();
            state.invocations.push(Invocation {
                run_id: request.run_id.clone(),
                step_id: request.step_id.clone(),
                kind,
                instruction: request.instruction.clone(),
                current_location: request.current_location.clone(),
            });
            let outcome = state
                .outcomes
                .pop_front()
                .unwrap_or_else(|| self.default_outcome.clone());
            (outcome, state.control.take())
        };

        if let Some((store, request)) = control {
            store.push_control(&self.run_id, request).await.unwrap();
        }
        outcome
    }

    async fn close(&mut self) -> Result<(), ToolError> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}
