//! Agent module: plan model, step runner, engine and run controls.

pub(crate) mod control;
mod engine;
mod events;
mod loop_guard;
pub(crate) mod plan;
mod policy;
pub(crate) mod run;
mod runner;
#[cfg(test)]
mod testing;

pub use control::{ControlError, ControlOutcome, ControlRequest, RunController};
pub use engine::{Engine, EngineError, RunReport};
pub use events::{EngineEvent, EventCallback, EventSink};
pub use loop_guard::{LoopCheck, LoopGuard};
pub use plan::{Plan, PlanError, PlanStats, PlanStep, StepStatus, ToolSelector};
pub use policy::{classify_task, is_human_required, ApprovalHint};
pub use run::{
    Checkpoint, CheckpointBrief, Escalation, EscalationSource, Preferences, Run, RunCounters,
    RunOptions, RunSnapshot, RunStatus, Settings, TaskType, Verification,
};
pub use runner::{ChangeTrigger, PlanChange, RunnerExit, StepRunner, StepTransition};
