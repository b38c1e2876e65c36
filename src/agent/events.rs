//! Audit events emitted at every state-changing transition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::run::RunStatus;

/// Something happened to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: String,
        goal: String,
    },
    PlanCreated {
        run_id: String,
        steps: usize,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        title: String,
        attempt: u32,
    },
    StepCompleted {
        run_id: String,
        step_id: String,
        location: Option<String>,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        attempt: u32,
        error: String,
    },
    PlanChanged {
        run_id: String,
        reason: String,
        steps: usize,
    },
    LoopGuardBackoff {
        run_id: String,
        delay_ms: u64,
    },
    LoopGuardReviewed {
        run_id: String,
        decision: String,
    },
    ApprovalRequested {
        run_id: String,
        step_id: String,
        reason: String,
        risk: String,
    },
    HumanRequired {
        run_id: String,
        reason: String,
    },
    ControlApplied {
        run_id: String,
        request: String,
    },
    MemoryRejected {
        run_id: String,
        reason: String,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        error: Option<String>,
    },
}

/// Callback for engine events.
pub type EventCallback = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Fans events out to tracing and an optional callback.
#[derive(Clone, Default)]
pub struct EventSink {
    callback: Option<EventCallback>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::StepFailed {
                run_id,
                step_id,
                attempt,
                error,
            } => tracing::warn!(run_id = %run_id, step_id = %step_id, attempt, "Step failed: {}", error),
            EngineEvent::HumanRequired { run_id, reason } => {
                tracing::warn!(run_id = %run_id, "Human intervention required: {}", reason)
            }
            EngineEvent::RunFinished {
                run_id,
                status,
                error,
            } => tracing::info!(
                run_id = %run_id,
                status = status.as_str(),
                error = error.as_deref().unwrap_or(""),
                "Run finished"
            ),
            other => tracing::debug!(?other, "Engine event"),
        }

        if let Some(ref callback) = self.callback {
            callback(&event);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_callback_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            EventSink::with_callback(move |event| seen.lock().unwrap().push(event.clone()))
        };

        sink.emit(EngineEvent::LoopGuardBackoff {
            run_id: "r".into(),
            delay_ms: 20,
        });
        EventSink::new().emit(EngineEvent::PlanCreated {
            run_id: "r".into(),
            steps: 2,
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], EngineEvent::LoopGuardBackoff { delay_ms: 20, .. }));
    }
}
