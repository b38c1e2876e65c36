//! Tool call execution with a slow-call watchdog.

use std::time::{Duration, Instant};

use super::{BrowserSession, InvokeKind, ToolError, ToolOutcome, ToolRequest};

/// Owns a run's browser session and times every call through it.
///
/// A call that takes longer than the warning threshold is reported once
/// through tracing and then allowed to finish; the watchdog never cancels.
pub struct ToolExecutor {
    session: Box<dyn BrowserSession>,
    slow_warning: Duration,
    calls: u32,
}

impl ToolExecutor {
    pub fn new(session: Box<dyn BrowserSession>, slow_warning: Duration) -> Self {
        Self {
            session,
            slow_warning,
            calls: 0,
        }
    }

    /// Number of tool calls made through this executor.
    pub fn calls(&self) -> u32 {
        self.calls
    }

    pub async fn invoke(&mut self, kind: InvokeKind, request: &ToolRequest) -> ToolOutcome {
        self.calls += 1;
        let started = Instant::now();
        let slow_warning = self.slow_warning;

        let call = self.session.invoke(kind, request);
        tokio::pin!(call);

        let outcome = tokio::select! {
            outcome = &mut call => outcome,
            _ = tokio::time::sleep(slow_warning) => {
                tracing::warn!(
                    run_id = %request.run_id,
                    step_id = %request.step_id,
                    kind = kind.as_str(),
                    "Tool call still running after {}ms",
                    slow_warning.as_millis()
                );
                call.await
            }
        };

        tracing::debug!(
            step_id = %request.step_id,
            ok = outcome.ok,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tool call finished"
        );
        outcome
    }

    pub async fn close(&mut self) -> Result<(), ToolError> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct SlowSession {
        delay: Duration,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BrowserSession for SlowSession {
        async fn invoke(&mut self, _kind: InvokeKind, _request: &ToolRequest) -> ToolOutcome {
            tokio::time::sleep(self.delay).await;
            ToolOutcome::success(Some("slow.example".into()), 1)
        }

        async fn close(&mut self) -> Result<(), ToolError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request() -> ToolRequest {
        ToolRequest {
            run_id: "run".into(),
            step_id: "step".into(),
            goal: "goal".into(),
            instruction: "open page".into(),
            expected_observation: None,
            success_criteria: None,
            current_location: None,
        }
    }

    #[tokio::test]
    async fn test_slow_call_is_not_cancelled() {
        let closed = Arc::new(AtomicBool::new(false));
        let session = SlowSession {
            delay: Duration::from_millis(60),
            closed: closed.clone(),
        };
        let mut executor = ToolExecutor::new(Box::new(session), Duration::from_millis(5));

        let outcome = executor.invoke(InvokeKind::Full, &request()).await;
        assert!(outcome.ok);
        assert_eq!(outcome.location_id(), Some("slow.example"));
        assert_eq!(executor.calls(), 1);

        executor.close().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }
}
