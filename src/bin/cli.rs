//! Browser Agent - resumable plan/execute/replan runs from the command line
//!
//! This is the CLI entry point for the browser-agent tool.
//! Run with: cargo run --bin browser-agent -- run <goal>

use browser_agent::{
    AppSettings, CommandDriver, ControlOutcome, Engine, EngineEvent, EventSink, FileCheckpointStore,
    HttpPlanner, JsonMemoryStore, RunController, RunReport, RunStatus, StepStatus,
};
use std::env;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage:
  browser-agent run <goal...>
  browser-agent resume <run-id> [step-id] [--recover]
  browser-agent stop <run-id>
  browser-agent override <run-id> <step-id> <pending|completed|failed|skipped>
  browser-agent status <run-id>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    // Initialize tracing, RUST_LOG wins over the default
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (args, flags): (Vec<String>, Vec<String>) =
        env::args().skip(1).partition(|arg| !arg.starts_with("--"));
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut settings = AppSettings::load();
    settings.apply_env();

    let checkpoints = Arc::new(FileCheckpointStore::new(settings.resolved_checkpoint_dir()));
    let controller = RunController::new(checkpoints.clone());

    match command.as_str() {
        "run" => {
            let goal = args[1..].join(" ");
            if goal.trim().is_empty() {
                anyhow::bail!("A goal is required\n{}", USAGE);
            }
            let engine = build_engine(&settings, checkpoints).await?;

            println!("🌐 Browser Agent");
            println!("================================================");
            println!("Planner: {} @ {}", settings.planner_model_name, settings.planner_base_url);
            println!("Tool model: {}", settings.tool_model);
            println!("Driver: {}", settings.driver_command);
            if settings.require_approval {
                println!("Approval: required for risky steps");
            }
            println!("================================================\n");

            let run = engine.controller().create(goal.as_str(), settings.run_options()).await?;
            println!("📝 Goal: {}", goal);
            println!("🆔 Run: {}\n", run.id());
            drive(&engine, &controller, run.id()).await?;
        }
        "resume" => {
            let run_id = required(&args, 1, "run-id")?;
            let step_id = args.get(2).map(String::as_str);
            let recover = flags.iter().any(|flag| flag == "--recover");
            let outcome = controller.resume(run_id, step_id).await?;
            let status = controller.status(run_id).await?.run.status;
            println!("▶️ Resume {}: {:?} ({})", run_id, outcome, status.as_str());
            if !should_drive(outcome, status, recover) {
                if status == RunStatus::Running {
                    println!("Run is marked running. If its process is gone, resume with --recover");
                } else {
                    println!("Nothing to resume");
                }
                return Ok(());
            }
            let engine = build_engine(&settings, checkpoints).await?;
            drive(&engine, &controller, run_id).await?;
        }
        "stop" => {
            let run_id = required(&args, 1, "run-id")?;
            let outcome = controller.stop(run_id).await?;
            println!("⏹️ Stop {}: {:?}", run_id, outcome);
        }
        "override" => {
            let run_id = required(&args, 1, "run-id")?;
            let step_id = required(&args, 2, "step-id")?;
            let status_name = required(&args, 3, "status")?;
            let status = StepStatus::parse(status_name)
                .ok_or_else(|| anyhow::anyhow!("Unknown step status: {}", status_name))?;
            let outcome = controller
                .override_step_status(run_id, step_id, status)
                .await?;
            println!("✏️ Override {} -> {}: {:?}", step_id, status.as_str(), outcome);
        }
        "status" => {
            let run_id = required(&args, 1, "run-id")?;
            print_status(&controller, run_id).await?;
        }
        other => {
            eprintln!("Unknown command: {}\n{}", other, USAGE);
        }
    }

    Ok(())
}

/// Whether `resume` should start an engine. A run still marked `running`
/// may belong to a live process, so it is only picked up with `--recover`.
fn should_drive(outcome: ControlOutcome, status: RunStatus, recover: bool) -> bool {
    match status {
        RunStatus::Pending => true,
        RunStatus::Running => recover,
        status if status.is_paused() => outcome == ControlOutcome::Applied,
        _ => false,
    }
}

fn required<'a>(args: &'a [String], index: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("Missing <{}>\n{}", name, USAGE))
}

async fn build_engine(
    settings: &AppSettings,
    checkpoints: Arc<FileCheckpointStore>,
) -> anyhow::Result<Engine> {
    let memory = JsonMemoryStore::open(settings.resolved_memory_path()).await?;
    let planner = HttpPlanner::new(settings.model_config());
    let driver = CommandDriver::new(settings.driver_config());

    let events = EventSink::with_callback(|event| match event {
        EngineEvent::PlanCreated { steps, .. } => println!("🗺️ Plan created with {} steps", steps),
        EngineEvent::StepStarted { title, attempt, .. } => {
            println!("🔄 {} (attempt {})", title, attempt)
        }
        EngineEvent::StepCompleted { location, .. } => match location {
            Some(location) => println!("✅ Done at {}", location),
            None => println!("✅ Done"),
        },
        EngineEvent::StepFailed { error, .. } => println!("⚠️ Failed: {}", error),
        EngineEvent::PlanChanged { reason, steps, .. } => {
            println!("🔀 Plan changed ({}), {} new steps", reason, steps)
        }
        EngineEvent::LoopGuardBackoff { delay_ms, .. } => {
            println!("⏳ Repetition detected, backing off {}ms", delay_ms)
        }
        EngineEvent::ApprovalRequested { step_id, reason, risk, .. } => {
            println!("🙋 Approval needed for {} ({} risk): {}", step_id, risk, reason)
        }
        EngineEvent::HumanRequired { reason, .. } => println!("🙋 Human needed: {}", reason),
        _ => {}
    });

    Ok(Engine::new(
        Arc::new(planner),
        Arc::new(driver),
        checkpoints,
        Arc::new(memory),
    )
    .with_events(events))
}

/// Run until the engine returns; Ctrl-C asks the run to stop at its next step boundary.
async fn drive(engine: &Engine, controller: &RunController, run_id: &str) -> anyhow::Result<()> {
    let mut handle = engine.spawn(run_id);
    let report = tokio::select! {
        joined = &mut handle => joined??,
        _ = tokio::signal::ctrl_c() => {
            println!("\n⏹️ Stopping after the current step...");
            controller.stop(run_id).await?;
            handle.await??
        }
    };
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    match report.status {
        RunStatus::Completed => println!("✅ Run completed"),
        RunStatus::Failed => eprintln!(
            "❌ Run failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        ),
        RunStatus::Stopped => println!("⏹️ Run stopped"),
        RunStatus::WaitingApproval => println!(
            "⏸️ Waiting for approval. Grant with: browser-agent resume {}",
            report.run_id
        ),
        RunStatus::WaitingHuman => println!(
            "⏸️ Waiting for a human. Continue with: browser-agent resume {} [step-id]",
            report.run_id
        ),
        other => println!("Run is {}", other.as_str()),
    }
    println!(
        "Steps: {}/{} completed, {} executions",
        report.completed_steps, report.total_steps, report.steps_executed
    );
    if let Some(ref verification) = report.verification {
        println!("Verification: {}", verification.summary);
    }
}

async fn print_status(controller: &RunController, run_id: &str) -> anyhow::Result<()> {
    let snapshot = controller.status(run_id).await?;
    let run = &snapshot.run;
    let checkpoint = &snapshot.checkpoint;

    println!("🆔 {}", run.id);
    println!("📝 {}", run.goal);
    println!("Status: {}", run.status.as_str());
    if let Some(ref error) = run.error {
        println!("Error: {}", error);
    }
    if let Some(ref step_id) = checkpoint.approval_request_step_id {
        println!("Approval requested for: {}", step_id);
    }
    if let Some(ref escalation) = checkpoint.escalation {
        println!("Escalation: {}", escalation.reason);
    }
    if let Some(ref brief) = checkpoint.brief {
        println!("Brief: {}", brief.summary);
        for action in &brief.next_actions {
            println!("  → {}", action);
        }
    }

    let stats = checkpoint.plan.stats();
    println!(
        "\nPlan ({:.0}% done, {} replans used):",
        stats.completion_percentage(),
        checkpoint.counters.replans_used
    );
    for step in checkpoint.plan.steps() {
        let marker = match step.status {
            StepStatus::Completed => "✅",
            StepStatus::Failed => "❌",
            StepStatus::Skipped => "⏭️",
            StepStatus::Running => "🔄",
            StepStatus::Pending => "⬜",
        };
        println!("  {} {} {} ({}/{})", marker, step.id, step.title, step.attempts, step.max_attempts);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_only_drives_runnable_runs() {
        assert!(should_drive(ControlOutcome::Applied, RunStatus::Pending, false));
        assert!(should_drive(ControlOutcome::Unchanged, RunStatus::Pending, false));

        // A running run may still have a live engine.
        assert!(!should_drive(ControlOutcome::Unchanged, RunStatus::Running, false));
        assert!(should_drive(ControlOutcome::Unchanged, RunStatus::Running, true));

        assert!(!should_drive(ControlOutcome::Unchanged, RunStatus::WaitingHuman, true));
        assert!(!should_drive(ControlOutcome::Applied, RunStatus::Completed, true));
    }
}
