//! System prompts for the planner service.
//!
//! Each planner call type has its own prompt. All of them ask for a single
//! JSON object so responses can be parsed without guesswork.

use chrono::Local;

const PREAMBLE: &str = "You are the planning component of an autonomous browser agent. \
A separate browser-automation tool executes one plan step at a time; you never act \
on the browser yourself. You receive a JSON context with the goal, the task type, \
session memory, an excerpt of the plan and runtime signals. Answer with exactly one \
JSON object and nothing else.";

const STEP_SCHEMA: &str = r#"Each step is an object:
{"title": "imperative instruction for the browser tool",
 "tool": "browser" | "observe" | "none",
 "phase": "optional phase name",
 "priority": optional integer 1-5,
 "expected_observation": "what the page should show afterwards",
 "success_criteria": "how to tell the step worked"}
Use "observe" for steps that only read the current page and "none" for pure bookkeeping."#;

pub const BUILD_PLAN_PROMPT: &str = r#"Produce a plan for the goal.
The "reason" field of the context tells you why a plan is needed:
- "initial": plan the whole task from the start.
- any other value: the steps already completed stay as they are; plan only what
  remains, taking the last error and signals into account, and do not repeat
  steps that already failed.
Respond with {"steps": [ ... ]}. Keep plans short (3 to 10 steps)."#;

pub const BRANCH_PROMPT: &str = r#"The active step has failed all of its attempts.
Propose alternative steps that reach the same intermediate result another way.
Respond with {"steps": [ ... ]}, or {"steps": []} if there is no sensible alternative."#;

pub const ADAPTIVE_REVIEW_PROMPT: &str = r#"Review progress so far.
If the remaining plan is still appropriate respond with {"should_replan": false}.
Otherwise respond with {"should_replan": true, "reason": "...", "steps": [ ... ]}
where steps are inserted right after the current step."#;

pub const LOOP_GUARD_PROMPT: &str = r#"The agent appears to be repeating the same steps without progress.
Decide how to get out of the loop. Respond with one of:
{"decision": "continue"}
{"decision": "replan", "reason": "...", "steps": [ ... ]}   (replaces everything after the current step)
{"decision": "escalate_human", "reason": "..."}   (a person has to intervene)"#;

pub const SELF_CHECK_PROMPT: &str = r#"Check whether the run is still heading toward the goal.
Respond with one of:
{"verdict": "on_track"}
{"verdict": "replan", "reason": "...", "steps": [ ... ]}
{"verdict": "escalate", "reason": "..."}"#;

pub const APPROVAL_GATE_PROMPT: &str = r#"Decide whether the active step needs explicit human approval
before it runs. Approval is needed for anything irreversible or with side effects
outside the browser: purchases, payments, submitting forms, sending messages,
deleting or publishing content.
Respond with {"requires_approval": true|false, "reason": "...", "risk": "low" | "medium" | "high"}."#;

pub const SUMMARIZE_PROMPT: &str = r#"Summarize the progress since the last summary in one or two
sentences a later planner call can rely on. Mention concrete pages, values found and
dead ends. Respond with {"summary": "..."}."#;

pub const BRIEF_PROMPT: &str = r#"Write a short checkpoint brief for an operator who looks at this
run right now. Respond with
{"summary": "...", "next_actions": ["..."], "risks": ["..."]}."#;

pub const VERIFY_PROMPT: &str = r#"All plan steps are finished. Judge from the context whether the
goal was actually achieved. Respond with {"achieved": true|false, "summary": "..."}."#;

pub const REFLECT_PROMPT: &str = r#"The run is over. State one reusable lesson for future runs on
similar goals (site quirks, better step orderings, traps to avoid). Respond with
{"lesson": "..."} or {"lesson": ""} if there is nothing worth keeping."#;

/// Build the full system prompt for one call type, dated like every prompt.
pub fn planner_system_prompt(instructions: &str) -> String {
    let today = Local::now().format("%B %d, %Y");
    format!(
        "Today's date is: {}\n{}\n\n{}\n\n{}",
        today, PREAMBLE, instructions, STEP_SCHEMA
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_contains_schema() {
        let prompt = planner_system_prompt(BUILD_PLAN_PROMPT);
        assert!(prompt.starts_with("Today's date is:"));
        assert!(prompt.contains("\"steps\""));
        assert!(prompt.contains("\"tool\": \"browser\" | \"observe\" | \"none\""));
    }
}
