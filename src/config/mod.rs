//! Static configuration: planner prompts.

mod prompts;

pub use prompts::{
    planner_system_prompt, ADAPTIVE_REVIEW_PROMPT, APPROVAL_GATE_PROMPT, BRANCH_PROMPT,
    BRIEF_PROMPT, BUILD_PLAN_PROMPT, LOOP_GUARD_PROMPT, REFLECT_PROMPT, SELF_CHECK_PROMPT,
    SUMMARIZE_PROMPT, VERIFY_PROMPT,
};
