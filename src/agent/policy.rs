//! Keyword heuristics used by the step runner.
//!
//! These are fast, local checks. Anything they cannot decide is left to the
//! planner.

use once_cell::sync::Lazy;
use regex::Regex;

use super::plan::{PlanStep, ToolSelector};
use super::run::TaskType;

const RISKY_WORDS: &[&str] = &[
    "buy",
    "purchase",
    "pay",
    "payment",
    "checkout",
    "check out",
    "place order",
    "order now",
    "submit",
    "confirm",
    "delete",
    "remove",
    "send",
    "transfer",
    "publish",
    "post",
    "book",
    "subscribe",
    "unsubscribe",
    "sign up",
    "cancel",
];

const SAFE_WORDS: &[&str] = &[
    "open",
    "navigate",
    "go to",
    "visit",
    "search",
    "read",
    "view",
    "look",
    "find",
    "scroll",
    "extract",
    "collect",
    "compare",
    "list",
    "browse",
    "review",
    "note",
];

const HUMAN_REQUIRED_PATTERNS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "cloudflare",
    r"are you a robot",
    r"unusual traffic",
    r"verify (?:that )?you are (?:a )?human",
    r"access denied",
    r"bot detection",
];

const TRANSACTION_WORDS: &[&str] = &[
    "buy", "purchase", "order", "checkout", "book", "reserve", "pay", "subscribe",
];

const EXTRACTION_WORDS: &[&str] = &[
    "extract",
    "collect",
    "scrape",
    "gather",
    "list",
    "find",
    "compare",
    "summari[sz]e",
    "price",
    "prices",
    "how many",
    "what is",
    "look up",
];

const NAVIGATION_WORDS: &[&str] = &["open", "go to", "navigate", "visit", "log in", "sign in"];

const EXTRACTION_STEP_WORDS: &[&str] = &[
    "extract",
    "collect",
    "scrape",
    "gather",
    "read",
    "record",
    "copy",
    "capture",
    "list",
    "compare",
    "summari[sz]e",
];

/// Case-insensitive whole-word alternation.
fn keyword_regex(words: &[&str]) -> Option<Regex> {
    let pattern = format!(r"(?i)\b(?:{})\b", words.join("|"));
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!("Invalid keyword pattern: {}", e);
            None
        }
    }
}

static RISKY: Lazy<Option<Regex>> = Lazy::new(|| keyword_regex(RISKY_WORDS));
static SAFE: Lazy<Option<Regex>> = Lazy::new(|| keyword_regex(SAFE_WORDS));
static HUMAN_REQUIRED: Lazy<Option<Regex>> = Lazy::new(|| keyword_regex(HUMAN_REQUIRED_PATTERNS));
static TRANSACTION: Lazy<Option<Regex>> = Lazy::new(|| keyword_regex(TRANSACTION_WORDS));
static EXTRACTION: Lazy<Option<Regex>> = Lazy::new(|| keyword_regex(EXTRACTION_WORDS));
static NAVIGATION: Lazy<Option<Regex>> = Lazy::new(|| keyword_regex(NAVIGATION_WORDS));
static EXTRACTION_STEP: Lazy<Option<Regex>> = Lazy::new(|| keyword_regex(EXTRACTION_STEP_WORDS));

fn is_match(re: &Lazy<Option<Regex>>, text: &str) -> bool {
    re.as_ref().map(|re| re.is_match(text)).unwrap_or(false)
}

fn first_match(re: &Lazy<Option<Regex>>, text: &str) -> Option<String> {
    re.as_ref()
        .and_then(|re| re.find(text))
        .map(|m| m.as_str().to_lowercase())
}

/// Result of the local approval check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalHint {
    Required { reason: String },
    NotRequired,
    /// Ask the planner.
    Inconclusive,
}

/// Decide from the step text alone whether it needs approval.
pub fn approval_hint(step: &PlanStep) -> ApprovalHint {
    if step.tool != ToolSelector::Browser {
        return ApprovalHint::NotRequired;
    }
    let text = step_text(step);
    if let Some(word) = first_match(&RISKY, &text) {
        return ApprovalHint::Required {
            reason: format!("step mentions \"{}\"", word),
        };
    }
    if is_match(&SAFE, &text) {
        return ApprovalHint::NotRequired;
    }
    ApprovalHint::Inconclusive
}

/// Errors that no amount of retrying will fix without a person.
pub fn is_human_required(error: &str) -> bool {
    is_match(&HUMAN_REQUIRED, error)
}

/// Coarse task type from the goal text.
pub fn classify_task(goal: &str) -> TaskType {
    if is_match(&TRANSACTION, goal) {
        TaskType::Transaction
    } else if is_match(&EXTRACTION, goal) {
        TaskType::Extraction
    } else if is_match(&NAVIGATION, goal) {
        TaskType::Navigation
    } else {
        TaskType::General
    }
}

/// Steps that are expected to pull data out of a page.
pub fn is_extraction_step(step: &PlanStep) -> bool {
    is_match(&EXTRACTION_STEP, &step_text(step))
}

fn step_text(step: &PlanStep) -> String {
    match &step.success_criteria {
        Some(criteria) => format!("{} {}", step.title, criteria),
        None => step.title.clone(),
    }
}
