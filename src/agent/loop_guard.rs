//! Repetition detection over recent step outcomes.
//!
//! The guard keeps a bounded trace of (title, status, tool, location) and
//! raises a signal when the tail of the trace is the same block of outcomes
//! repeated `threshold` times back to back. A signal outside the cooldown asks
//! for a review, preceded by an exponential backoff.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use super::plan::{PlanStep, StepStatus, ToolSelector};
use super::run::Settings;
use crate::planner::StepDraft;

/// One recorded outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TraceEntry {
    step_id: String,
    title: String,
    status: StepStatus,
    tool: ToolSelector,
    location: Option<String>,
}

impl TraceEntry {
    /// Fields that make two outcomes "the same".
    fn same_outcome(&self, other: &TraceEntry) -> bool {
        self.title == other.title && self.status == other.status && self.location == other.location
    }
}

/// What the runner should do after recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCheck {
    Clear,
    /// Repetition seen but a previous review is still cooling down.
    Cooldown,
    /// Sleep for `backoff`, then request a loop-guard review.
    Review { backoff: Duration, period: usize },
}

/// Loop detector for a single run.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    threshold: usize,
    window: usize,
    cooldown_steps: u32,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
    trace: VecDeque<TraceEntry>,
    cooldown_remaining: u32,
    streak: u32,
}

impl LoopGuard {
    pub fn new(settings: &Settings) -> Self {
        let threshold = (settings.loop_guard_threshold as usize).max(2);
        Self {
            threshold,
            window: settings.loop_guard_window.max(threshold),
            cooldown_steps: settings.loop_guard_cooldown_steps,
            backoff_base_ms: settings.backoff_base_ms,
            backoff_cap_ms: settings.backoff_cap_ms,
            trace: VecDeque::new(),
            cooldown_remaining: 0,
            streak: 0,
        }
    }

    /// Reviews requested since the signal last cleared.
    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn trace_len(&self) -> usize {
        self.trace.len()
    }

    /// Record the outcome of a step attempt.
    pub fn record(&mut self, step: &PlanStep, location: Option<&str>) -> LoopCheck {
        // Retries of the same step are one outcome, not a loop.
        if self
            .trace
            .back()
            .is_some_and(|last| last.step_id == step.id)
        {
            return LoopCheck::Clear;
        }

        self.trace.push_back(TraceEntry {
            step_id: step.id.clone(),
            title: normalize_title(&step.title),
            status: step.status,
            tool: step.tool,
            location: location.map(str::to_string),
        });
        // Enforce window limit
        while self.trace.len() > self.window {
            self.trace.pop_front();
        }

        let period = self.repeating_period();
        if period.is_none() {
            self.streak = 0;
        }

        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            return match period {
                Some(_) => LoopCheck::Cooldown,
                None => LoopCheck::Clear,
            };
        }

        match period {
            Some(period) => {
                let backoff = self.backoff();
                self.streak += 1;
                self.cooldown_remaining = self.cooldown_steps;
                LoopCheck::Review { backoff, period }
            }
            None => LoopCheck::Clear,
        }
    }

    /// `min(base * 2^streak, cap)`.
    fn backoff(&self) -> Duration {
        let factor = 1u64.checked_shl(self.streak.min(32)).unwrap_or(u64::MAX);
        let delay = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }

    /// Shortest block length whose `threshold` repetitions form the tail.
    fn repeating_period(&self) -> Option<usize> {
        let entries: Vec<&TraceEntry> = self.trace.iter().collect();
        let max_period = self.window / self.threshold;
        (1..=max_period).find(|&period| {
            let span = period * self.threshold;
            if entries.len() < span {
                return false;
            }
            let tail = &entries[entries.len() - span..];
            let block = &tail[span - period..];
            tail.chunks(period).all(|chunk| {
                chunk
                    .iter()
                    .zip(block.iter())
                    .all(|(a, b)| a.same_outcome(b))
            })
        })
    }

    /// Drop planner candidates that repeat recently tried steps or each
    /// other.
    pub fn screen_candidates(candidates: Vec<StepDraft>, recent: &[&PlanStep]) -> Vec<StepDraft> {
        let mut seen: HashSet<String> = recent
            .iter()
            .map(|step| normalize_title(&step.title))
            .collect();
        candidates
            .into_iter()
            .filter(|draft| {
                let key = normalize_title(&draft.title);
                !key.is_empty() && seen.insert(key)
            })
            .collect()
    }
}

/// Lowercase, punctuation-free, single-spaced title.
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, cooldown: u32) -> Settings {
        Settings {
            loop_guard_threshold: threshold,
            loop_guard_window: 12,
            loop_guard_cooldown_steps: cooldown,
            backoff_base_ms: 100,
            backoff_cap_ms: 350,
            ..Settings::default()
        }
    }

    fn outcome(title: &str, status: StepStatus) -> PlanStep {
        let mut step = PlanStep::new(title, ToolSelector::Browser, 3);
        step.status = status;
        step
    }

    #[test]
    fn test_single_step_repetition_fires_once_per_cooldown() {
        let mut guard = LoopGuard::new(&settings(3, 3));
        let checks: Vec<LoopCheck> = (0..5)
            .map(|_| guard.record(&outcome("Click Next", StepStatus::Completed), Some("shop/p2")))
            .collect();

        let reviews = checks
            .iter()
            .filter(|c| matches!(c, LoopCheck::Review { .. }))
            .count();
        assert_eq!(reviews, 1);
        assert_eq!(
            checks[2],
            LoopCheck::Review {
                backoff: Duration::from_millis(100),
                period: 1
            }
        );
        assert_eq!(checks[3], LoopCheck::Cooldown);
    }

    #[test]
    fn test_two_step_cycle() {
        let mut guard = LoopGuard::new(&settings(3, 0));
        let mut last = LoopCheck::Clear;
        for _ in 0..3 {
            guard.record(&outcome("Open results", StepStatus::Completed), Some("a"));
            last = guard.record(&outcome("Open details.", StepStatus::Failed), Some("b"));
        }
        assert!(matches!(last, LoopCheck::Review { period: 2, .. }));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut guard = LoopGuard::new(&settings(2, 0));
        let mut delays = Vec::new();
        for _ in 0..5 {
            if let LoopCheck::Review { backoff, .. } =
                guard.record(&outcome("Scroll", StepStatus::Completed), None)
            {
                delays.push(backoff.as_millis() as u64);
            }
        }
        assert_eq!(delays, vec![100, 200, 350, 350]);
        assert_eq!(guard.streak(), 4);

        // A different outcome clears the signal and the streak.
        guard.record(&outcome("Open cart", StepStatus::Completed), None);
        assert_eq!(guard.streak(), 0);
    }

    #[test]
    fn test_retries_of_same_step_are_not_reappended() {
        let mut guard = LoopGuard::new(&settings(3, 0));
        let step = outcome("Submit search", StepStatus::Failed);
        for _ in 0..5 {
            assert_eq!(guard.record(&step, None), LoopCheck::Clear);
        }
        assert_eq!(guard.trace_len(), 1);
    }

    #[test]
    fn test_different_location_is_not_a_loop() {
        let mut guard = LoopGuard::new(&settings(3, 0));
        for page in ["p1", "p2", "p3", "p4"] {
            let check = guard.record(&outcome("Next page", StepStatus::Completed), Some(page));
            assert_eq!(check, LoopCheck::Clear);
        }
    }

    #[test]
    fn test_screen_candidates() {
        let tried = outcome("Search for  'usb cable'", StepStatus::Failed);
        let recent = vec![&tried];
        let candidates = vec![
            StepDraft::new("search for usb cable", ToolSelector::Browser),
            StepDraft::new("Open category menu", ToolSelector::Browser),
            StepDraft::new("Open Category Menu!", ToolSelector::Browser),
            StepDraft::new("Read first result", ToolSelector::Observe),
        ];
        let screened = LoopGuard::screen_candidates(candidates, &recent);
        let titles: Vec<&str> = screened.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["Open category menu", "Read first result"]);
    }
}
