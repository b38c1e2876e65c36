//! Planner backed by an OpenAI-compatible chat model.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    AdaptiveReview, ApprovalDecision, LoopGuardDecision, Planner, PlannerContext, PlannerError,
    ReplanReason, SelfCheckVerdict, StepDraft,
};
use crate::agent::run::{CheckpointBrief, Verification};
use crate::config::{
    planner_system_prompt, ADAPTIVE_REVIEW_PROMPT, APPROVAL_GATE_PROMPT, BRANCH_PROMPT,
    BRIEF_PROMPT, BUILD_PLAN_PROMPT, LOOP_GUARD_PROMPT, REFLECT_PROMPT, SELF_CHECK_PROMPT,
    SUMMARIZE_PROMPT, VERIFY_PROMPT,
};
use crate::model::{MessageBuilder, ModelClient, ModelConfig};

#[derive(Debug, Deserialize)]
struct StepsResponse {
    #[serde(default)]
    steps: Vec<StepDraft>,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct LessonResponse {
    #[serde(default)]
    lesson: String,
}

/// Planner that sends every call to a chat-completions endpoint.
pub struct HttpPlanner {
    client: ModelClient,
}

impl HttpPlanner {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            client: ModelClient::new(config),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.client.config().model_name
    }

    /// Send one call and decode the JSON answer. Unparseable answers are
    /// logged and reported as `None`.
    async fn ask<T: DeserializeOwned>(
        &self,
        call: &str,
        instructions: &str,
        payload: Value,
    ) -> Result<Option<T>, PlannerError> {
        let messages = vec![
            MessageBuilder::create_system_message(&planner_system_prompt(instructions)),
            MessageBuilder::create_user_message(&payload.to_string()),
        ];

        let response = self.client.request(&messages).await?;
        if !response.thinking.is_empty() {
            tracing::debug!(call, "Planner reasoning: {}", response.thinking);
        }

        let parsed = parse_json_response::<T>(&response.content);
        if parsed.is_none() {
            tracing::warn!(
                call,
                "Unparseable planner response: {}",
                response.content.chars().take(300).collect::<String>()
            );
        }
        Ok(parsed)
    }

    fn context_payload(ctx: &PlannerContext) -> Value {
        json!({ "context": ctx })
    }
}

/// Decode a JSON object from a model answer: the whole text, a fenced code
/// block, or the outermost pair of braces.
pub(crate) fn parse_json_response<T: DeserializeOwned>(response: &str) -> Option<T> {
    if let Ok(value) = serde_json::from_str::<T>(response.trim()) {
        return Some(value);
    }

    if let Some(block) = extract_fenced_json(response) {
        if let Ok(value) = serde_json::from_str::<T>(&block) {
            return Some(value);
        }
    }

    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<T>(&response[start..=end]).ok()
}

/// Extract JSON from markdown code blocks.
fn extract_fenced_json(response: &str) -> Option<String> {
    // ```json\n{...}\n```
    if let Some(start) = response.find("```json") {
        let after_marker = &response[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    // ```\n{...}\n``` or ```{...}```
    if let Some(start) = response.find("```") {
        let after_marker = &response[start + 3..];
        if after_marker.trim_start().starts_with('{') {
            if let Some(end) = after_marker.find("```") {
                return Some(after_marker[..end].trim().to_string());
            }
        }
    }

    None
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn build_plan(
        &self,
        ctx: &PlannerContext,
        reason: ReplanReason,
    ) -> Result<Vec<StepDraft>, PlannerError> {
        let payload = json!({ "reason": reason.as_str(), "context": ctx });
        let response: Option<StepsResponse> =
            self.ask("build_plan", BUILD_PLAN_PROMPT, payload).await?;
        Ok(response.map(|r| r.steps).unwrap_or_default())
    }

    async fn branch(&self, ctx: &PlannerContext) -> Result<Vec<StepDraft>, PlannerError> {
        let response: Option<StepsResponse> = self
            .ask("branch", BRANCH_PROMPT, Self::context_payload(ctx))
            .await?;
        Ok(response.map(|r| r.steps).unwrap_or_default())
    }

    async fn adaptive_review(
        &self,
        ctx: &PlannerContext,
    ) -> Result<Option<AdaptiveReview>, PlannerError> {
        self.ask(
            "adaptive_review",
            ADAPTIVE_REVIEW_PROMPT,
            Self::context_payload(ctx),
        )
        .await
    }

    async fn loop_guard_review(
        &self,
        ctx: &PlannerContext,
    ) -> Result<Option<LoopGuardDecision>, PlannerError> {
        self.ask("loop_guard", LOOP_GUARD_PROMPT, Self::context_payload(ctx))
            .await
    }

    async fn self_check(
        &self,
        ctx: &PlannerContext,
    ) -> Result<Option<SelfCheckVerdict>, PlannerError> {
        self.ask("self_check", SELF_CHECK_PROMPT, Self::context_payload(ctx))
            .await
    }

    async fn approval_gate(
        &self,
        ctx: &PlannerContext,
    ) -> Result<Option<ApprovalDecision>, PlannerError> {
        self.ask(
            "approval_gate",
            APPROVAL_GATE_PROMPT,
            Self::context_payload(ctx),
        )
        .await
    }

    async fn summarize(&self, ctx: &PlannerContext) -> Result<Option<String>, PlannerError> {
        let response: Option<SummaryResponse> = self
            .ask("summarize", SUMMARIZE_PROMPT, Self::context_payload(ctx))
            .await?;
        Ok(response
            .map(|r| r.summary.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    async fn brief(&self, ctx: &PlannerContext) -> Result<Option<CheckpointBrief>, PlannerError> {
        self.ask("brief", BRIEF_PROMPT, Self::context_payload(ctx))
            .await
    }

    async fn verify(&self, ctx: &PlannerContext) -> Result<Option<Verification>, PlannerError> {
        self.ask("verify", VERIFY_PROMPT, Self::context_payload(ctx))
            .await
    }

    async fn reflect(&self, ctx: &PlannerContext) -> Result<Option<String>, PlannerError> {
        let response: Option<LessonResponse> = self
            .ask("reflect", REFLECT_PROMPT, Self::context_payload(ctx))
            .await?;
        Ok(response
            .map(|r| r.lesson.trim().to_string())
            .filter(|s| !s.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::plan::ToolSelector;
    use crate::planner::RiskLevel;

    #[test]
    fn test_parse_direct_json() {
        let response: StepsResponse = parse_json_response(
            r#"{"steps": [{"title": "Open example.com"}, {"title": "Read price", "tool": "observe"}]}"#,
        )
        .unwrap();
        assert_eq!(response.steps.len(), 2);
        assert_eq!(response.steps[0].tool, ToolSelector::Browser);
        assert_eq!(response.steps[1].tool, ToolSelector::Observe);
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = "Here is the plan:\n```json\n{\"requires_approval\": true, \"reason\": \"pays\", \"risk\": \"high\"}\n```\nGood luck.";
        let decision: ApprovalDecision = parse_json_response(text).unwrap();
        assert!(decision.requires_approval);
        assert_eq!(decision.risk, RiskLevel::High);

        let bare_fence = "```\n{\"achieved\": false, \"summary\": \"no results\"}\n```";
        let verification: Verification = parse_json_response(bare_fence).unwrap();
        assert!(!verification.achieved);
    }

    #[test]
    fn test_parse_embedded_braces() {
        let text = "Sure! {\"decision\": \"continue\"} Let me know.";
        let decision: LoopGuardDecision = parse_json_response(text).unwrap();
        assert_eq!(decision, LoopGuardDecision::Continue);
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_json_response::<AdaptiveReview>("I think we should keep going").is_none());
        assert!(parse_json_response::<AdaptiveReview>("} weird {").is_none());
    }
}
