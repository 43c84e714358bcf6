//! LLM 推理后端：把规划、判定、可行性分析转成提示词并解析 JSON 回复
//!
//! 回复可以是 ```json 代码块或裸 JSON；解析失败统一为 MalformedResponse，超时为 Timeout。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::backend::{BackendError, ReasoningBackend, ToolSet};
use crate::core::{EvaluationResult, ExecutionPlan, ExecutionResult, ImpossibilityAnalysis, PlanStep};
use crate::llm::{LlmClient, Message};

const PLAN_PROMPT: &str = r#"You are the planning component of a task orchestrator.
Break the user's request into a short ordered list of concrete steps.
Each step has:
- "order": 1-based position, contiguous, in execution order
- "step_type": one of "code_execution", "file_read", "file_write", "analysis", "user_input"
- "description": what the step must achieve
- "parameters": object; code_execution takes "code" (a script) or "command" (a shell command),
  file_read takes "path", file_write takes "path" and "content"
Only use step types backed by these capabilities: {capabilities} (analysis is always allowed).
Respond with JSON only: {"steps": [ ... ]}"#;

const JUDGE_PROMPT: &str = r#"You judge one attempt of one plan step.
Given the step and its execution result, decide:
- "success": the step's intent is satisfied
- "retryable_failure": a transient problem; retrying the same step may work
- "terminal_failure": retrying the same step cannot help (malformed request, invalid operation)
- "impossible_signal": the step cannot be achieved in principle
Respond with JSON only: {"verdict": "...", "explanation": "...", "feedback": "optional advice for re-planning"}"#;

const FEASIBILITY_PROMPT: &str = r#"You decide whether a task is impossible given its accumulated failures.
Only answer true when the failures show the goal cannot be achieved by any plan,
not merely that the current plan was poor.
Respond with JSON only: {"is_impossible": true|false, "explanation": "..."}"#;

/// 从回复中取出 JSON 文本：优先 ```json 代码块，
/// 其次按出现顺序尝试每个 { 或 [ 到与之配对的最后一个闭合符，取第一个合法的片段
pub fn extract_json(reply: &str) -> Option<&str> {
    let trimmed = reply.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let spans: Vec<&str> = trimmed
        .match_indices(['{', '['])
        .filter_map(|(start, open)| {
            let close = if open == "{" { '}' } else { ']' };
            let end = trimmed.rfind(close)?;
            (end > start).then(|| &trimmed[start..=end])
        })
        .collect();
    spans
        .iter()
        .find(|span| serde_json::from_str::<serde_json::Value>(span).is_ok())
        .or_else(|| spans.first())
        .copied()
}

fn parse_reply<T: DeserializeOwned>(reply: &str) -> Result<T, BackendError> {
    let json = extract_json(reply)
        .ok_or_else(|| BackendError::MalformedResponse(format!("no JSON in reply: {}", reply)))?;
    serde_json::from_str(json)
        .map_err(|e| BackendError::MalformedResponse(format!("{}: {}", e, json)))
}

/// 计划回复：{"steps": [...]} 或直接是数组
#[derive(Deserialize)]
#[serde(untagged)]
enum PlanReply {
    Wrapped { steps: Vec<PlanStep> },
    Bare(Vec<PlanStep>),
}

impl PlanReply {
    fn into_steps(self) -> Vec<PlanStep> {
        match self {
            PlanReply::Wrapped { steps } | PlanReply::Bare(steps) => steps,
        }
    }
}

pub struct LlmReasoningBackend {
    llm: Arc<dyn LlmClient>,
    request_timeout: Duration,
    plan_prompt: String,
}

impl LlmReasoningBackend {
    pub fn new(llm: Arc<dyn LlmClient>, tools: &ToolSet, request_timeout: Duration) -> Self {
        Self {
            llm,
            request_timeout,
            plan_prompt: PLAN_PROMPT.replace("{capabilities}", &tools.describe()),
        }
    }

    async fn ask(&self, system: &str, user: String) -> Result<String, BackendError> {
        let messages = [Message::system(system), Message::user(user)];
        match tokio::time::timeout(self.request_timeout, self.llm.complete(&messages)).await {
            Ok(reply) => {
                let (prompt, completion, total) = self.llm.token_usage();
                tracing::debug!(prompt, completion, total, "llm token usage");
                reply.map_err(BackendError::Llm)
            }
            Err(_) => Err(BackendError::Timeout(format!(
                "LLM request exceeded {}s",
                self.request_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl ReasoningBackend for LlmReasoningBackend {
    async fn propose_plan(&self, request: &str) -> Result<Vec<PlanStep>, BackendError> {
        let reply = self
            .ask(&self.plan_prompt, format!("Request:\n{}", request))
            .await?;
        parse_reply::<PlanReply>(&reply).map(PlanReply::into_steps)
    }

    async fn propose_refinement(
        &self,
        plan: &ExecutionPlan,
        feedback: &str,
        request: &str,
    ) -> Result<Vec<PlanStep>, BackendError> {
        let user = format!(
            "Request:\n{}\n\nThe previous plan (version {}) failed:\n{}\n\nFeedback:\n{}\n\n\
             Produce a complete replacement plan that avoids the failure.",
            request,
            plan.version(),
            plan.outline(),
            feedback
        );
        let reply = self.ask(&self.plan_prompt, user).await?;
        parse_reply::<PlanReply>(&reply).map(PlanReply::into_steps)
    }

    async fn judge(
        &self,
        step: &PlanStep,
        result: &ExecutionResult,
    ) -> Result<EvaluationResult, BackendError> {
        let step_json = serde_json::to_string(step)
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        let result_json = serde_json::to_string(result)
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        let reply = self
            .ask(
                JUDGE_PROMPT,
                format!("Step:\n{}\n\nResult:\n{}", step_json, result_json),
            )
            .await?;
        parse_reply(&reply)
    }

    async fn assess_feasibility(
        &self,
        failures: &[String],
    ) -> Result<ImpossibilityAnalysis, BackendError> {
        let listed = failures
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{}. {}", i + 1, f))
            .collect::<Vec<_>>()
            .join("\n");
        let reply = self
            .ask(FEASIBILITY_PROMPT, format!("Failures so far:\n{}", listed))
            .await?;
        parse_reply(&reply)
    }
}
