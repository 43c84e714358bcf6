//! Planner：请求 -> 经校验的 ExecutionPlan；无执行副作用
//!
//! 推理交给后端，结构校验在本地完成；校验不通过时返回 Planning 错误（携带原始请求），绝不返回部分合法的计划。

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::ReasoningBackend;
use crate::core::{ExecutionPlan, OrchestratorError, PlanStep};

/// 计划结构问题
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanIssue {
    Empty,
    /// 第 position 个步骤的序号不是期望值
    OrderOutOfSequence { position: usize, expected: u32, found: u32 },
    DuplicateOrder(u32),
    BlankDescription(u32),
    UnrecognizedStepType(u32),
}

impl fmt::Display for PlanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanIssue::Empty => write!(f, "plan has no steps"),
            PlanIssue::OrderOutOfSequence {
                position,
                expected,
                found,
            } => write!(
                f,
                "step at position {} has order {} (expected {})",
                position, found, expected
            ),
            PlanIssue::DuplicateOrder(order) => write!(f, "order {} appears more than once", order),
            PlanIssue::BlankDescription(order) => write!(f, "step {} has an empty description", order),
            PlanIssue::UnrecognizedStepType(order) => {
                write!(f, "step {} has an unrecognized step type", order)
            }
        }
    }
}

/// 计划的全部结构问题；空 Vec 表示合法
///
/// 规则：至少一步；序号按列表顺序恰为 1..=n；描述非空；步骤类型可识别。
pub fn plan_issues(plan: &ExecutionPlan) -> Vec<PlanIssue> {
    let steps = plan.steps();
    if steps.is_empty() {
        return vec![PlanIssue::Empty];
    }

    let mut issues = Vec::new();
    let mut seen = HashSet::new();
    for (i, step) in steps.iter().enumerate() {
        if !seen.insert(step.order) {
            issues.push(PlanIssue::DuplicateOrder(step.order));
        }
        let expected = i as u32 + 1;
        if step.order != expected {
            issues.push(PlanIssue::OrderOutOfSequence {
                position: i + 1,
                expected,
                found: step.order,
            });
        }
        if step.description.trim().is_empty() {
            issues.push(PlanIssue::BlankDescription(step.order));
        }
        if !step.step_type.is_recognized() {
            issues.push(PlanIssue::UnrecognizedStepType(step.order));
        }
    }
    issues
}

pub struct Planner {
    backend: Arc<dyn ReasoningBackend>,
}

impl Planner {
    pub fn new(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self { backend }
    }

    pub fn validate_plan(&self, plan: &ExecutionPlan) -> bool {
        plan_issues(plan).is_empty()
    }

    pub async fn create_plan(
        &self,
        request: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let proposed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            proposed = self.backend.propose_plan(request) => proposed,
        };
        let steps = proposed.map_err(|e| OrchestratorError::planning(request, e.to_string()))?;
        self.accept(ExecutionPlan::new(steps), request)
    }

    /// 基于反馈请求新计划；原计划不变
    pub async fn refine_plan(
        &self,
        original: &ExecutionPlan,
        feedback: &str,
        request: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let proposed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            proposed = self.backend.propose_refinement(original, feedback, request) => proposed,
        };
        let steps = proposed.map_err(|e| {
            OrchestratorError::planning(request, format!("refinement failed: {}", e))
        })?;
        self.accept(ExecutionPlan::refined_from(original, steps), request)
    }

    fn accept(
        &self,
        plan: ExecutionPlan,
        request: &str,
    ) -> Result<ExecutionPlan, OrchestratorError> {
        let issues = plan_issues(&plan);
        if !issues.is_empty() {
            let reason = issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(version = plan.version(), %reason, "plan rejected");
            return Err(OrchestratorError::planning(request, reason));
        }
        tracing::info!(
            version = plan.version(),
            steps = plan.len(),
            "plan accepted"
        );
        Ok(plan)
    }
}
