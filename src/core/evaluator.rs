//! Evaluator：单次尝试判定 + 任务级不可能性分析
//!
//! 判定优先交给推理后端，但不盲信：结果标记失败时后端给出的 Success 会降级为 RetryableFailure；
//! 后端调用失败时回退到本地规则分类。不可能性分析失败时偏向“并非不可能”，不会误报 Impossible。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::ReasoningBackend;
use crate::core::{ExecutionResult, OrchestratorError, PlanStep, RetryContext};

/// 单次尝试的判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// 步骤意图已满足
    Success,
    /// 用同一步骤重试可能修复（瞬时错误、不稳定执行）
    RetryableFailure,
    /// 重试同一步骤无济于事（请求畸形、操作在逻辑上无效）
    TerminalFailure,
    /// 该步骤本身原则上无法实现
    ImpossibleSignal,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }
}

/// 判定结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub verdict: Verdict,
    pub explanation: String,
    /// 供重规划使用的建议
    #[serde(default)]
    pub feedback: Option<String>,
}

impl EvaluationResult {
    pub fn new(verdict: Verdict, explanation: impl Into<String>) -> Self {
        Self {
            verdict,
            explanation: explanation.into(),
            feedback: None,
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }
}

/// 任务级不可能性分析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpossibilityAnalysis {
    pub is_impossible: bool,
    pub explanation: String,
}

/// 不可重试错误的特征子串（小写）
const TERMINAL_MARKERS: &[&str] = &[
    "not permitted",
    "permission denied",
    "path escape",
    "malformed",
    "invalid",
    "syntax error",
    "unsupported",
    "requires user input",
    "unrecognized step type",
];

/// 后端不可用时的本地分类
pub fn classify_locally(result: &ExecutionResult) -> EvaluationResult {
    if result.success {
        return EvaluationResult::new(Verdict::Success, "execution reported success");
    }
    let error = result.error_text();
    let lower = error.to_lowercase();
    if let Some(marker) = TERMINAL_MARKERS.iter().find(|m| lower.contains(*m)) {
        return EvaluationResult::new(
            Verdict::TerminalFailure,
            format!("non-retryable failure ({marker}): {error}"),
        );
    }
    EvaluationResult::new(
        Verdict::RetryableFailure,
        if error.is_empty() {
            "execution reported failure without detail".to_string()
        } else {
            format!("execution failed: {error}")
        },
    )
}

pub struct Evaluator {
    backend: Arc<dyn ReasoningBackend>,
}

impl Evaluator {
    pub fn new(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self { backend }
    }

    pub async fn evaluate(
        &self,
        step: &PlanStep,
        result: &ExecutionResult,
        context: &RetryContext,
        cancel: &CancellationToken,
    ) -> Result<EvaluationResult, OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let judged = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            judged = self.backend.judge(step, result) => judged,
        };

        let evaluation = match judged {
            Ok(mut evaluation) => {
                if evaluation.verdict.is_success() && !result.success {
                    tracing::warn!(
                        step = step.order,
                        attempt = context.attempt_number,
                        "backend judged success but execution failed, downgrading"
                    );
                    evaluation.verdict = Verdict::RetryableFailure;
                    evaluation.explanation = format!(
                        "execution reported failure ({}); judge said: {}",
                        result.error_text(),
                        evaluation.explanation
                    );
                }
                evaluation
            }
            Err(e) => {
                tracing::warn!(
                    step = step.order,
                    attempt = context.attempt_number,
                    error = %e,
                    "judge unavailable, classifying locally"
                );
                classify_locally(result)
            }
        };

        tracing::debug!(
            step = step.order,
            attempt = context.attempt_number,
            verdict = ?evaluation.verdict,
            "attempt evaluated"
        );
        Ok(evaluation)
    }

    pub async fn analyze_impossibility(
        &self,
        failures: &[String],
        cancel: &CancellationToken,
    ) -> Result<ImpossibilityAnalysis, OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        if failures.is_empty() {
            return Ok(ImpossibilityAnalysis {
                is_impossible: false,
                explanation: "no failures recorded".to_string(),
            });
        }

        let assessed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            assessed = self.backend.assess_feasibility(failures) => assessed,
        };

        match assessed {
            Ok(analysis) => Ok(analysis),
            Err(e) => {
                tracing::warn!(error = %e, "feasibility assessment unavailable");
                Ok(ImpossibilityAnalysis {
                    is_impossible: false,
                    explanation: format!("feasibility could not be assessed: {e}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::core::{ExecutionPlan, StepType};
    use async_trait::async_trait;

    /// 固定返回的判定后端；judge 为 None 时模拟后端不可用
    struct FixedJudge {
        judge: Option<EvaluationResult>,
        impossible: Option<bool>,
    }

    #[async_trait]
    impl ReasoningBackend for FixedJudge {
        async fn propose_plan(&self, _request: &str) -> Result<Vec<PlanStep>, BackendError> {
            Ok(vec![])
        }

        async fn propose_refinement(
            &self,
            _plan: &ExecutionPlan,
            _feedback: &str,
            _request: &str,
        ) -> Result<Vec<PlanStep>, BackendError> {
            Ok(vec![])
        }

        async fn judge(
            &self,
            _step: &PlanStep,
            _result: &ExecutionResult,
        ) -> Result<EvaluationResult, BackendError> {
            self.judge
                .clone()
                .ok_or_else(|| BackendError::Llm("offline".to_string()))
        }

        async fn assess_feasibility(
            &self,
            _failures: &[String],
        ) -> Result<ImpossibilityAnalysis, BackendError> {
            match self.impossible {
                Some(is_impossible) => Ok(ImpossibilityAnalysis {
                    is_impossible,
                    explanation: "judged".to_string(),
                }),
                None => Err(BackendError::Timeout("slow".to_string())),
            }
        }
    }

    fn step() -> PlanStep {
        PlanStep::new(1, StepType::CodeExecution, "compute")
    }

    #[test]
    fn test_classify_locally() {
        assert_eq!(
            classify_locally(&ExecutionResult::succeeded("ok")).verdict,
            Verdict::Success
        );
        assert_eq!(
            classify_locally(&ExecutionResult::failed("connection reset")).verdict,
            Verdict::RetryableFailure
        );
        assert_eq!(
            classify_locally(&ExecutionResult::failed("Not permitted: command 'rm'")).verdict,
            Verdict::TerminalFailure
        );
        assert_eq!(
            classify_locally(&ExecutionResult::failed("SyntaxError: invalid syntax")).verdict,
            Verdict::TerminalFailure
        );
    }

    #[tokio::test]
    async fn test_success_on_failed_result_is_downgraded() {
        let evaluator = Evaluator::new(Arc::new(FixedJudge {
            judge: Some(EvaluationResult::new(Verdict::Success, "looks fine")),
            impossible: None,
        }));
        let result = ExecutionResult::failed("exit 1");
        let eval = evaluator
            .evaluate(&step(), &result, &RetryContext::new(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(eval.verdict, Verdict::RetryableFailure);
        assert!(eval.explanation.contains("exit 1"));
    }

    #[tokio::test]
    async fn test_judge_unavailable_falls_back() {
        let evaluator = Evaluator::new(Arc::new(FixedJudge {
            judge: None,
            impossible: None,
        }));
        let eval = evaluator
            .evaluate(
                &step(),
                &ExecutionResult::succeeded("42"),
                &RetryContext::new(3),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(eval.verdict, Verdict::Success);
    }

    #[tokio::test]
    async fn test_evaluate_observes_cancellation() {
        let evaluator = Evaluator::new(Arc::new(FixedJudge {
            judge: Some(EvaluationResult::new(Verdict::Success, "ok")),
            impossible: None,
        }));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = evaluator
            .evaluate(&step(), &ExecutionResult::succeeded(""), &RetryContext::new(1), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_impossibility_empty_history_short_circuits() {
        let evaluator = Evaluator::new(Arc::new(FixedJudge {
            judge: None,
            impossible: Some(true),
        }));
        let analysis = evaluator
            .analyze_impossibility(&[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(!analysis.is_impossible);
    }

    #[tokio::test]
    async fn test_impossibility_backend_error_is_not_impossible() {
        let evaluator = Evaluator::new(Arc::new(FixedJudge {
            judge: None,
            impossible: None,
        }));
        let analysis = evaluator
            .analyze_impossibility(&["boom".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        assert!(!analysis.is_impossible);
        assert!(analysis.explanation.contains("slow"));
    }

    #[tokio::test]
    async fn test_impossibility_delegates() {
        let evaluator = Evaluator::new(Arc::new(FixedJudge {
            judge: None,
            impossible: Some(true),
        }));
        let analysis = evaluator
            .analyze_impossibility(&["no such dataset".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        assert!(analysis.is_impossible);
        assert_eq!(analysis.explanation, "judged");
    }
}
