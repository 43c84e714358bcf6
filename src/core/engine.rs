//! ExecutionEngine：单步骤的尝试循环
//!
//! 执行 -> 评估 -> Success 返回 / RetryableFailure 退避后重试 / 其它判定或重试耗尽则失败。
//! RetryContext 只存在于一次 `execute_step_with_retry` 调用内，步骤之间互不影响。
//! 取消在每次尝试前、执行期间、评估前和退避等待中都会被观察到；取消不计入失败。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::ExecutionBackend;
use crate::core::events::send_event;
use crate::core::{
    EvaluationResult, Evaluator, ExecutionResult, OrchestratorError, OrchestratorEvent, PlanStep, RetryContext,
    RetryPolicy, StepRecord, Verdict,
};

/// 单步骤失败：携带序号、尝试次数、最后判定与失败历史
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub order: u32,
    pub attempts_made: u32,
    pub verdict: Verdict,
    pub history: Vec<String>,
    /// 各次评估给出的重规划建议
    pub feedback: Vec<String>,
}

impl StepFailure {
    pub fn to_error(&self) -> OrchestratorError {
        OrchestratorError::Execution {
            step_order: self.order,
            attempts: self.attempts_made,
        }
    }
}

/// 单步骤的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded(StepRecord),
    Failed(StepFailure),
    Cancelled { attempts_made: u32 },
}

pub struct ExecutionEngine {
    backend: Arc<dyn ExecutionBackend>,
    evaluator: Arc<Evaluator>,
    policy: RetryPolicy,
    event_tx: Option<tokio::sync::mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl ExecutionEngine {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        evaluator: Arc<Evaluator>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            evaluator,
            policy,
            event_tx: None,
        }
    }

    pub fn with_event_sender(
        mut self,
        tx: tokio::sync::mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute_step_with_retry(
        &self,
        task_id: &str,
        plan_version: u32,
        step: &PlanStep,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let mut ctx = self.policy.create_initial_context();
        let mut feedback = Vec::new();

        loop {
            let attempt = ctx.attempt_number;
            if cancel.is_cancelled() {
                return StepOutcome::Cancelled {
                    attempts_made: attempt - 1,
                };
            }

            send_event(
                &self.event_tx,
                OrchestratorEvent::AttemptStarted {
                    task_id: task_id.to_string(),
                    step: step.order,
                    attempt,
                },
            );
            tracing::debug!(task_id, step = step.order, attempt, "attempt started");

            let run = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return StepOutcome::Cancelled { attempts_made: attempt };
                }
                run = self.backend.run(step) => run,
            };
            // 后端错误在步骤内吸收为失败结果，交给评估分类
            let result = run.unwrap_or_else(|e| ExecutionResult::failed(e.to_string()));

            let evaluated = self.evaluator.evaluate(step, &result, &ctx, cancel).await;
            let Some(evaluation) = settle_evaluation(evaluated) else {
                return StepOutcome::Cancelled { attempts_made: attempt };
            };
            send_event(
                &self.event_tx,
                OrchestratorEvent::AttemptEvaluated {
                    task_id: task_id.to_string(),
                    step: step.order,
                    attempt,
                    verdict: evaluation.verdict,
                    explanation: evaluation.explanation.clone(),
                },
            );
            if let Some(f) = &evaluation.feedback {
                feedback.push(f.clone());
            }

            match evaluation.verdict {
                Verdict::Success => {
                    return StepOutcome::Succeeded(StepRecord {
                        plan_version,
                        order: step.order,
                        succeeded: true,
                        attempts: attempt,
                        output: result.output,
                        failure_history: ctx.failure_history,
                    });
                }
                Verdict::RetryableFailure => {
                    tracing::warn!(
                        task_id,
                        step = step.order,
                        attempt,
                        explanation = %evaluation.explanation,
                        "attempt failed"
                    );
                    ctx.record_failure(format!(
                        "step {} attempt {}: {}",
                        step.order, attempt, evaluation.explanation
                    ));
                    if !self.policy.should_retry(&ctx) {
                        return self.failed(step, &ctx, Verdict::RetryableFailure, feedback);
                    }

                    let delay = self.policy.get_delay(attempt);
                    ctx.attempt_number += 1;
                    ctx.last_delay = delay;
                    send_event(
                        &self.event_tx,
                        OrchestratorEvent::Backoff {
                            task_id: task_id.to_string(),
                            step: step.order,
                            delay_ms: delay.as_millis() as u64,
                        },
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return StepOutcome::Cancelled { attempts_made: attempt };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                verdict @ (Verdict::TerminalFailure | Verdict::ImpossibleSignal) => {
                    tracing::warn!(
                        task_id,
                        step = step.order,
                        attempt,
                        ?verdict,
                        explanation = %evaluation.explanation,
                        "attempt failed, not retrying"
                    );
                    ctx.record_failure(format!(
                        "step {} attempt {}: {}",
                        step.order, attempt, evaluation.explanation
                    ));
                    return self.failed(step, &ctx, verdict, feedback);
                }
            }
        }
    }

    fn failed(
        &self,
        step: &PlanStep,
        ctx: &RetryContext,
        verdict: Verdict,
        feedback: Vec<String>,
    ) -> StepOutcome {
        StepOutcome::Failed(StepFailure {
            order: step.order,
            attempts_made: ctx.attempt_number,
            verdict,
            history: ctx.failure_history.clone(),
            feedback,
        })
    }
}

/// 评估结果落地：取消返回 None；其它评估错误视为一次可重试的失败尝试
fn settle_evaluation(
    evaluated: Result<EvaluationResult, OrchestratorError>,
) -> Option<EvaluationResult> {
    match evaluated {
        Ok(evaluation) => Some(evaluation),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(EvaluationResult::new(
            Verdict::RetryableFailure,
            format!("evaluation failed: {}", e),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, ReasoningBackend};
    use crate::core::{ExecutionPlan, ImpossibilityAnalysis, StepType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// 按调用次序返回预置判定
    struct VerdictScript(Mutex<Vec<Verdict>>);

    #[async_trait]
    impl ReasoningBackend for VerdictScript {
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
            let mut script = self.0.lock().unwrap();
            let verdict = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0]
            };
            Ok(EvaluationResult::new(verdict, format!("{verdict:?}")).with_feedback("try again"))
        }

        async fn assess_feasibility(
            &self,
            _failures: &[String],
        ) -> Result<ImpossibilityAnalysis, BackendError> {
            Err(BackendError::Llm("unused".to_string()))
        }
    }

    struct CountingBackend(AtomicU32);

    #[async_trait]
    impl ExecutionBackend for CountingBackend {
        async fn run(&self, _step: &PlanStep) -> Result<ExecutionResult, BackendError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult::succeeded("out"))
        }
    }

    fn engine(verdicts: Vec<Verdict>, max_attempts: u32) -> (ExecutionEngine, Arc<CountingBackend>) {
        let backend = Arc::new(CountingBackend(AtomicU32::new(0)));
        let evaluator = Arc::new(Evaluator::new(Arc::new(VerdictScript(Mutex::new(verdicts)))));
        let policy = RetryPolicy::new(
            max_attempts,
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
        .unwrap();
        (ExecutionEngine::new(backend.clone(), evaluator, policy), backend)
    }

    fn step() -> PlanStep {
        PlanStep::new(1, StepType::CodeExecution, "compute")
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let (engine, backend) = engine(vec![Verdict::Success], 3);
        let outcome = engine
            .execute_step_with_retry("t", 1, &step(), &CancellationToken::new())
            .await;
        match outcome {
            StepOutcome::Succeeded(record) => {
                assert_eq!(record.attempts, 1);
                assert_eq!(record.output, "out");
                assert!(record.failure_history.is_empty());
            }
            other => panic!("Expected Succeeded, got {other:?}"),
        }
        assert_eq!(backend.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (engine, backend) = engine(vec![Verdict::RetryableFailure], 3);
        let outcome = engine
            .execute_step_with_retry("t", 1, &step(), &CancellationToken::new())
            .await;
        match outcome {
            StepOutcome::Failed(failure) => {
                assert_eq!(failure.attempts_made, 3);
                assert_eq!(failure.history.len(), 3);
                assert_eq!(failure.feedback.len(), 3);
                assert_eq!(
                    failure.to_error(),
                    OrchestratorError::Execution {
                        step_order: 1,
                        attempts: 3
                    }
                );
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
        assert_eq!(backend.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_stops_immediately() {
        let (engine, backend) = engine(vec![Verdict::TerminalFailure], 5);
        let outcome = engine
            .execute_step_with_retry("t", 1, &step(), &CancellationToken::new())
            .await;
        match outcome {
            StepOutcome::Failed(failure) => {
                assert_eq!(failure.attempts_made, 1);
                assert_eq!(failure.verdict, Verdict::TerminalFailure);
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
        assert_eq!(backend.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_impossible_signal_stops_immediately() {
        let (engine, _backend) = engine(
            vec![Verdict::RetryableFailure, Verdict::ImpossibleSignal],
            5,
        );
        let outcome = engine
            .execute_step_with_retry("t", 1, &step(), &CancellationToken::new())
            .await;
        match outcome {
            StepOutcome::Failed(failure) => {
                assert_eq!(failure.attempts_made, 2);
                assert_eq!(failure.verdict, Verdict::ImpossibleSignal);
                assert_eq!(failure.history.len(), 2);
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let (engine, backend) = engine(vec![Verdict::Success], 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine.execute_step_with_retry("t", 1, &step(), &cancel).await;
        assert_eq!(outcome, StepOutcome::Cancelled { attempts_made: 0 });
        assert_eq!(backend.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_evaluation_error_is_failed_attempt_not_cancellation() {
        assert!(settle_evaluation(Err(OrchestratorError::Cancelled)).is_none());

        let settled = settle_evaluation(Err(OrchestratorError::Config("judge offline".to_string())))
            .unwrap();
        assert_eq!(settled.verdict, Verdict::RetryableFailure);
        assert!(settled.explanation.contains("judge offline"));

        let ok = EvaluationResult::new(Verdict::Success, "fine");
        assert_eq!(settle_evaluation(Ok(ok)).unwrap().verdict, Verdict::Success);
    }
}
