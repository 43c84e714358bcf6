//! Orchestrator：任务状态机与主控循环
//!
//! Planning -> (每步：Executing -> ExecutionEngine -> Evaluating) -> Completed；
//! 步骤失败后先做不可能性分析，再在重规划预算内请求新计划，否则 Failed。
//! 整个运行包在 run_timeout 内；取消在任意等待点生效，终态为 Cancelled，不计为失败。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorSection;
use crate::core::events::send_event;
use crate::core::{
    Evaluator, ExecutionEngine, ExecutionPlan, OrchestratorError, OrchestratorEvent, Planner,
    StepFailure, StepOutcome, StepRecord, Task, TaskReport, TaskStatus,
};

/// 编排参数（来自 [orchestrator] 配置段）
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_refinements: u32,
    pub refinement_enabled: bool,
    pub run_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &OrchestratorSection) -> Self {
        Self {
            max_refinements: cfg.max_refinements,
            refinement_enabled: cfg.refinement_enabled,
            run_timeout: Duration::from_secs(cfg.run_timeout_secs),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorSection::default())
    }
}

/// 主控循环的终局（内部使用，随后落到 TaskStatus）
enum Conclusion {
    Completed,
    Failed(OrchestratorError),
    Impossible { explanation: String },
    Cancelled,
}

impl From<OrchestratorError> for Conclusion {
    fn from(err: OrchestratorError) -> Self {
        if err.is_cancelled() {
            Conclusion::Cancelled
        } else {
            Conclusion::Failed(err)
        }
    }
}

pub struct Orchestrator {
    planner: Planner,
    engine: ExecutionEngine,
    evaluator: Arc<Evaluator>,
    settings: OrchestratorSettings,
    event_tx: Option<tokio::sync::mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl Orchestrator {
    pub fn new(
        planner: Planner,
        engine: ExecutionEngine,
        evaluator: Arc<Evaluator>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            planner,
            engine,
            evaluator,
            settings,
            event_tx: None,
        }
    }

    /// 设置事件推送通道（同时转给 ExecutionEngine）
    pub fn with_event_sender(
        mut self,
        tx: tokio::sync::mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> Self {
        self.engine = self.engine.with_event_sender(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn run(&self, request: &str, cancel: CancellationToken) -> TaskReport {
        self.run_task(Task::new(request), cancel).await
    }

    /// 运行一个已创建的任务直到终态
    pub async fn run_task(&self, mut task: Task, cancel: CancellationToken) -> TaskReport {
        tracing::info!(task_id = %task.id(), request = %task.request(), "task accepted");

        let driven =
            tokio::time::timeout(self.settings.run_timeout, self.drive(&mut task, &cancel)).await;
        let conclusion = match driven {
            Ok(conclusion) => conclusion,
            Err(_) => {
                tracing::error!(task_id = %task.id(), "run timed out");
                Conclusion::Failed(OrchestratorError::RunTimeout {
                    secs: self.settings.run_timeout.as_secs(),
                })
            }
        };

        self.conclude(task, conclusion)
    }

    async fn drive(&self, task: &mut Task, cancel: &CancellationToken) -> Conclusion {
        if cancel.is_cancelled() {
            return Conclusion::Cancelled;
        }
        if let Err(e) = self.transition(task, TaskStatus::Planning) {
            return e.into();
        }
        let mut plan = match self.planner.create_plan(task.request(), cancel).await {
            Ok(plan) => plan,
            Err(e) => return e.into(),
        };
        let mut rounds = 0u32;

        loop {
            let failure = match self.execute_plan(task, &plan, cancel).await {
                Ok(None) => return Conclusion::Completed,
                Ok(Some(failure)) => failure,
                Err(e) => return e.into(),
            };

            task.extend_failures(failure.history.iter().cloned());
            let analysis = match self
                .evaluator
                .analyze_impossibility(task.failures(), cancel)
                .await
            {
                Ok(analysis) => analysis,
                Err(e) => return e.into(),
            };
            if analysis.is_impossible {
                return Conclusion::Impossible {
                    explanation: analysis.explanation,
                };
            }

            if !self.settings.refinement_enabled || rounds >= self.settings.max_refinements {
                tracing::error!(
                    task_id = %task.id(),
                    step = failure.order,
                    attempts = failure.attempts_made,
                    rounds,
                    "step failed and refinement budget is exhausted"
                );
                return Conclusion::Failed(failure.to_error());
            }

            rounds += 1;
            let feedback = refinement_feedback(&failure, &analysis.explanation);
            tracing::warn!(task_id = %task.id(), round = rounds, "refining plan");
            send_event(
                &self.event_tx,
                OrchestratorEvent::Refining {
                    task_id: task.id().to_string(),
                    round: rounds,
                    feedback: feedback.clone(),
                },
            );
            if let Err(e) = self.transition(task, TaskStatus::Planning) {
                return e.into();
            }
            plan = match self
                .planner
                .refine_plan(&plan, &feedback, task.request(), cancel)
                .await
            {
                Ok(refined) => refined,
                Err(e) => return e.into(),
            };
        }
    }

    /// 依序执行计划的所有步骤；返回 None 表示全部成功，Some 为首个失败步骤
    async fn execute_plan(
        &self,
        task: &mut Task,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<Option<StepFailure>, OrchestratorError> {
        task.adopt_plan(plan.clone());
        send_event(
            &self.event_tx,
            OrchestratorEvent::PlanAdopted {
                task_id: task.id().to_string(),
                version: plan.version(),
                outline: plan.outline(),
            },
        );

        for step in plan.steps() {
            self.transition(task, TaskStatus::Executing)?;
            let outcome = self
                .engine
                .execute_step_with_retry(task.id(), plan.version(), step, cancel)
                .await;
            if let StepOutcome::Cancelled { .. } = outcome {
                return Err(OrchestratorError::Cancelled);
            }
            self.transition(task, TaskStatus::Evaluating)?;

            match outcome {
                StepOutcome::Succeeded(record) => {
                    tracing::info!(
                        task_id = %task.id(),
                        step = record.order,
                        attempts = record.attempts,
                        "step succeeded"
                    );
                    task.record_step(record);
                }
                StepOutcome::Failed(failure) => {
                    task.record_step(StepRecord {
                        plan_version: plan.version(),
                        order: failure.order,
                        succeeded: false,
                        attempts: failure.attempts_made,
                        output: String::new(),
                        failure_history: failure.history.clone(),
                    });
                    return Ok(Some(failure));
                }
                StepOutcome::Cancelled { .. } => return Err(OrchestratorError::Cancelled),
            }
        }
        Ok(None)
    }

    fn transition(&self, task: &mut Task, next: TaskStatus) -> Result<(), OrchestratorError> {
        let from = task.transition(next)?;
        tracing::info!(task_id = %task.id(), ?from, to = ?next, "status changed");
        send_event(
            &self.event_tx,
            OrchestratorEvent::StatusChanged {
                task_id: task.id().to_string(),
                from,
                to: next,
            },
        );
        Ok(())
    }

    /// 落到终态并归档
    fn conclude(&self, mut task: Task, conclusion: Conclusion) -> TaskReport {
        let (status, explanation, error) = match conclusion {
            Conclusion::Completed => (TaskStatus::Completed, None, None),
            Conclusion::Cancelled => (
                TaskStatus::Cancelled,
                Some("cancelled by caller".to_string()),
                None,
            ),
            Conclusion::Impossible { explanation } => {
                let error = OrchestratorError::Impossible {
                    explanation: explanation.clone(),
                    failures: task.failures().to_vec(),
                };
                (TaskStatus::Impossible, Some(explanation), Some(error))
            }
            Conclusion::Failed(error) => {
                (TaskStatus::Failed, Some(error.to_string()), Some(error))
            }
        };

        if let Err(e) = self.transition(&mut task, status) {
            // 迁移校验失败说明主控循环存在缺陷；仍以 Failed 归档
            tracing::error!(task_id = %task.id(), error = %e, "could not reach terminal status");
            let _ = self.transition(&mut task, TaskStatus::Failed);
        }

        tracing::info!(task_id = %task.id(), status = ?task.status(), "task finished");
        send_event(
            &self.event_tx,
            OrchestratorEvent::Finished {
                task_id: task.id().to_string(),
                status: task.status(),
                explanation: explanation.clone(),
            },
        );
        task.into_report(explanation, error)
    }
}

/// 汇总失败步骤的建议与历史，作为重规划输入
fn refinement_feedback(failure: &StepFailure, analysis: &str) -> String {
    let mut lines = vec![format!(
        "Step {} failed after {} attempt(s) ({:?}).",
        failure.order, failure.attempts_made, failure.verdict
    )];
    lines.extend(failure.history.iter().map(|h| format!("- {}", h)));
    let mut suggestions = failure.feedback.clone();
    suggestions.dedup();
    if !suggestions.is_empty() {
        lines.push("Suggestions:".to_string());
        lines.extend(suggestions.iter().map(|s| format!("- {}", s)));
    }
    lines.push(format!("Feasibility assessment: {}", analysis));
    lines.join("\n")
}
