//! 任务状态机与任务快照
//!
//! Task 只由 Orchestrator 持有并写入；终态后归档为可序列化的 TaskReport。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ExecutionPlan, OrchestratorError, PlanStep};

/// 任务 ID（UUID v4 字符串）
pub type TaskId = String;

/// 任务状态
///
/// `Pending -> Planning -> Executing -> Evaluating -> {Executing | Completed | Failed | Impossible | Planning}`；
/// `Failed` 与 `Cancelled` 可从任意非终态进入；四个终态均为吸收态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    Evaluating,
    Completed,
    Failed,
    Impossible,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Impossible | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) | (_, Failed) => true,
            (Pending, Planning) => true,
            (Planning, Executing) => true,
            (Executing, Evaluating) => true,
            (Evaluating, Executing | Completed | Impossible | Planning) => true,
            _ => false,
        }
    }
}

/// 已结束步骤的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub plan_version: u32,
    pub order: u32,
    pub succeeded: bool,
    pub attempts: u32,
    pub output: String,
    /// 成功或失败时刻的失败历史
    pub failure_history: Vec<String>,
}

/// 单个用户请求对应的任务
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    request: String,
    status: TaskStatus,
    steps: Vec<PlanStep>,
    failures: Vec<String>,
    plans: Vec<ExecutionPlan>,
    records: Vec<StepRecord>,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.into(),
            status: TaskStatus::Pending,
            steps: Vec::new(),
            failures: Vec::new(),
            plans: Vec::new(),
            records: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn plans(&self) -> &[ExecutionPlan] {
        &self.plans
    }

    pub fn current_plan(&self) -> Option<&ExecutionPlan> {
        self.plans.last()
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// 校验后迁移；非法迁移（含终态之后的任何迁移）返回 InvalidTransition
    pub fn transition(&mut self, next: TaskStatus) -> Result<TaskStatus, OrchestratorError> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition { from, to: next });
        }
        self.status = next;
        Ok(from)
    }

    /// 采纳新版本计划：步骤被替换，历史版本保留
    pub fn adopt_plan(&mut self, plan: ExecutionPlan) {
        self.steps = plan.steps().to_vec();
        self.plans.push(plan);
    }

    pub fn record_step(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    pub fn extend_failures(&mut self, failures: impl IntoIterator<Item = String>) {
        self.failures.extend(failures);
    }

    /// 归档为报告
    pub fn into_report(self, explanation: Option<String>, error: Option<OrchestratorError>) -> TaskReport {
        TaskReport {
            id: self.id,
            request: self.request,
            status: self.status,
            explanation,
            error: error.map(|e| e.to_string()),
            plans: self.plans,
            steps: self.records,
            failures: self.failures,
            created_at: self.created_at,
            finished_at: Utc::now(),
        }
    }
}

/// 终态任务的归档视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub request: String,
    pub status: TaskStatus,
    /// 失败/不可能时的结构化说明
    pub explanation: Option<String>,
    pub error: Option<String>,
    pub plans: Vec<ExecutionPlan>,
    pub steps: Vec<StepRecord>,
    pub failures: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskReport {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
