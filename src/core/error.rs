//! 编排错误类型
//!
//! 每个变体只携带自身保证存在的字段；`Cancelled` 只是内部控制信号，
//! Orchestrator 会把它转成 `TaskStatus::Cancelled`，不会当作失败上报。

use thiserror::Error;

use crate::core::TaskStatus;

/// 编排过程中可能出现的错误（规划失败、步骤重试耗尽、任务不可能、超时、非法状态迁移等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// 后端给不出合法计划，或本地校验拒绝了计划
    #[error("Planning failed for request {request:?}: {reason}")]
    Planning { request: String, reason: String },

    /// 某一步的重试预算已耗尽（或被判定为不可重试）
    #[error("Step {step_order} failed after {attempts} attempt(s)")]
    Execution { step_order: u32, attempts: u32 },

    /// 不可能性分析确认任务无法完成
    #[error("Task is impossible: {explanation}")]
    Impossible {
        explanation: String,
        failures: Vec<String>,
    },

    #[error("Run timed out after {secs}s")]
    RunTimeout { secs: u64 },

    #[error("Invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}

impl OrchestratorError {
    pub fn planning(request: &str, reason: impl Into<String>) -> Self {
        Self::Planning {
            request: request.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
