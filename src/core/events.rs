//! 编排过程事件：用于 CLI / 前端展示状态迁移、尝试、判定与退避

use serde::Serialize;

use crate::core::{TaskStatus, Verdict};

/// 单个事件（可序列化为 JSON 行）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// 任务状态迁移
    StatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// 采纳了一个（新版本的）计划
    PlanAdopted {
        task_id: String,
        version: u32,
        outline: String,
    },
    AttemptStarted {
        task_id: String,
        step: u32,
        attempt: u32,
    },
    /// 单次尝试的判定
    AttemptEvaluated {
        task_id: String,
        step: u32,
        attempt: u32,
        verdict: Verdict,
        explanation: String,
    },
    /// 进入退避等待
    Backoff {
        task_id: String,
        step: u32,
        delay_ms: u64,
    },
    /// 开始第 round 轮重规划
    Refining {
        task_id: String,
        round: u32,
        feedback: String,
    },
    Finished {
        task_id: String,
        status: TaskStatus,
        explanation: Option<String>,
    },
}

pub(crate) fn send_event(
    tx: &Option<tokio::sync::mpsc::UnboundedSender<OrchestratorEvent>>,
    ev: OrchestratorEvent,
) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
