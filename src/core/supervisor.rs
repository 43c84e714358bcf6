//! 任务监管：并发运行多个任务、按 ID 取消、信号关闭
//!
//! 每个任务拿到根 token 的子 token；Semaphore 限制同时运行的任务数。
//! 任务结束（任意终态，或运行中 panic）时自行从活跃表中注销。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{Orchestrator, Task, TaskId, TaskReport};

pub struct TaskSupervisor {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    root: CancellationToken,
    active: Arc<RwLock<HashMap<TaskId, CancellationToken>>>,
}

impl TaskSupervisor {
    pub fn new(orchestrator: Arc<Orchestrator>, max_concurrent_tasks: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            root: CancellationToken::new(),
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 提交一个请求；返回任务 ID 与最终报告的句柄
    ///
    /// 任务在取得并发许可前就已登记，排队期间同样可以取消。
    pub async fn spawn(&self, request: impl Into<String>) -> (TaskId, JoinHandle<TaskReport>) {
        let task = Task::new(request);
        let id = task.id().to_string();
        let token = self.root.child_token();
        self.active.write().await.insert(id.clone(), token.clone());

        let orchestrator = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            // 信号量只在 close() 时报错，这里从不关闭；报错时不限流直接运行
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            // 内层任务 panic 时同样注销，再把 panic 传给调用方的 JoinHandle
            let run = tokio::spawn(async move { orchestrator.run_task(task, token).await }).await;
            active.write().await.remove(&task_id);
            match run {
                Ok(report) => report,
                Err(e) => std::panic::resume_unwind(e.into_panic()),
            }
        });

        tracing::info!(task_id = %id, "task spawned");
        (id, handle)
    }

    /// 取消指定任务；任务不存在或已结束时返回 false
    pub async fn cancel(&self, id: &str) -> bool {
        match self.active.read().await.get(id) {
            Some(token) => {
                tracing::info!(task_id = %id, "cancelling task");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        tracing::info!("cancelling all tasks");
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub async fn active_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)：收到后取消全部任务
    pub fn install_signal_handlers(&self) {
        let root = self.root.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling running tasks...");
                root.cancel();
            }
        });

        #[cfg(unix)]
        {
            let root = self.root.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling running tasks...");
                    root.cancel();
                }
            });
        }
    }
}
