//! 编排器构建器：从 AppConfig 统一装配 Planner / Evaluator / ExecutionEngine / Orchestrator
//!
//! 推理与执行后端可显式注入（测试、嵌入方），未注入时按配置创建 LLM 推理后端与本地沙箱。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::backend::{
    ExecutionBackend, LlmReasoningBackend, LocalSandbox, LocalWorkspace, ReasoningBackend, ToolSet,
    Workspace,
};
use crate::config::AppConfig;
use crate::core::{
    Evaluator, ExecutionEngine, Orchestrator, OrchestratorError, OrchestratorEvent,
    OrchestratorSettings, Planner, RetryPolicy, TaskSupervisor,
};

pub struct OrchestratorBuilder {
    config: AppConfig,
    workspace: PathBuf,
    reasoning: Option<Arc<dyn ReasoningBackend>>,
    execution: Option<Arc<dyn ExecutionBackend>>,
    event_tx: Option<UnboundedSender<OrchestratorEvent>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            reasoning: None,
            execution: None,
            event_tx: None,
        }
    }

    pub fn with_reasoning(mut self, backend: Arc<dyn ReasoningBackend>) -> Self {
        self.reasoning = Some(backend);
        self
    }

    pub fn with_execution(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.execution = Some(backend);
        self
    }

    pub fn with_event_sender(mut self, tx: UnboundedSender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 本次会话声明的能力
    pub fn build_tool_set(&self) -> ToolSet {
        ToolSet::from_names(&self.config.sandbox.capabilities)
    }

    pub fn build_reasoning(&self) -> Arc<dyn ReasoningBackend> {
        if let Some(backend) = &self.reasoning {
            return Arc::clone(backend);
        }
        let llm = crate::llm::create_llm_from_config(&self.config);
        Arc::new(LlmReasoningBackend::new(
            llm,
            &self.build_tool_set(),
            Duration::from_secs(self.config.llm.timeouts.request),
        ))
    }

    pub fn build_execution(&self) -> Result<Arc<dyn ExecutionBackend>, OrchestratorError> {
        if let Some(backend) = &self.execution {
            return Ok(Arc::clone(backend));
        }
        let workspace = LocalWorkspace::new(&self.workspace).map_err(|e| {
            OrchestratorError::Config(format!(
                "workspace {} unavailable: {}",
                self.workspace.display(),
                e
            ))
        })?;
        tracing::info!(root = %workspace.root().display(), "sandbox workspace ready");
        Ok(Arc::new(LocalSandbox::new(
            Arc::new(workspace),
            self.build_tool_set(),
            &self.config.sandbox,
        )))
    }

    pub fn build(&self) -> Result<Orchestrator, OrchestratorError> {
        let reasoning = self.build_reasoning();
        let execution = self.build_execution()?;
        let policy = RetryPolicy::from_config(&self.config.orchestrator)?;

        let evaluator = Arc::new(Evaluator::new(Arc::clone(&reasoning)));
        let planner = Planner::new(reasoning);
        let engine = ExecutionEngine::new(execution, Arc::clone(&evaluator), policy);
        let orchestrator = Orchestrator::new(
            planner,
            engine,
            evaluator,
            OrchestratorSettings::from_config(&self.config.orchestrator),
        );

        Ok(match &self.event_tx {
            Some(tx) => orchestrator.with_event_sender(tx.clone()),
            None => orchestrator,
        })
    }

    /// 构建带并发上限的任务监管器
    pub fn build_supervisor(&self) -> Result<TaskSupervisor, OrchestratorError> {
        Ok(TaskSupervisor::new(
            Arc::new(self.build()?),
            self.config.supervisor.max_concurrent_tasks,
        ))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

/// 便捷函数：加载配置（失败时用默认值）并确定工作目录
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let workspace = config.app.workspace_root.clone().unwrap_or_else(|| {
        std::env::current_dir()
            .map(|d| d.join("workspace"))
            .unwrap_or_else(|_| PathBuf::from("workspace"))
    });

    OrchestratorBuilder::new(config, workspace)
}
