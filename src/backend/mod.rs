//! 外部协作方边界：推理后端、执行后端、文件工作区、能力声明
//!
//! 核心只依赖这里的 trait；具体适配器（LLM 推理、本地沙箱、本地工作区）在子模块中。

pub mod reasoning;
pub mod sandbox;
pub mod tools;
pub mod workspace;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{EvaluationResult, ExecutionPlan, ExecutionResult, ImpossibilityAnalysis, PlanStep};

pub use reasoning::LlmReasoningBackend;
pub use sandbox::LocalSandbox;
pub use tools::{Capability, ToolSet};
pub use workspace::{FileId, LocalWorkspace};

/// 后端错误：在核心内被吸收为失败的 ExecutionResult 或 Planning 错误，不会越过 Orchestrator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Backend timeout: {0}")]
    Timeout(String),

    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

/// 推理后端：提出计划、判定单次结果、提出修订计划、判断任务可行性
///
/// 返回的结构可能为空或畸形，调用方必须校验。
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn propose_plan(&self, request: &str) -> Result<Vec<PlanStep>, BackendError>;

    async fn propose_refinement(
        &self,
        plan: &ExecutionPlan,
        feedback: &str,
        request: &str,
    ) -> Result<Vec<PlanStep>, BackendError>;

    async fn judge(
        &self,
        step: &PlanStep,
        result: &ExecutionResult,
    ) -> Result<EvaluationResult, BackendError>;

    async fn assess_feasibility(
        &self,
        failures: &[String],
    ) -> Result<ImpossibilityAnalysis, BackendError>;
}

/// 执行后端：对一个步骤执行一次；“仍在运行”的等待完全在实现内部完成
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn run(&self, step: &PlanStep) -> Result<ExecutionResult, BackendError>;
}

/// 文件工作区：持久化脚本、上传/下载产物、清理；文件以不透明 FileId 引用
///
/// 脚本与上传文件归属调用方分配的 scope，互不覆盖；`cleanup` 只删除一个 scope。
#[async_trait]
pub trait Workspace: Send + Sync {
    async fn persist_script(
        &self,
        scope: &str,
        name: &str,
        content: &str,
    ) -> Result<FileId, BackendError>;

    async fn upload(&self, scope: &str, local: &Path) -> Result<FileId, BackendError>;

    async fn download(&self, id: &FileId, dest: &Path) -> Result<PathBuf, BackendError>;

    async fn read(&self, id: &FileId) -> Result<String, BackendError>;

    async fn write(&self, id: &FileId, content: &str) -> Result<(), BackendError>;

    /// 工作区内文件的本地路径（供执行器运行脚本）
    fn resolve(&self, id: &FileId) -> Result<PathBuf, BackendError>;

    fn root(&self) -> &Path;

    async fn cleanup(&self, scope: &str) -> Result<(), BackendError>;
}
