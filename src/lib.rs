//! Pev - Plan / Execute / Evaluate 任务编排引擎
//!
//! 模块划分：
//! - **backend**: 外部协作方边界（推理后端、执行后端、工作区、能力声明）与本地适配器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 计划校验、带退避的单步重试、评估、任务状态机、主控循环、任务监管
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: tracing 初始化

pub mod backend;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;

pub use crate::core::{Orchestrator, OrchestratorBuilder, TaskReport, TaskStatus, TaskSupervisor};
