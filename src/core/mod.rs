//! 核心编排层：计划、重试、评估、单步执行引擎、任务状态机、主控循环与任务监管

pub mod builder;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod orchestrator;
pub mod plan;
pub mod planner;
pub mod retry;
pub mod state;
pub mod supervisor;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use engine::{ExecutionEngine, StepFailure, StepOutcome};
pub use error::OrchestratorError;
pub use evaluator::{classify_locally, EvaluationResult, Evaluator, ImpossibilityAnalysis, Verdict};
pub use events::OrchestratorEvent;
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use plan::{ExecutionPlan, ExecutionResult, PlanStep, StepType};
pub use planner::{plan_issues, PlanIssue, Planner};
pub use retry::{RetryContext, RetryPolicy};
pub use state::{StepRecord, Task, TaskId, TaskReport, TaskStatus};
pub use supervisor::TaskSupervisor;
