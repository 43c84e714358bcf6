//! 计划与执行结果数据类型
//!
//! ExecutionPlan 一经构造即不可变；重规划通过 `refined_from` 产生新版本，原计划保持原样，便于对比诊断。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 步骤类型；`Unknown` 仅用于承接后端返回的无法识别的类型，校验时会被拒绝
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    CodeExecution,
    FileRead,
    FileWrite,
    Analysis,
    UserInput,
    #[serde(other)]
    Unknown,
}

impl StepType {
    pub fn is_recognized(&self) -> bool {
        !matches!(self, StepType::Unknown)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::CodeExecution => write!(f, "code_execution"),
            StepType::FileRead => write!(f, "file_read"),
            StepType::FileWrite => write!(f, "file_write"),
            StepType::Analysis => write!(f, "analysis"),
            StepType::UserInput => write!(f, "user_input"),
            StepType::Unknown => write!(f, "unknown"),
        }
    }
}

/// 计划中的单个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// 执行顺序（从 1 开始，连续且不重复）
    pub order: u32,
    pub step_type: StepType,
    /// 自然语言描述（步骤意图）
    pub description: String,
    /// 后端专用参数，对核心不透明
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl PlanStep {
    pub fn new(order: u32, step_type: StepType, description: impl Into<String>) -> Self {
        Self {
            order,
            step_type,
            description: description.into(),
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// 读取字符串参数（如 `code`、`path`、`content`、`command`）
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// 有序步骤序列；版本号从 1 开始，每次重规划 +1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    id: String,
    version: u32,
    parent_id: Option<String>,
    steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: 1,
            parent_id: None,
            steps,
        }
    }

    /// 基于原计划产生新版本；原计划不变
    pub fn refined_from(original: &ExecutionPlan, steps: Vec<PlanStep>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: original.version + 1,
            parent_id: Some(original.id.clone()),
            steps,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 编号列表形式，供 prompt 与日志使用
    pub fn outline(&self) -> String {
        self.steps
            .iter()
            .map(|s| format!("{}. [{}] {}", s.order, s.step_type, s.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 单次尝试的执行结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    /// 产出文件的不透明标识
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl ExecutionResult {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            artifacts: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            artifacts: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_artifact(mut self, file_id: impl Into<String>) -> Self {
        self.artifacts.push(file_id.into());
        self
    }

    /// 错误信息（无错误时为空串）
    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}
