//! 能力声明：执行后端在一次会话内被允许使用的能力集合
//!
//! 由配置 `[sandbox].capabilities` 构建一次；步骤类型映射到所需能力，未声明的能力一律拒绝。

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::StepType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CodeExecution,
    FileRead,
    FileWrite,
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "code_execution" => Ok(Capability::CodeExecution),
            "file_read" => Ok(Capability::FileRead),
            "file_write" => Ok(Capability::FileWrite),
            other => Err(format!("Unknown capability: {other}")),
        }
    }
}

impl Capability {
    /// 步骤所需能力；Analysis / UserInput 不需要执行后端能力
    pub fn required_by(step_type: StepType) -> Option<Capability> {
        match step_type {
            StepType::CodeExecution => Some(Capability::CodeExecution),
            StepType::FileRead => Some(Capability::FileRead),
            StepType::FileWrite => Some(Capability::FileWrite),
            StepType::Analysis | StepType::UserInput | StepType::Unknown => None,
        }
    }
}

/// 能力集合
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    capabilities: HashSet<Capability>,
}

impl ToolSet {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// 全部能力
    pub fn all() -> Self {
        Self::new([
            Capability::CodeExecution,
            Capability::FileRead,
            Capability::FileWrite,
        ])
    }

    /// 从配置字符串构建；无法识别的名字记 warn 并忽略
    pub fn from_names(names: &[String]) -> Self {
        let capabilities = names
            .iter()
            .filter_map(|n| match n.parse::<Capability>() {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!("{}", e);
                    None
                }
            })
            .collect();
        Self { capabilities }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn permits(&self, step_type: StepType) -> bool {
        match Capability::required_by(step_type) {
            Some(c) => self.contains(c),
            None => true,
        }
    }

    /// 供 prompt 使用的能力描述
    pub fn describe(&self) -> String {
        let mut names: Vec<&str> = self
            .capabilities
            .iter()
            .map(|c| match c {
                Capability::CodeExecution => "code_execution",
                Capability::FileRead => "file_read",
                Capability::FileWrite => "file_write",
            })
            .collect();
        names.sort_unstable();
        names.join(", ")
    }
}
