//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 按系统提示词要求的 JSON 形状作答：计划返回单个 analysis 步骤，判定跟随执行结果的 success 字段，
//! 可行性分析总是回答“可行”。

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let system = messages
            .iter()
            .find(|m| matches!(m.role, Role::System))
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let reply = if system.contains("\"is_impossible\"") {
            json!({
                "is_impossible": false,
                "explanation": "Mock: failures look recoverable"
            })
        } else if system.contains("\"verdict\"") {
            let succeeded = last_user.contains("\"success\":true");
            json!({
                "verdict": if succeeded { "success" } else { "retryable_failure" },
                "explanation": format!("Mock: execution {}", if succeeded { "succeeded" } else { "failed" }),
            })
        } else {
            json!({
                "steps": [{
                    "order": 1,
                    "step_type": "analysis",
                    "description": format!("Mock analysis of: {}", last_user),
                }]
            })
        };
        Ok(reply.to_string())
    }
}
