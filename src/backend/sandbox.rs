//! 本地沙箱执行后端
//!
//! - CodeExecution：`code` 参数写成脚本后用配置的解释器运行；或 `command` 参数经白名单校验后用 sh -c 运行。
//!   每次运行使用独立的工作区 scope：`inputs`（本地路径数组）先上传，目录经 `PEV_INPUT_DIR` 告知进程；
//!   成功后按 `outputs`（工作区 FileId -> 本地路径）下载产物；结束后清理该 scope
//! - FileRead / FileWrite：经工作区读写（`path`、`content` 参数）
//! - Analysis：无可执行内容，直接把描述作为输出交给评估
//! - UserInput：本后端无法提供用户输入，返回失败结果
//!
//! 子进程启动后按 poll_interval 轮询其句柄直到退出或超时；每次执行输出一条 JSON 审计日志。

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::backend::{BackendError, ExecutionBackend, FileId, ToolSet, Workspace};
use crate::config::SandboxSection;
use crate::core::{ExecutionResult, PlanStep, StepType};

/// 禁止的命令子串（即使命令名在白名单中）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 输出保留的最大字符数
const MAX_OUTPUT_CHARS: usize = 8_000;

pub struct LocalSandbox {
    workspace: Arc<dyn Workspace>,
    tools: ToolSet,
    interpreter: String,
    script_extension: String,
    allowed_commands: HashSet<String>,
    poll_interval: Duration,
    step_timeout: Duration,
}

impl LocalSandbox {
    pub fn new(workspace: Arc<dyn Workspace>, tools: ToolSet, cfg: &SandboxSection) -> Self {
        Self {
            workspace,
            tools,
            interpreter: cfg.interpreter.clone(),
            script_extension: cfg.script_extension.trim_start_matches('.').to_string(),
            allowed_commands: cfg
                .allowed_commands
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            step_timeout: Duration::from_secs(cfg.step_timeout_secs),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    fn check_command(&self, raw: &str) -> Result<(), BackendError> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(BackendError::NotPermitted(format!(
                    "forbidden pattern: {}",
                    forbidden
                )));
            }
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err(BackendError::NotPermitted("empty command".to_string()));
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(BackendError::NotPermitted(format!(
                "command '{}' not in allowlist",
                name
            )))
        }
    }

    /// 每次运行分配独立 scope：脚本与上传文件互不覆盖，结束后无论成败都清理
    async fn run_code(&self, step: &PlanStep) -> Result<ExecutionResult, BackendError> {
        let scope = uuid::Uuid::new_v4().simple().to_string();
        let result = self.run_code_in(&scope, step).await;
        if let Err(e) = self.workspace.cleanup(&scope).await {
            tracing::warn!(scope = %scope, error = %e, "workspace cleanup failed");
        }
        result
    }

    async fn run_code_in(
        &self,
        scope: &str,
        step: &PlanStep,
    ) -> Result<ExecutionResult, BackendError> {
        let mut inputs = Vec::new();
        for local in string_list(step, "inputs") {
            inputs.push(self.workspace.upload(scope, Path::new(local)).await?);
        }

        let mut cmd = if let Some(command) = step.param_str("command") {
            let command = command.trim();
            self.check_command(command)?;
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        } else {
            let code = step.param_str("code").ok_or_else(|| {
                BackendError::MalformedResponse(format!(
                    "step {} has neither 'code' nor 'command' parameter",
                    step.order
                ))
            })?;
            let name = format!("step_{}.{}", step.order, self.script_extension);
            let script = self.workspace.persist_script(scope, &name, code).await?;
            let path = self.workspace.resolve(&script)?;
            let mut c = Command::new(&self.interpreter);
            c.arg(path);
            c
        };
        cmd.current_dir(self.workspace.root())
            .env(
                "PEV_INPUT_DIR",
                self.workspace.root().join("uploads").join(scope),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| BackendError::Process(format!("spawn failed: {}", e)))?;
        let mut result = self.wait_for_exit(child).await?;
        if !result.success {
            return Ok(result);
        }

        for id in &inputs {
            result = result.with_artifact(id.as_str());
        }
        if let Some(outputs) = step.parameters.get("outputs").and_then(|v| v.as_object()) {
            for (file, dest) in outputs {
                let Some(dest) = dest.as_str() else {
                    continue;
                };
                let id = FileId::new(file.as_str());
                self.workspace.download(&id, Path::new(dest)).await?;
                result = result.with_artifact(id.as_str());
            }
        }
        Ok(result)
    }

    /// 轮询子进程直到退出；超时则 kill 并返回 Timeout
    ///
    /// 输出收集同样受步骤期限约束：后台孙进程占住管道时不会无限等待。
    async fn wait_for_exit(&self, mut child: Child) -> Result<ExecutionResult, BackendError> {
        let stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf).await;
                buf
            })
        });

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() >= self.step_timeout {
                let _ = child.kill().await;
                return Err(BackendError::Timeout(format!(
                    "process still running after {}s",
                    self.step_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        let remaining = self
            .step_timeout
            .saturating_sub(start.elapsed())
            .max(self.poll_interval);
        let deadline = tokio::time::Instant::now() + remaining;
        let stdout = collect_output(stdout_task, deadline).await;
        let stderr = collect_output(stderr_task, deadline).await;
        let stdout = truncate(String::from_utf8_lossy(&stdout).trim());
        let stderr = truncate(String::from_utf8_lossy(&stderr).trim());

        if status.success() {
            let output = if stderr.is_empty() {
                stdout
            } else {
                format!("{}\nstderr: {}", stdout, stderr)
            };
            Ok(ExecutionResult::succeeded(output))
        } else {
            Ok(ExecutionResult::failed(format!("exit {:?}: {}", status.code(), stderr))
                .with_output(stdout))
        }
    }

    async fn read_file(&self, step: &PlanStep) -> Result<ExecutionResult, BackendError> {
        let path = step.param_str("path").ok_or_else(|| {
            BackendError::MalformedResponse(format!("step {} is missing 'path'", step.order))
        })?;
        let id = FileId::new(path);
        let content = self.workspace.read(&id).await?;
        Ok(ExecutionResult::succeeded(truncate(&content)).with_artifact(id.as_str()))
    }

    async fn write_file(&self, step: &PlanStep) -> Result<ExecutionResult, BackendError> {
        let path = step.param_str("path").ok_or_else(|| {
            BackendError::MalformedResponse(format!("step {} is missing 'path'", step.order))
        })?;
        let content = step.param_str("content").unwrap_or_default();
        let id = FileId::new(path);
        self.workspace.write(&id, content).await?;
        Ok(
            ExecutionResult::succeeded(format!("wrote {} bytes to {}", content.len(), id))
                .with_artifact(id.as_str()),
        )
    }
}

#[async_trait]
impl ExecutionBackend for LocalSandbox {
    async fn run(&self, step: &PlanStep) -> Result<ExecutionResult, BackendError> {
        if !self.tools.permits(step.step_type) {
            return Err(BackendError::NotPermitted(format!(
                "capability for {} steps is not declared",
                step.step_type
            )));
        }

        let start = Instant::now();
        let result = match step.step_type {
            StepType::CodeExecution => self.run_code(step).await,
            StepType::FileRead => self.read_file(step).await,
            StepType::FileWrite => self.write_file(step).await,
            StepType::Analysis => Ok(ExecutionResult::succeeded(format!(
                "analysis: {}",
                step.description
            ))),
            StepType::UserInput => Ok(ExecutionResult::failed(
                "step requires user input, which the local sandbox cannot provide",
            )),
            StepType::Unknown => Err(BackendError::NotPermitted(
                "unrecognized step type".to_string(),
            )),
        };

        let outcome = match &result {
            Ok(r) if r.success => "ok",
            Ok(_) => "failed",
            Err(BackendError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "sandbox_audit",
            "step": step.order,
            "step_type": step.step_type.to_string(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "sandbox");

        result
    }
}

/// 在期限内取回管道输出；超时放弃读取并返回空
async fn collect_output(
    task: Option<JoinHandle<Vec<u8>>>,
    deadline: tokio::time::Instant,
) -> Vec<u8> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            tracing::warn!("pipe still held open after process exit, output dropped");
            task.abort();
            Vec::new()
        }
    }
}

/// 参数中的字符串数组（缺失或类型不符时为空）
fn string_list<'a>(step: &'a PlanStep, key: &str) -> Vec<&'a str> {
    step.parameters
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default()
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_OUTPUT_CHARS {
        format!("{}...", s.chars().take(MAX_OUTPUT_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Capability, LocalWorkspace};

    fn sandbox(dir: &std::path::Path, tools: ToolSet) -> LocalSandbox {
        let ws = Arc::new(LocalWorkspace::new(dir).unwrap());
        let cfg = SandboxSection {
            interpreter: "sh".to_string(),
            script_extension: "sh".to_string(),
            poll_interval_ms: 10,
            ..SandboxSection::default()
        };
        LocalSandbox::new(ws, tools, &cfg)
    }

    #[test]
    fn test_command_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::all());
        assert!(sb.check_command("ls -la").is_ok());
        assert!(sb.check_command("rm -rf /").is_err());
        assert!(sb.check_command("reboot").is_err());
        assert!(sb.check_command("   ").is_err());
    }

    #[tokio::test]
    async fn test_file_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::all());

        let write = PlanStep::new(1, StepType::FileWrite, "write numbers")
            .with_parameters(serde_json::json!({"path": "data/n.txt", "content": "1 2 3"}));
        let result = sb.run(&write).await.unwrap();
        assert!(result.success);
        assert_eq!(result.artifacts, vec!["data/n.txt".to_string()]);

        let read = PlanStep::new(2, StepType::FileRead, "read numbers")
            .with_parameters(serde_json::json!({"path": "data/n.txt"}));
        let result = sb.run(&read).await.unwrap();
        assert_eq!(result.output, "1 2 3");
    }

    #[tokio::test]
    async fn test_undeclared_capability_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::new([Capability::FileRead]));
        let step = PlanStep::new(1, StepType::CodeExecution, "run")
            .with_parameters(serde_json::json!({"code": "echo hi"}));
        let err = sb.run(&step).await.unwrap_err();
        assert!(matches!(err, BackendError::NotPermitted(_)));
    }

    #[tokio::test]
    async fn test_missing_code_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::all());
        let step = PlanStep::new(3, StepType::CodeExecution, "run nothing");
        let err = sb.run(&step).await.unwrap_err();
        assert!(matches!(err, BackendError::MalformedResponse(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_runs_with_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::all());
        let step = PlanStep::new(1, StepType::CodeExecution, "print")
            .with_parameters(serde_json::json!({"code": "echo hello"}));
        let result = sb.run(&step).await.unwrap();
        assert!(result.success, "{:?}", result);
        assert_eq!(result.output, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::all());
        let step = PlanStep::new(1, StepType::CodeExecution, "fail")
            .with_parameters(serde_json::json!({"code": "echo boom >&2\nexit 3"}));
        let result = sb.run(&step).await.unwrap();
        assert!(!result.success);
        assert!(result.error_text().contains("Some(3)"));
        assert!(result.error_text().contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_long_running_process_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::all()).with_step_timeout(Duration::from_millis(100));
        let step = PlanStep::new(1, StepType::CodeExecution, "sleep")
            .with_parameters(serde_json::json!({"code": "sleep 5"}));
        let err = sb.run(&step).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }

    fn entries(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_same_order_steps_keep_own_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::all());
        // 脚本等待片刻后打印自身内容，若被另一次运行覆盖就会读到对方的标记
        let step_a = PlanStep::new(1, StepType::CodeExecution, "a")
            .with_parameters(serde_json::json!({"code": "sleep 0.3\ncat \"$0\"\n# TASK_A"}));
        let step_b = PlanStep::new(1, StepType::CodeExecution, "b")
            .with_parameters(serde_json::json!({"code": "sleep 0.3\ncat \"$0\"\n# TASK_B"}));

        let (a, b) = tokio::join!(sb.run(&step_a), sb.run(&step_b));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.output.contains("TASK_A") && !a.output.contains("TASK_B"), "{:?}", a);
        assert!(b.output.contains("TASK_B") && !b.output.contains("TASK_A"), "{:?}", b);
        assert_eq!(entries(&dir.path().join("scripts")), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_scope_removed_after_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::all());
        let step = PlanStep::new(2, StepType::CodeExecution, "fail")
            .with_parameters(serde_json::json!({"code": "exit 1"}));
        assert!(!sb.run(&step).await.unwrap().success);
        assert_eq!(entries(&dir.path().join("scripts")), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inputs_uploaded_and_outputs_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let input = local.path().join("in.txt");
        std::fs::write(&input, "7").unwrap();
        let export = local.path().join("exported").join("result.txt");

        let sb = sandbox(dir.path(), ToolSet::all());
        let step = PlanStep::new(1, StepType::CodeExecution, "copy input").with_parameters(
            serde_json::json!({
                "code": "cat \"$PEV_INPUT_DIR/in.txt\" > result.txt",
                "inputs": [input.to_str().unwrap()],
                "outputs": {"result.txt": export.to_str().unwrap()},
            }),
        );
        let result = sb.run(&step).await.unwrap();
        assert!(result.success, "{:?}", result);
        assert_eq!(std::fs::read_to_string(&export).unwrap(), "7");
        assert!(result.artifacts.iter().any(|a| a.starts_with("uploads/")));
        assert!(result.artifacts.contains(&"result.txt".to_string()));
        assert_eq!(entries(&dir.path().join("uploads")), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_child_holding_pipe_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), ToolSet::all()).with_step_timeout(Duration::from_millis(500));
        let step = PlanStep::new(1, StepType::CodeExecution, "detach")
            .with_parameters(serde_json::json!({"code": "sleep 5 &\necho started"}));

        let start = Instant::now();
        let result = sb.run(&step).await.unwrap();
        assert!(result.success, "{:?}", result);
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
