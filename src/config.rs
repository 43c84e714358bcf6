//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PEV__*` 覆盖（双下划线表示嵌套，如 `PEV__ORCHESTRATOR__MAX_ATTEMPTS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub sandbox: SandboxSection,
    pub supervisor: SupervisorSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱工作目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmDeepSeekSection,
    #[serde(default)]
    pub openai: LlmOpenAiSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            deepseek: LlmDeepSeekSection::default(),
            openai: LlmOpenAiSection::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmDeepSeekSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmOpenAiSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次推理请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// [orchestrator] 段：每步最大尝试次数、退避、整体超时、重规划预算
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 退避基数（毫秒），第 n 次失败后等待 base * 2^(n-1)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 退避上限（毫秒）
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// 整个任务的运行超时（秒）
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// 每个任务最多重规划几轮
    #[serde(default = "default_max_refinements")]
    pub max_refinements: u32,
    #[serde(default = "default_refinement_enabled")]
    pub refinement_enabled: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_run_timeout_secs() -> u64 {
    600
}

fn default_max_refinements() -> u32 {
    2
}

fn default_refinement_enabled() -> bool {
    true
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            run_timeout_secs: default_run_timeout_secs(),
            max_refinements: default_max_refinements(),
            refinement_enabled: default_refinement_enabled(),
        }
    }
}

/// [sandbox] 段：本地执行后端（解释器、轮询间隔、单步超时、命令白名单、能力声明）
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    /// CodeExecution 步骤的脚本解释器
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// 脚本文件扩展名
    #[serde(default = "default_script_extension")]
    pub script_extension: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// 允许执行的命令名（仅首词，如 ls、grep、python3）
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    /// 执行后端可使用的能力：code_execution / file_read / file_write
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_script_extension() -> String {
    "py".to_string()
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_step_timeout_secs() -> u64 {
    120
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "grep".into(),
        "sort".into(),
        "python3".into(),
    ]
}

fn default_capabilities() -> Vec<String> {
    vec![
        "code_execution".into(),
        "file_read".into(),
        "file_write".into(),
    ]
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            script_extension: default_script_extension(),
            poll_interval_ms: default_poll_interval_ms(),
            step_timeout_secs: default_step_timeout_secs(),
            allowed_commands: default_allowed_commands(),
            capabilities: default_capabilities(),
        }
    }
}

/// [supervisor] 段：同时运行的任务数上限
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 PEV__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PEV__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PEV")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("sandbox.allowed_commands")
            .with_list_parse_key("sandbox.capabilities")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
