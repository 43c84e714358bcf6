//! Pev 命令行入口
//!
//! `pev <request...>`，无参数时从 stdin 读取请求；`PEV_CONFIG` 指定额外配置文件。
//! 事件逐行以 JSON 输出到 stdout，结束时输出 TaskReport；非 Completed 时退出码为 1。

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use pev::core::{create_orchestrator_builder, OrchestratorEvent};
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    pev::observability::init();

    let request = read_request().await?;
    if request.is_empty() {
        anyhow::bail!("empty request: pass it as arguments or on stdin");
    }

    let config_path = std::env::var("PEV_CONFIG").ok().map(PathBuf::from);
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<OrchestratorEvent>();
    let supervisor = create_orchestrator_builder(config_path)
        .with_event_sender(event_tx)
        .build_supervisor()
        .context("Failed to build orchestrator")?;
    supervisor.install_signal_handlers();

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            }
        }
    });

    let (_, handle) = supervisor.spawn(request).await;
    let report = handle.await.context("Task panicked")?;

    // 释放 Orchestrator（及其事件发送端），让打印任务读完剩余事件后退出
    drop(supervisor);
    printer.await.ok();

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to encode report")?
    );

    Ok(if report.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn read_request() -> anyhow::Result<String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        return Ok(args.join(" ").trim().to_string());
    }
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read request from stdin")?;
    Ok(input.trim().to_string())
}
