//! agent-daemon - 本地 agent 会话守护进程
//!
//! 负责：
//! - 启动/继续/中断 agent 会话
//! - 审批关联与决定
//! - 事件推送

use std::sync::Arc;

use ai_agent_daemon::{is_daemon_running, Daemon, DaemonConfig};
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ai_agent_daemon=info".parse()?))
        .init();

    tracing::info!("🚀 agent-daemon v{}", env!("CARGO_PKG_VERSION"));

    // 解析配置
    let config = DaemonConfig::from_env();
    tracing::debug!("Config: {:?}", config);

    // 检查是否已有 Daemon 运行
    if is_daemon_running(&config.pid_path()) {
        tracing::error!("❌ Daemon is already running, exiting");
        std::process::exit(1);
    }

    // 创建并运行 Daemon
    let daemon = Arc::new(Daemon::new(config)?);
    daemon.run().await?;

    tracing::info!("👋 agent-daemon exiting");
    Ok(())
}
