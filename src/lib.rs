//! ai-agent-daemon - 本地 agent 会话守护进程
//!
//! 以子进程方式运行 agent CLI（stream-json 模式），持久化会话与对话事件，
//! 把 MCP 权限回调产生的审批与对话中的工具调用关联起来，并通过 Unix Socket
//! 向客户端推送状态变化。
//!
//! # 核心功能
//!
//! - **会话状态机**: starting → running ⇄ waiting_input → completed / failed / interrupted
//! - **审批关联**: 审批与工具调用事件无论到达顺序都能关联
//! - **事件总线**: 有界、非阻塞的发布订阅
//! - **跳过审批**: 带过期时间，后台周期清理
//! - **Daemon 模式**: 单实例锁 + 孤儿会话回收 + 有序关闭

pub mod approval;
pub mod broadcaster;
pub mod claude;
pub mod config;
pub mod context;
pub mod daemon;
pub mod db;
pub mod error;
pub mod migrations;
pub mod monitor;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod types;

// Re-exports
pub use approval::{ApprovalManager, CreatedApproval, Decision, AUTO_APPROVE_COMMENT};
pub use broadcaster::{Broadcaster, Subscription, SubscriptionFilter};
pub use config::{DaemonConfig, DbConfig};
pub use context::{DaemonContext, RunLocks};
pub use daemon::{is_daemon_running, Daemon};
pub use db::SessionDB;
pub use error::{Error, Result};
pub use monitor::PermissionMonitor;
pub use protocol::{Event, EventType, Push, QueryType, Request, Response, SettingsChangeReason};
pub use session::{ContinueOverrides, LaunchConfig, SessionManager, ORPHAN_ERROR_MESSAGE};
pub use types::*;
