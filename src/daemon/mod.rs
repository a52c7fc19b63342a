//! Daemon 模块 - Unix Socket 服务 + 单实例锁
//!
//! Daemon 负责：
//! - 管理 agent 子进程会话
//! - 接收 MCP 权限回调创建的审批和客户端的审批决定
//! - 推送事件给订阅者

mod handler;
mod pidfile;
mod server;

pub use handler::{Connection, ConnId, Handler, DAEMON_VERSION};
pub use pidfile::{is_daemon_running, PidLock};
pub use server::Daemon;
