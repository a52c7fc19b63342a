//! Daemon 服务器
//!
//! 启动顺序：单实例锁 → 数据库 → 回收孤儿会话 → 过期监控 → Unix Socket。
//! 关闭顺序：停止接受连接 → 停止监控 → 中断活跃会话 → 关闭订阅 → 刷库 → 删除 socket/PID。

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::handler::{Connection, Handler};
use super::pidfile::PidLock;
use crate::approval::ApprovalManager;
use crate::config::DaemonConfig;
use crate::context::DaemonContext;
use crate::monitor::PermissionMonitor;
use crate::protocol::{Request, Response};
use crate::session::SessionManager;

/// 每个连接的写缓冲
const CONNECTION_BUFFER: usize = 100;

/// Daemon 服务
pub struct Daemon {
    ctx: DaemonContext,
    sessions: Arc<SessionManager>,
    approvals: Arc<ApprovalManager>,
    handler: Arc<Handler>,
    shutdown: watch::Sender<bool>,
    pid_lock: Mutex<Option<PidLock>>,
    next_conn_id: AtomicU64,
}

impl Daemon {
    /// 获取单实例锁并打开数据库
    pub fn new(config: DaemonConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("创建数据目录失败: {:?}", config.data_dir))?;

        let pid_lock = PidLock::acquire(&config.pid_path())?;
        let ctx = DaemonContext::open(config).context("打开数据库失败")?;

        let sessions = Arc::new(SessionManager::new(ctx.clone()));
        let approvals = Arc::new(ApprovalManager::new(ctx.clone()));
        let handler = Arc::new(Handler::new(ctx.clone(), sessions.clone(), approvals.clone()));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            ctx,
            sessions,
            approvals,
            handler,
            shutdown,
            pid_lock: Mutex::new(Some(pid_lock)),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn context(&self) -> &DaemonContext {
        &self.ctx
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    pub fn socket_path(&self) -> PathBuf {
        self.ctx.config.socket_path()
    }

    /// 请求关闭（信号处理或测试使用）
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// 运行 Daemon 直到收到关闭信号
    pub async fn run(self: Arc<Self>) -> Result<()> {
        match self.sessions.recover_orphans() {
            Ok(count) if count > 0 => tracing::info!("🧹 孤儿会话已回收: {}", count),
            Ok(_) => {}
            Err(e) => tracing::error!("孤儿会话回收失败: {}", e),
        }

        let monitor = PermissionMonitor::new(self.ctx.clone()).spawn(self.shutdown.subscribe());

        // 清理旧的 socket 文件
        let socket_path = self.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!("🚀 Daemon 启动: {:?}", socket_path);

        let mut shutdown_rx = self.shutdown.subscribe();
        let signal = shutdown_signal();
        tokio::pin!(signal);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let daemon = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = daemon.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = &mut signal => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("收到关闭请求，准备退出...");
                        break;
                    }
                }
            }
        }

        drop(listener);
        self.shutdown_gracefully(monitor).await;
        Ok(())
    }

    /// 处理单个连接
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let (tx, mut rx) = mpsc::channel::<String>(CONNECTION_BUFFER);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = Connection::new(conn_id, tx.clone());
        tracing::debug!("📥 新连接: conn_id={}", conn_id);

        // 发送任务：响应和推送共用一个写端
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                read = reader.read_line(&mut line) => read,
                _ = shutdown_rx.changed() => break,
            };

            match read {
                // 连接关闭
                Ok(0) => break,
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = match serde_json::from_str::<Request>(&line) {
                        Ok(request) => self.handler.handle(&mut conn, request).await,
                        Err(e) => {
                            tracing::warn!("解析请求失败: {}", e);
                            Response::Error {
                                code: 400,
                                message: format!("Invalid JSON: {}", e),
                            }
                        }
                    };

                    let resp_json = serde_json::to_string(&response)?;
                    if tx.send(format!("{}\n", resp_json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: {}", e);
                    break;
                }
            }
        }

        // 清理
        self.handler.close(&mut conn);
        drop(conn);
        drop(tx);
        // 让已排队的响应写完
        let _ = tokio::time::timeout(Duration::from_millis(500), write_handle).await;
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

        Ok(())
    }

    /// 按顺序关闭各组件，所有等待共用 shutdown_timeout 截止时间
    async fn shutdown_gracefully(&self, monitor: JoinHandle<()>) {
        let deadline = Instant::now() + self.ctx.config.shutdown_timeout;
        self.trigger_shutdown();

        if tokio::time::timeout_at(deadline, monitor).await.is_err() {
            tracing::warn!("过期监控未能及时退出");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let stopped = self.sessions.stop_all(remaining).await;
        if stopped > 0 {
            tracing::info!("⏹️ 已停止 {} 个会话", stopped);
        }

        self.ctx.broadcaster.close_all();

        if let Err(e) = self.ctx.db.checkpoint() {
            tracing::warn!("数据库刷盘失败: {}", e);
        }

        self.cleanup();
    }

    /// 清理资源
    fn cleanup(&self) {
        let socket_path = self.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        // 释放 PID 文件
        self.pid_lock.lock().take();

        tracing::info!("🧹 Daemon 清理完成");
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
