//! 跳过审批过期监控
//!
//! 周期性扫描跳过审批已过期的会话，清除设置并发布 `SessionSettingsChanged`。

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::context::DaemonContext;
use crate::error::Result;
use crate::protocol::{Event, SettingsChangeReason};
use crate::types::now_ms;

/// 跳过审批过期监控
pub struct PermissionMonitor {
    ctx: DaemonContext,
    interval: Duration,
}

impl PermissionMonitor {
    pub fn new(ctx: DaemonContext) -> Self {
        let interval = ctx.config.permission_check_interval;
        Self { ctx, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// 执行一次检查，返回清除的会话数
    pub fn check_once(&self) -> Result<usize> {
        let now = now_ms();
        let expired = self.ctx.db.list_expired_skip_permissions(now)?;

        let mut cleared = 0;
        for session in expired {
            match self.ctx.db.clear_expired_skip_permissions(&session.id, now) {
                Ok(true) => {
                    cleared += 1;
                    tracing::info!(
                        "⏰ Skip permissions expired: session_id={}, expired_at={:?}",
                        session.id,
                        session.skip_permissions_expires_at
                    );
                    self.ctx.publish(Event::SessionSettingsChanged {
                        session_id: session.id.clone(),
                        run_id: session.run_id.clone(),
                        skip_permissions: false,
                        expires_at: None,
                        reason: SettingsChangeReason::Expired,
                    });
                }
                // 期间被续期
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to clear skip permissions: session_id={}, error={}", session.id, e);
                }
            }
        }
        Ok(cleared)
    }

    /// 运行直到收到关闭信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("⏰ Permission monitor started: interval={:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once() {
                        tracing::warn!("Permission check failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("⏰ Permission monitor stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
