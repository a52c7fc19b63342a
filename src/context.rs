//! 共享上下文
//!
//! 所有组件通过构造函数拿到同一个 `DaemonContext`，不使用全局单例。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::broadcaster::Broadcaster;
use crate::config::DaemonConfig;
use crate::db::SessionDB;
use crate::error::Result;
use crate::protocol::Event;

/// Daemon 共享依赖
#[derive(Clone)]
pub struct DaemonContext {
    pub config: Arc<DaemonConfig>,
    pub db: Arc<SessionDB>,
    pub broadcaster: Arc<Broadcaster>,
    pub locks: Arc<RunLocks>,
}

impl DaemonContext {
    pub fn new(config: DaemonConfig, db: SessionDB) -> Self {
        let broadcaster = Broadcaster::new(config.subscriber_buffer);
        Self {
            config: Arc::new(config),
            db: Arc::new(db),
            broadcaster,
            locks: Arc::new(RunLocks::default()),
        }
    }

    /// 按配置打开数据库
    pub fn open(config: DaemonConfig) -> Result<Self> {
        let db = SessionDB::connect(config.db.clone())?;
        Ok(Self::new(config, db))
    }

    /// 内存数据库 + 默认配置（测试用）
    pub fn in_memory(mut config: DaemonConfig) -> Result<Self> {
        config.db = crate::config::DbConfig::memory();
        Self::open(config)
    }

    pub fn publish(&self, event: Event) -> usize {
        self.broadcaster.publish(event)
    }
}

/// 按 run_id 串行化的锁表
///
/// 同一 run 的事件写入、审批创建和审批决定互斥，不同 run 之间互不影响。
#[derive(Default)]
pub struct RunLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunLocks {
    /// 获取 run 的锁
    pub async fn lock(&self, run_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// run 结束后回收；仍有人持有或等待时保留
    pub fn release(&self, run_id: &str) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(run_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(run_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_run_is_serialized() {
        let locks = Arc::new(RunLocks::default());
        let guard = locks.lock("r1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock("r1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_runs_do_not_block() {
        let locks = RunLocks::default();
        let _a = locks.lock("r1").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock("r2"))
            .await
            .expect("other run should not block");
    }

    #[tokio::test]
    async fn test_release_keeps_held_locks() {
        let locks = RunLocks::default();
        let guard = locks.lock("r1").await;
        locks.release("r1");
        assert_eq!(locks.len(), 1);

        drop(guard);
        locks.release("r1");
        assert!(locks.is_empty());
    }
}
