//! 事件广播器
//!
//! 维护订阅列表，将事件推送给订阅者。
//! 每个订阅者一个有界通道；通道满时丢弃最新事件，发布方从不阻塞。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::{Event, EventType};

/// 订阅 ID
pub type SubscriberId = u64;

/// 订阅过滤条件；各条件之间是 AND 关系
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// 事件类型（为空表示全部）
    pub event_types: HashSet<EventType>,
    pub session_id: Option<String>,
    pub run_id: Option<String>,
}

impl SubscriptionFilter {
    /// 接收全部事件
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            event_types: types.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// 事件是否满足过滤条件
    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type()) {
            return false;
        }
        if let Some(ref session_id) = self.session_id {
            if event.session_id() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(ref run_id) = self.run_id {
            if event.run_id() != run_id {
                return false;
            }
        }
        true
    }
}

/// 一个订阅：ID + 接收端
pub struct Subscription {
    pub id: SubscriberId,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    /// 等待下一个事件；订阅被取消后返回 None
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// 非阻塞读取
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    sender: mpsc::Sender<Event>,
}

/// 事件广播器
pub struct Broadcaster {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    /// 因通道满被丢弃的事件数
    dropped: AtomicU64,
}

impl Broadcaster {
    /// 创建新的广播器，`buffer` 为每个订阅者的缓冲区大小
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
        })
    }

    /// 订阅事件
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);

        tracing::debug!("📡 Subscribed: id={}, filter={:?}", id, filter);
        self.subscribers.write().insert(id, Subscriber { filter, sender });

        Subscription { id, receiver }
    }

    /// 取消订阅（幂等）；接收端随后读到 None
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            tracing::debug!("📡 Unsubscribed: id={}", id);
        }
        removed
    }

    /// 发布事件（非阻塞，fire-and-forget），返回送达的订阅者数
    pub fn publish(&self, event: Event) -> usize {
        let event_type = event.event_type();

        // 先复制 sender，释放锁后再发送
        let targets: Vec<(SubscriberId, mpsc::Sender<Event>)> = {
            let subscribers = self.subscribers.read();
            subscribers
                .iter()
                .filter(|(_, sub)| sub.filter.matches(&event))
                .map(|(id, sub)| (*id, sub.sender.clone()))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: event_type={:?}", event_type);
            return 0;
        }

        tracing::debug!(
            "📡 Publishing event: event_type={:?}, subscribers={}",
            event_type,
            targets.len()
        );

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("📡 Channel full, dropping event: id={}, event_type={:?}", id, event_type);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("📡 Channel closed: id={}", id);
                    closed.push(id);
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
            }
        }

        delivered
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// 累计丢弃的事件数
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 取消全部订阅（关闭时使用）
    pub fn close_all(&self) {
        let count = {
            let mut subscribers = self.subscribers.write();
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        if count > 0 {
            tracing::info!("📡 Closed {} subscriptions", count);
        }
    }
}
