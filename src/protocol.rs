//! IPC 协议定义
//!
//! 通信方式：Unix Socket + JSONL（每条消息一行 JSON + '\n'）
//!
//! - `Request`：Client → Daemon
//! - `Response`：Daemon → Client（逐条对应请求）
//! - `Push`：Daemon → 订阅者（事件推送，与响应共用同一连接）

use serde::{Deserialize, Serialize};

use crate::approval::CreatedApproval;
use crate::session::{ContinueOverrides, LaunchConfig};
use crate::types::{Approval, ApprovalStatus, ConversationEvent, ConversationEventType, Session, SessionStatus};

/// 请求类型（Client → Daemon）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 握手
    Handshake {
        /// 客户端组件名称
        component: String,
        /// 组件版本（用于日志和诊断）
        version: String,
    },

    /// 心跳（保持连接）
    Heartbeat,

    /// 启动会话
    LaunchSession(LaunchConfig),

    /// 基于已有会话继续
    ContinueSession {
        parent_session_id: String,
        query: String,
        #[serde(default)]
        overrides: ContinueOverrides,
    },

    /// 中断会话
    InterruptSession { session_id: String },

    GetSession { session_id: String },

    ListSessions {
        #[serde(default)]
        status: Option<SessionStatus>,
    },

    /// 获取对话；`consolidated` 时包含整个祖先链
    GetConversation {
        session_id: String,
        #[serde(default)]
        consolidated: bool,
    },

    /// 创建审批（来自 MCP 权限回调）
    CreateApproval {
        run_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },

    /// 获取审批列表
    FetchApprovals {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        status: Option<ApprovalStatus>,
    },

    /// 发送审批决定
    SendDecision {
        approval_id: String,
        #[serde(default = "default_decision_type")]
        decision_type: String,
        decision: String,
        #[serde(default)]
        comment: Option<String>,
    },

    /// 更新跳过审批设置
    UpdateSessionSettings {
        session_id: String,
        skip_permissions: bool,
        /// 过期时间戳（毫秒），None 表示不过期
        #[serde(default)]
        expires_at: Option<i64>,
    },

    /// 订阅事件
    Subscribe {
        /// 要订阅的事件类型（为空表示全部）
        #[serde(default)]
        events: Vec<EventType>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        run_id: Option<String>,
    },

    /// 取消订阅
    Unsubscribe { subscription_id: u64 },

    /// 查询
    Query {
        /// 查询类型
        query_type: QueryType,
    },
}

fn default_decision_type() -> String {
    "tool_call".to_string()
}

/// 响应类型（Daemon → Client）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 握手成功
    HandshakeOk { daemon_version: String },

    Session { session: Session },

    Sessions { sessions: Vec<Session> },

    Conversation { events: Vec<ConversationEvent> },

    ApprovalCreated(CreatedApproval),

    Approval { approval: Approval },

    Approvals { approvals: Vec<Approval> },

    Subscribed { subscription_id: u64 },

    /// 查询结果
    QueryResult { data: serde_json::Value },
}

impl Response {
    pub fn from_error(err: &crate::Error) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// 推送消息（Daemon → 订阅者）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Push {
    Event {
        subscription_id: u64,
        timestamp: i64,
        event: Event,
    },
}

/// 事件类型（用于订阅过滤，不关心载荷结构）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NewApproval,
    ApprovalResolved,
    SessionStatusChanged,
    SessionSettingsChanged,
    ConversationUpdated,
}

/// 设置变更原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsChangeReason {
    Updated,
    Expired,
}

/// 总线事件（不持久化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    NewApproval {
        approval_id: String,
        run_id: String,
        session_id: Option<String>,
        tool_name: String,
        tool_use_id: Option<String>,
    },
    ApprovalResolved {
        approval_id: String,
        run_id: String,
        session_id: Option<String>,
        status: ApprovalStatus,
        comment: Option<String>,
    },
    SessionStatusChanged {
        session_id: String,
        run_id: String,
        /// None 表示会话刚创建
        old_status: Option<SessionStatus>,
        new_status: SessionStatus,
    },
    SessionSettingsChanged {
        session_id: String,
        run_id: String,
        skip_permissions: bool,
        expires_at: Option<i64>,
        reason: SettingsChangeReason,
    },
    ConversationUpdated {
        session_id: String,
        run_id: String,
        event_id: i64,
        sequence: i64,
        event_type: ConversationEventType,
    },
}

impl Event {
    /// 获取事件类型
    pub fn event_type(&self) -> EventType {
        match self {
            Event::NewApproval { .. } => EventType::NewApproval,
            Event::ApprovalResolved { .. } => EventType::ApprovalResolved,
            Event::SessionStatusChanged { .. } => EventType::SessionStatusChanged,
            Event::SessionSettingsChanged { .. } => EventType::SessionSettingsChanged,
            Event::ConversationUpdated { .. } => EventType::ConversationUpdated,
        }
    }

    /// 事件所属会话（审批在关联前可能未知）
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::NewApproval { session_id, .. } | Event::ApprovalResolved { session_id, .. } => {
                session_id.as_deref()
            }
            Event::SessionStatusChanged { session_id, .. }
            | Event::SessionSettingsChanged { session_id, .. }
            | Event::ConversationUpdated { session_id, .. } => Some(session_id),
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Event::NewApproval { run_id, .. }
            | Event::ApprovalResolved { run_id, .. }
            | Event::SessionStatusChanged { run_id, .. }
            | Event::SessionSettingsChanged { run_id, .. }
            | Event::ConversationUpdated { run_id, .. } => run_id,
        }
    }
}

/// 查询类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "query")]
pub enum QueryType {
    /// 获取 Daemon 状态
    Status,
    /// 获取订阅者数量
    SubscriberCount,
}
