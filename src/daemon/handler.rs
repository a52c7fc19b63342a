//! 请求处理器
//!
//! 把传输层请求映射到会话/审批操作，错误统一转成 `Response::Error`。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::approval::ApprovalManager;
use crate::broadcaster::{SubscriberId, SubscriptionFilter};
use crate::context::DaemonContext;
use crate::error::Result;
use crate::protocol::{Push, QueryType, Request, Response};
use crate::session::SessionManager;
use crate::types::now_ms;

/// Daemon 版本号（跟随 crate 版本）
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 连接 ID
pub type ConnId = u64;

/// 单个连接的状态
pub struct Connection {
    pub id: ConnId,
    /// 发往客户端的 JSONL 行（响应和推送共用）
    outbound: mpsc::Sender<String>,
    /// 本连接建立的订阅及其转发任务
    subscriptions: HashMap<SubscriberId, JoinHandle<()>>,
}

impl Connection {
    pub fn new(id: ConnId, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id,
            outbound,
            subscriptions: HashMap::new(),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// 请求处理器
pub struct Handler {
    ctx: DaemonContext,
    sessions: Arc<SessionManager>,
    approvals: Arc<ApprovalManager>,
    started_at: i64,
}

impl Handler {
    pub fn new(
        ctx: DaemonContext,
        sessions: Arc<SessionManager>,
        approvals: Arc<ApprovalManager>,
    ) -> Self {
        Self {
            ctx,
            sessions,
            approvals,
            started_at: now_ms(),
        }
    }

    /// 处理请求
    pub async fn handle(&self, conn: &mut Connection, request: Request) -> Response {
        match request {
            Request::Handshake { component, version } => {
                tracing::info!(
                    "🤝 Handshake: conn_id={}, component={}, version={}",
                    conn.id,
                    component,
                    version
                );
                Response::HandshakeOk {
                    daemon_version: DAEMON_VERSION.to_string(),
                }
            }

            Request::Heartbeat => Response::Ok,

            Request::LaunchSession(config) => {
                respond(self.sessions.launch(config).await, |session| Response::Session { session })
            }

            Request::ContinueSession {
                parent_session_id,
                query,
                overrides,
            } => respond(
                self.sessions
                    .continue_session(&parent_session_id, &query, overrides)
                    .await,
                |session| Response::Session { session },
            ),

            Request::InterruptSession { session_id } => respond(
                self.sessions.interrupt(&session_id).await,
                |session| Response::Session { session },
            ),

            Request::GetSession { session_id } => respond(
                self.sessions.get_session(&session_id),
                |session| Response::Session { session },
            ),

            Request::ListSessions { status } => respond(
                self.sessions.list_sessions(status),
                |sessions| Response::Sessions { sessions },
            ),

            Request::GetConversation {
                session_id,
                consolidated,
            } => respond(
                self.sessions.get_conversation(&session_id, consolidated),
                |events| Response::Conversation { events },
            ),

            Request::CreateApproval {
                run_id,
                tool_name,
                tool_input,
                tool_use_id,
            } => respond(
                self.approvals
                    .create_approval(&run_id, &tool_name, tool_input, tool_use_id)
                    .await,
                Response::ApprovalCreated,
            ),

            Request::FetchApprovals { session_id, status } => respond(
                self.approvals.list_approvals(session_id.as_deref(), status),
                |approvals| Response::Approvals { approvals },
            ),

            Request::SendDecision {
                approval_id,
                decision_type,
                decision,
                comment,
            } => respond(
                self.approvals
                    .decide(&approval_id, &decision_type, &decision, comment)
                    .await,
                |approval| Response::Approval { approval },
            ),

            Request::UpdateSessionSettings {
                session_id,
                skip_permissions,
                expires_at,
            } => respond(
                self.sessions
                    .update_settings(&session_id, skip_permissions, expires_at),
                |session| Response::Session { session },
            ),

            Request::Subscribe {
                events,
                session_id,
                run_id,
            } => {
                let filter = SubscriptionFilter {
                    event_types: events.into_iter().collect(),
                    session_id,
                    run_id,
                };
                let subscription_id = self.subscribe(conn, filter);
                Response::Subscribed { subscription_id }
            }

            Request::Unsubscribe { subscription_id } => {
                self.unsubscribe(conn, subscription_id);
                Response::Ok
            }

            Request::Query { query_type } => self.handle_query(query_type),
        }
    }

    /// 连接关闭：取消该连接的全部订阅
    pub fn close(&self, conn: &mut Connection) {
        let ids: Vec<SubscriberId> = conn.subscriptions.keys().copied().collect();
        for id in ids {
            self.unsubscribe(conn, id);
        }
    }

    fn subscribe(&self, conn: &mut Connection, filter: SubscriptionFilter) -> SubscriberId {
        let mut subscription = self.ctx.broadcaster.subscribe(filter);
        let subscription_id = subscription.id;
        let outbound = conn.outbound.clone();
        let conn_id = conn.id;

        // 转发任务：订阅通道 → 连接写通道
        let forward = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let push = Push::Event {
                    subscription_id,
                    timestamp: now_ms(),
                    event,
                };
                let json = match serde_json::to_string(&push) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize event: {}", e);
                        continue;
                    }
                };
                if outbound.send(format!("{}\n", json)).await.is_err() {
                    break;
                }
            }
            tracing::debug!("📡 Forwarding stopped: conn_id={}, subscription_id={}", conn_id, subscription_id);
        });

        conn.subscriptions.insert(subscription_id, forward);
        subscription_id
    }

    fn unsubscribe(&self, conn: &mut Connection, subscription_id: SubscriberId) {
        self.ctx.broadcaster.unsubscribe(subscription_id);
        // 转发任务在通道关闭后自行退出
        conn.subscriptions.remove(&subscription_id);
    }

    /// 处理查询
    fn handle_query(&self, query_type: QueryType) -> Response {
        match query_type {
            QueryType::Status => Response::QueryResult {
                data: serde_json::json!({
                    "version": DAEMON_VERSION,
                    "pid": std::process::id(),
                    "uptime_ms": now_ms() - self.started_at,
                    "active_sessions": self.sessions.active_count(),
                    "subscribers": self.ctx.broadcaster.subscriber_count(),
                    "dropped_events": self.ctx.broadcaster.dropped_count(),
                }),
            },
            QueryType::SubscriberCount => Response::QueryResult {
                data: serde_json::json!({
                    "count": self.ctx.broadcaster.subscriber_count(),
                }),
            },
        }
    }
}

fn respond<T>(result: Result<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            if e.code() >= 500 {
                tracing::error!("Request failed: {}", e);
            } else {
                tracing::debug!("Request rejected: {}", e);
            }
            Response::from_error(&e)
        }
    }
}
