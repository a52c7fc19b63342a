//! 会话管理
//!
//! 负责会话的启动、继续、中断和关闭，并在 daemon 重启后回收孤儿会话。
//! 每个运行中的会话对应一个子进程监督任务，监督任务负责写入对话和终态。

mod supervisor;
pub(crate) mod transition;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::approval::record_event;
use crate::claude::{AgentCommand, AgentProcess};
use crate::context::DaemonContext;
use crate::error::{Error, Result};
use crate::protocol::{Event, SettingsChangeReason};
use crate::types::{
    now_ms, ConversationEvent, ConversationEventInput, Session, SessionInput, SessionStatus,
};

use supervisor::{Control, Supervisor};

/// 孤儿会话回收时写入的错误信息
pub const ORPHAN_ERROR_MESSAGE: &str = "daemon restarted while session was active";

/// stop_all 为强杀预留的最长等待
const KILL_WAIT: Duration = Duration::from_secs(2);

/// 子进程环境变量：本次运行的 run_id
pub const RUN_ID_ENV: &str = "AGENTD_RUN_ID";
/// 子进程环境变量：daemon socket 路径
pub const SOCKET_ENV: &str = "AGENTD_SOCKET";

/// 启动参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub query: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub append_system_prompt: Option<String>,
    #[serde(default)]
    pub max_turns: Option<i64>,
    #[serde(default)]
    pub permission_prompt_tool: Option<String>,
    #[serde(default)]
    pub mcp_config: Option<serde_json::Value>,
    #[serde(default)]
    pub skip_permissions: bool,
    /// 跳过审批的有效期（毫秒），None 表示不过期
    #[serde(default)]
    pub skip_permissions_timeout_ms: Option<i64>,
}

/// 继续会话时可覆盖的参数；未指定的沿用父会话
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinueOverrides {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub append_system_prompt: Option<String>,
    #[serde(default)]
    pub max_turns: Option<i64>,
    #[serde(default)]
    pub permission_prompt_tool: Option<String>,
    #[serde(default)]
    pub mcp_config: Option<serde_json::Value>,
    #[serde(default)]
    pub skip_permissions: Option<bool>,
    #[serde(default)]
    pub skip_permissions_timeout_ms: Option<i64>,
}

/// 运行中会话的句柄
struct ActiveSession {
    run_id: String,
    control: mpsc::Sender<Control>,
    done: watch::Receiver<bool>,
}

/// 会话管理器
pub struct SessionManager {
    ctx: DaemonContext,
    active: Arc<Mutex<HashMap<String, ActiveSession>>>,
}

impl SessionManager {
    pub fn new(ctx: DaemonContext) -> Self {
        Self {
            ctx,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ====== 启动 / 继续 ======

    /// 启动新会话
    pub async fn launch(&self, config: LaunchConfig) -> Result<Session> {
        let now = now_ms();
        let input = SessionInput {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            query: config.query.clone(),
            working_dir: config.working_dir.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            append_system_prompt: config.append_system_prompt.clone(),
            max_turns: config.max_turns,
            permission_prompt_tool: config.permission_prompt_tool.clone(),
            skip_permissions: config.skip_permissions,
            skip_permissions_expires_at: skip_expiry(
                config.skip_permissions,
                config.skip_permissions_timeout_ms,
                now,
            ),
            ..Default::default()
        };

        let session = self.create(&input)?;
        tracing::info!(
            "🆕 Session launched: session_id={}, run_id={}",
            session.id,
            session.run_id
        );
        self.start(session, None, config.mcp_config).await
    }

    /// 基于已完成或运行中的会话继续
    pub async fn continue_session(
        &self,
        parent_session_id: &str,
        query: &str,
        overrides: ContinueOverrides,
    ) -> Result<Session> {
        let parent = self.ctx.db.get_session(parent_session_id)?;
        if !parent.status.is_continuable() {
            return Err(Error::InvalidStateTransition {
                from: parent.status,
                to: SessionStatus::Starting,
            });
        }
        let Some(claude_session_id) = parent.claude_session_id.clone() else {
            return Err(Error::InvalidState(format!(
                "parent session {} has no agent session id to resume",
                parent.id
            )));
        };

        let now = now_ms();
        let (skip_permissions, skip_permissions_expires_at) = match overrides.skip_permissions {
            Some(enabled) => (
                enabled,
                skip_expiry(enabled, overrides.skip_permissions_timeout_ms, now),
            ),
            None if parent.skip_permissions_active(now) => {
                (true, parent.skip_permissions_expires_at)
            }
            None => (false, None),
        };

        let input = SessionInput {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            parent_session_id: Some(parent.id.clone()),
            claude_session_id: Some(claude_session_id.clone()),
            query: query.to_string(),
            working_dir: parent.working_dir.clone(),
            model: overrides.model.or(parent.model),
            system_prompt: overrides.system_prompt.or(parent.system_prompt),
            append_system_prompt: overrides.append_system_prompt.or(parent.append_system_prompt),
            max_turns: overrides.max_turns.or(parent.max_turns),
            permission_prompt_tool: overrides
                .permission_prompt_tool
                .or(parent.permission_prompt_tool),
            skip_permissions,
            skip_permissions_expires_at,
        };

        let session = self.create(&input)?;
        tracing::info!(
            "↪️ Session continued: session_id={}, parent_session_id={}",
            session.id,
            parent_session_id
        );
        self.start(session, Some(claude_session_id), overrides.mcp_config)
            .await
    }

    fn create(&self, input: &SessionInput) -> Result<Session> {
        let session = self.ctx.db.create_session(input)?;
        transition::publish_status_change(&self.ctx, &session, None, session.status);
        Ok(session)
    }

    /// 写入初始查询、启动子进程、进入 running
    async fn start(
        &self,
        session: Session,
        resume_session_id: Option<String>,
        mcp_config: Option<serde_json::Value>,
    ) -> Result<Session> {
        record_event(
            &self.ctx,
            &session,
            &ConversationEventInput::message("user", session.query.clone()),
        )
        .await?;

        let command = self.command_for(&session, resume_session_id, mcp_config);
        let process = match AgentProcess::spawn(&command) {
            Ok(process) => process,
            Err(e) => {
                transition::fail(&self.ctx, &session.id, &e.to_string())?;
                return Err(e);
            }
        };

        let (control_tx, control_rx) = mpsc::channel(8);
        let (done_tx, done_rx) = watch::channel(false);

        // 先登记再切换状态，保证 running 的会话都能被中断
        self.active.lock().insert(
            session.id.clone(),
            ActiveSession {
                run_id: session.run_id.clone(),
                control: control_tx,
                done: done_rx,
            },
        );

        let session = match transition::transition(&self.ctx, &session.id, SessionStatus::Running) {
            Ok(session) => session,
            Err(e) => {
                self.active.lock().remove(&session.id);
                return Err(e);
            }
        };

        let supervisor = Supervisor::new(self.ctx.clone(), session.clone(), process, control_rx, done_tx);
        let active = self.active.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            supervisor.run().await;
            active.lock().remove(&session_id);
        });

        Ok(session)
    }

    fn command_for(
        &self,
        session: &Session,
        resume_session_id: Option<String>,
        mcp_config: Option<serde_json::Value>,
    ) -> AgentCommand {
        let config = &self.ctx.config;
        AgentCommand {
            program: config.claude_path.clone(),
            program_args: config.claude_args.clone(),
            query: session.query.clone(),
            working_dir: session.working_dir.clone(),
            resume_session_id,
            model: session.model.clone(),
            system_prompt: session.system_prompt.clone(),
            append_system_prompt: session.append_system_prompt.clone(),
            max_turns: session.max_turns,
            permission_prompt_tool: session.permission_prompt_tool.clone(),
            mcp_config,
            env: vec![
                (RUN_ID_ENV.to_string(), session.run_id.clone()),
                (
                    SOCKET_ENV.to_string(),
                    config.socket_path().display().to_string(),
                ),
            ],
        }
    }

    // ====== 中断 / 关闭 ======

    /// 中断会话：进入 interrupting，子进程退出后变为 interrupted
    pub async fn interrupt(&self, session_id: &str) -> Result<Session> {
        let session = self.ctx.db.get_session(session_id)?;
        if !session.status.is_interruptible() {
            return Err(Error::InvalidStateTransition {
                from: session.status,
                to: SessionStatus::Interrupting,
            });
        }

        let control = self
            .active
            .lock()
            .get(session_id)
            .map(|active| active.control.clone());
        // 没有子进程（如回收后的孤儿）同样不可中断
        let Some(control) = control else {
            return Err(Error::InvalidStateTransition {
                from: session.status,
                to: SessionStatus::Interrupting,
            });
        };

        let session = transition::transition(&self.ctx, session_id, SessionStatus::Interrupting)?;
        if control.send(Control::Interrupt).await.is_err() {
            tracing::debug!("Supervisor already gone: session_id={}", session_id);
        }
        Ok(session)
    }

    /// 中断所有活跃会话，超时后强杀
    pub async fn stop_all(&self, timeout: Duration) -> usize {
        let active: Vec<(String, String, mpsc::Sender<Control>, watch::Receiver<bool>)> = self
            .active
            .lock()
            .iter()
            .map(|(id, a)| (id.clone(), a.run_id.clone(), a.control.clone(), a.done.clone()))
            .collect();

        if active.is_empty() {
            return 0;
        }
        tracing::info!("⏹️ Stopping {} active sessions", active.len());

        for (session_id, run_id, control, _) in &active {
            match transition::transition(&self.ctx, session_id, SessionStatus::Interrupting) {
                Ok(_) => {
                    let _ = control.send(Control::Interrupt).await;
                }
                Err(e) => {
                    tracing::debug!("Cannot interrupt session_id={}, run_id={}: {}", session_id, run_id, e);
                    let _ = control.send(Control::Kill).await;
                }
            }
        }

        // 中断等待和强杀等待都在 timeout 之内
        let deadline = tokio::time::Instant::now() + timeout;
        let interrupt_deadline = deadline - (timeout / 4).min(KILL_WAIT);

        let mut stragglers = Vec::new();
        for (session_id, _, control, mut done) in active.iter().cloned() {
            let timed_out = tokio::time::timeout_at(interrupt_deadline, done.wait_for(|d| *d))
                .await
                .is_err();
            if timed_out {
                stragglers.push((session_id, control, done));
            }
        }

        for (session_id, control, _) in &stragglers {
            tracing::warn!("Session did not stop in time, killing: session_id={}", session_id);
            let _ = tokio::time::timeout_at(deadline, control.send(Control::Kill)).await;
        }
        for (session_id, _, mut done) in stragglers {
            if tokio::time::timeout_at(deadline, done.wait_for(|d| *d))
                .await
                .is_err()
            {
                tracing::error!("Session still running at shutdown deadline: session_id={}", session_id);
            }
        }

        active.len()
    }

    /// 启动时回收上次运行遗留的活跃会话
    pub fn recover_orphans(&self) -> Result<usize> {
        let orphans = self.ctx.db.list_sessions_with_statuses(&[
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::WaitingInput,
        ])?;

        let mut recovered = 0;
        for session in orphans {
            if self.active.lock().contains_key(&session.id) {
                continue;
            }
            match transition::fail(&self.ctx, &session.id, ORPHAN_ERROR_MESSAGE) {
                Ok(Some(_)) => recovered += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Failed to recover orphan session_id={}: {}", session.id, e);
                }
            }
        }

        if recovered > 0 {
            tracing::info!("🧹 Recovered {} orphaned sessions", recovered);
        }
        Ok(recovered)
    }

    // ====== 查询 / 设置 ======

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        self.ctx.db.get_session(session_id)
    }

    pub fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        self.ctx.db.list_sessions(status)
    }

    /// 获取对话；`consolidated` 时按祖先链从旧到新拼接
    pub fn get_conversation(&self, session_id: &str, consolidated: bool) -> Result<Vec<ConversationEvent>> {
        if consolidated {
            self.ctx.db.get_conversation_with_parents(session_id)
        } else {
            self.ctx.db.get_session(session_id)?;
            self.ctx.db.get_conversation(session_id)
        }
    }

    /// 更新跳过审批设置
    pub fn update_settings(
        &self,
        session_id: &str,
        skip_permissions: bool,
        expires_at: Option<i64>,
    ) -> Result<Session> {
        self.ctx
            .db
            .set_skip_permissions(session_id, skip_permissions, expires_at)?;
        let session = self.ctx.db.get_session(session_id)?;

        tracing::info!(
            "⚙️ Session settings updated: session_id={}, skip_permissions={}, expires_at={:?}",
            session_id,
            session.skip_permissions,
            session.skip_permissions_expires_at
        );
        self.ctx.publish(Event::SessionSettingsChanged {
            session_id: session.id.clone(),
            run_id: session.run_id.clone(),
            skip_permissions: session.skip_permissions,
            expires_at: session.skip_permissions_expires_at,
            reason: SettingsChangeReason::Updated,
        });
        Ok(session)
    }

    /// 当前有子进程的会话数
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.lock().contains_key(session_id)
    }
}

fn skip_expiry(enabled: bool, timeout_ms: Option<i64>, now: i64) -> Option<i64> {
    if !enabled {
        return None;
    }
    timeout_ms.filter(|ms| *ms > 0).map(|ms| now + ms)
}
