//! 子进程监督任务
//!
//! 每个活跃会话一个任务：读取 stream-json 输出写入对话，响应中断/强杀指令，
//! 进程退出后把会话落到终态。

use std::process::ExitStatus;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::approval::record_event;
use crate::claude::{AgentProcess, ResultEvent, StreamEvent};
use crate::context::DaemonContext;
use crate::error::Result;
use crate::session::transition;
use crate::types::{Session, SessionStatus, SessionUpdate};

/// 发给监督任务的指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// SIGINT，宽限期后强杀
    Interrupt,
    /// 立即强杀
    Kill,
}

pub(crate) struct Supervisor {
    ctx: DaemonContext,
    session: Session,
    process: AgentProcess,
    control: mpsc::Receiver<Control>,
    done: watch::Sender<bool>,
    result: Option<ResultEvent>,
    kill_deadline: Option<Instant>,
    control_open: bool,
}

impl Supervisor {
    pub(crate) fn new(
        ctx: DaemonContext,
        session: Session,
        process: AgentProcess,
        control: mpsc::Receiver<Control>,
        done: watch::Sender<bool>,
    ) -> Self {
        Self {
            ctx,
            session,
            process,
            control,
            done,
            result: None,
            kill_deadline: None,
            control_open: true,
        }
    }

    pub(crate) async fn run(mut self) -> Session {
        let session_id = self.session.id.clone();

        // 读 stdout 直到 EOF
        loop {
            tokio::select! {
                line = self.process.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Err(e) = self.handle_line(&line).await {
                            tracing::error!("Failed to record agent output: session_id={}, error={}", session_id, e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Agent stdout read error: session_id={}, error={}", session_id, e);
                        break;
                    }
                },
                cmd = self.control.recv(), if self.control_open => self.handle_control(cmd).await,
                _ = sleep_until(self.kill_deadline), if self.kill_deadline.is_some() => self.grace_expired().await,
            }
        }

        // 等待退出
        let exit = loop {
            tokio::select! {
                status = self.process.wait() => break status,
                cmd = self.control.recv(), if self.control_open => self.handle_control(cmd).await,
                _ = sleep_until(self.kill_deadline), if self.kill_deadline.is_some() => self.grace_expired().await,
            }
        };

        let session = match self.finalize(exit) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Failed to finalize session: session_id={}, error={}", session_id, e);
                self.session.clone()
            }
        };

        self.ctx.locks.release(&self.session.run_id);
        let _ = self.done.send(true);
        session
    }

    async fn handle_control(&mut self, cmd: Option<Control>) {
        match cmd {
            Some(Control::Interrupt) => {
                if let Err(e) = self.process.interrupt() {
                    tracing::warn!("Failed to interrupt agent: session_id={}, error={}", self.session.id, e);
                }
                if self.kill_deadline.is_none() {
                    self.kill_deadline = Some(Instant::now() + self.ctx.config.interrupt_grace);
                }
            }
            Some(Control::Kill) => self.kill().await,
            None => self.control_open = false,
        }
    }

    async fn grace_expired(&mut self) {
        tracing::warn!(
            "Agent did not exit within {:?} of interrupt: session_id={}, pid={:?}",
            self.ctx.config.interrupt_grace,
            self.session.id,
            self.process.pid()
        );
        self.kill().await;
    }

    async fn kill(&mut self) {
        self.kill_deadline = None;
        if let Err(e) = self.process.kill().await {
            tracing::warn!("Failed to kill agent: session_id={}, error={}", self.session.id, e);
        }
    }

    async fn handle_line(&mut self, line: &str) -> Result<()> {
        let Some(event) = StreamEvent::parse(line) else {
            return Ok(());
        };

        if let Some(claude_session_id) = event.session_id() {
            if self.session.claude_session_id.as_deref() != Some(claude_session_id) {
                tracing::info!(
                    "🆔 Agent session id reported: session_id={}, claude_session_id={}",
                    self.session.id,
                    claude_session_id
                );
                self.ctx.db.update_session(
                    &self.session.id,
                    &SessionUpdate {
                        claude_session_id: Some(claude_session_id.to_string()),
                        ..Default::default()
                    },
                )?;
                self.session.claude_session_id = Some(claude_session_id.to_string());
            }
        }

        for input in event.conversation_inputs() {
            record_event(&self.ctx, &self.session, &input).await?;
        }

        if let StreamEvent::Result(result) = event {
            self.ctx.db.update_session(&self.session.id, &result.session_update())?;
            self.result = Some(result);
        }
        Ok(())
    }

    /// 进程退出后决定终态
    fn finalize(&self, exit: Result<ExitStatus>) -> Result<Session> {
        let ctx = &self.ctx;
        let id = &self.session.id;
        let current = ctx.db.get_session(id)?;

        match current.status {
            SessionStatus::Interrupting => {
                tracing::info!("⏹️ Session interrupted: session_id={}", id);
                transition::transition(ctx, id, SessionStatus::Interrupted)
            }
            status if status.is_terminal() => Ok(current),
            _ => match self.failure_reason(&exit) {
                None => {
                    tracing::info!("🏁 Session completed: session_id={}", id);
                    transition::transition(ctx, id, SessionStatus::Completed)
                }
                Some(reason) => {
                    transition::fail(ctx, id, &reason)?;
                    ctx.db.get_session(id)
                }
            },
        }
    }

    fn failure_reason(&self, exit: &Result<ExitStatus>) -> Option<String> {
        if let Some(ref result) = self.result {
            if result.is_error {
                return Some(
                    result
                        .result
                        .clone()
                        .unwrap_or_else(|| "agent reported an error".to_string()),
                );
            }
        }
        match exit {
            Ok(status) if status.success() => None,
            Ok(status) => {
                let stderr = self.process.stderr_tail();
                if stderr.is_empty() {
                    Some(format!("agent exited with {}", status))
                } else {
                    Some(format!("agent exited with {}: {}", status, stderr))
                }
            }
            Err(e) => Some(format!("failed to wait for agent: {}", e)),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => tokio::time::sleep(Duration::from_secs(3600)).await,
    }
}
