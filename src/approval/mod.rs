//! 审批管理
//!
//! 审批由 MCP 权限回调创建（按 run_id 归属会话），由客户端做出决定。
//! 会话处于跳过审批状态时，新审批直接标记为已批准。

mod correlation;

pub use correlation::record_event;

use serde::{Deserialize, Serialize};

use crate::context::DaemonContext;
use crate::error::{Error, Result, HUMAN_CONTACT_UNSUPPORTED};
use crate::protocol::Event;
use crate::session::transition;
use crate::types::{now_ms, Approval, ApprovalStatus, ConversationEvent, SessionStatus};

/// 跳过审批时自动批准的备注
pub const AUTO_APPROVE_COMMENT: &str = "auto-approved: skip permissions enabled";

/// 创建审批的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedApproval {
    pub approval: Approval,
    /// 已关联的工具调用事件（事件尚未到达时为空）
    pub correlated_event: Option<ConversationEvent>,
}

/// 审批决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    /// 解析 (decision_type, decision)；只支持 tool_call 类型
    pub fn parse(decision_type: &str, decision: &str) -> Result<Self> {
        match decision_type {
            "tool_call" => match decision {
                "approve" | "approved" => Ok(Decision::Approve),
                "deny" | "denied" => Ok(Decision::Deny),
                other => Err(Error::InvalidDecisionType(format!(
                    "invalid decision for tool call: {}",
                    other
                ))),
            },
            "human_contact" => Err(Error::InvalidDecisionType(HUMAN_CONTACT_UNSUPPORTED.to_string())),
            other => Err(Error::InvalidDecisionType(format!(
                "unsupported decision type: {}",
                other
            ))),
        }
    }

    pub fn status(self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Deny => ApprovalStatus::Denied,
        }
    }
}

/// 审批管理器
pub struct ApprovalManager {
    ctx: DaemonContext,
}

impl ApprovalManager {
    pub fn new(ctx: DaemonContext) -> Self {
        Self { ctx }
    }

    /// 创建审批并尝试关联工具调用事件
    pub async fn create_approval(
        &self,
        run_id: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
        tool_use_id: Option<String>,
    ) -> Result<CreatedApproval> {
        let ctx = &self.ctx;
        let session = ctx.db.get_session_by_run_id(run_id)?;
        let now = now_ms();

        let mut approval = Approval {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            session_id: session.as_ref().map(|s| s.id.clone()),
            tool_name: tool_name.to_string(),
            tool_input,
            tool_use_id,
            status: ApprovalStatus::Pending,
            comment: None,
            created_at: now,
            responded_at: None,
        };

        if session.as_ref().is_some_and(|s| s.skip_permissions_active(now)) {
            approval.status = ApprovalStatus::Approved;
            approval.comment = Some(AUTO_APPROVE_COMMENT.to_string());
            approval.responded_at = Some(now);
        }

        let correlated_event = {
            let _guard = ctx.locks.lock(run_id).await;
            ctx.db
                .create_approval(&approval)
                .and_then(|_| correlation::correlate_new_approval(ctx, &approval))
        };
        // 未知或已结束的 run 没有监督任务替它回收锁
        ctx.locks.release(run_id);
        let correlated_event = correlated_event?;

        tracing::info!(
            "📝 Approval created: approval_id={}, run_id={}, tool={}, status={}",
            approval.id,
            run_id,
            tool_name,
            approval.status
        );
        if session.is_none() {
            tracing::warn!("Approval for unknown run: run_id={}", run_id);
        }

        ctx.publish(Event::NewApproval {
            approval_id: approval.id.clone(),
            run_id: approval.run_id.clone(),
            session_id: approval.session_id.clone(),
            tool_name: approval.tool_name.clone(),
            tool_use_id: approval.tool_use_id.clone(),
        });
        if approval.status != ApprovalStatus::Pending {
            self.publish_resolved(&approval);
        }

        Ok(CreatedApproval {
            approval,
            correlated_event,
        })
    }

    /// 对审批做出决定
    pub async fn decide(
        &self,
        approval_id: &str,
        decision_type: &str,
        decision: &str,
        comment: Option<String>,
    ) -> Result<Approval> {
        let decision = Decision::parse(decision_type, decision)?;
        let ctx = &self.ctx;
        let approval = ctx.db.get_approval(approval_id)?;

        let resolved = {
            let _guard = ctx.locks.lock(&approval.run_id).await;
            self.apply_decision(approval_id, decision.status(), comment.as_deref())
        };
        ctx.locks.release(&approval.run_id);
        let resolved = resolved?;

        tracing::info!(
            "✅ Approval decided: approval_id={}, status={}",
            approval_id,
            resolved.status
        );
        self.publish_resolved(&resolved);
        Ok(resolved)
    }

    /// 获取审批
    pub fn get_approval(&self, approval_id: &str) -> Result<Approval> {
        self.ctx.db.get_approval(approval_id)
    }

    /// 列出审批
    pub fn list_approvals(
        &self,
        session_id: Option<&str>,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<Approval>> {
        self.ctx.db.list_approvals(session_id, status)
    }

    /// 写入决定并同步关联事件（调用方持有 run 锁）
    fn apply_decision(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        comment: Option<&str>,
    ) -> Result<Approval> {
        let ctx = &self.ctx;
        if !ctx.db.resolve_approval(approval_id, status, comment)? {
            let current = ctx.db.get_approval(approval_id)?;
            return Err(Error::InvalidState(format!(
                "approval {} is already {}",
                approval_id, current.status
            )));
        }
        ctx.db.update_event_approval_status(approval_id, status)?;

        let resolved = ctx.db.get_approval(approval_id)?;
        self.resume_if_unblocked(&resolved)?;
        Ok(resolved)
    }

    /// 会话没有其他 pending 审批时 waiting_input → running
    fn resume_if_unblocked(&self, approval: &Approval) -> Result<()> {
        let session_id = match approval.session_id {
            Some(ref id) => id.clone(),
            None => match self.ctx.db.get_session_by_run_id(&approval.run_id)? {
                Some(session) => session.id,
                None => return Ok(()),
            },
        };

        let still_pending = self
            .ctx
            .db
            .list_approvals(Some(&session_id), Some(ApprovalStatus::Pending))?;
        if !still_pending.is_empty() {
            tracing::debug!(
                "Session still has {} pending approvals: session_id={}",
                still_pending.len(),
                session_id
            );
            return Ok(());
        }

        transition::transition_if(
            &self.ctx,
            &session_id,
            SessionStatus::WaitingInput,
            SessionStatus::Running,
        )?;
        Ok(())
    }

    fn publish_resolved(&self, approval: &Approval) {
        self.ctx.publish(Event::ApprovalResolved {
            approval_id: approval.id.clone(),
            run_id: approval.run_id.clone(),
            session_id: approval.session_id.clone(),
            status: approval.status,
            comment: approval.comment.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_parsing() {
        assert_eq!(Decision::parse("tool_call", "approve").unwrap(), Decision::Approve);
        assert_eq!(Decision::parse("tool_call", "denied").unwrap(), Decision::Deny);
        assert_eq!(Decision::Deny.status(), ApprovalStatus::Denied);
    }

    #[test]
    fn test_human_contact_is_rejected_with_fixed_message() {
        let err = Decision::parse("human_contact", "respond").unwrap_err();
        assert!(matches!(err, Error::InvalidDecisionType(_)));
        assert_eq!(err.to_string(), HUMAN_CONTACT_UNSUPPORTED);
    }

    #[test]
    fn test_unknown_decision_values() {
        assert!(matches!(
            Decision::parse("tool_call", "maybe"),
            Err(Error::InvalidDecisionType(_))
        ));
        assert!(matches!(
            Decision::parse("something_else", "approve"),
            Err(Error::InvalidDecisionType(_))
        ));
    }
}
