//! 审批 ↔ 工具调用事件关联
//!
//! 两个方向都在 run 锁内完成：
//! - 审批先到：工具调用事件写入时反向查找未关联的审批（已决定的也算）
//! - 事件先到：审批创建时正向查找未关联的工具调用事件
//!
//! 关联上 pending 审批时会话从 running 切到 waiting_input。

use crate::context::DaemonContext;
use crate::error::Result;
use crate::protocol::Event;
use crate::session::transition;
use crate::types::{
    Approval, ApprovalStatus, ConversationEvent, ConversationEventInput, ConversationEventType,
    Session, SessionStatus,
};

/// 写入对话事件；工具调用事件会尝试反向关联先到的审批
pub async fn record_event(
    ctx: &DaemonContext,
    session: &Session,
    input: &ConversationEventInput,
) -> Result<ConversationEvent> {
    let _guard = ctx.locks.lock(&session.run_id).await;

    let mut event = ctx.db.append_conversation_event(&session.id, input)?;

    if event.event_type == ConversationEventType::ToolCall {
        if let Some((correlated, approval)) = ctx.db.correlate_event(&event, &session.run_id)? {
            tracing::info!(
                "🔗 Correlated tool call with earlier approval: session_id={}, tool={:?}, approval_id={}, status={}",
                session.id,
                correlated.tool_name,
                approval.id,
                approval.status
            );
            if approval.status == ApprovalStatus::Pending {
                mark_waiting(ctx, &session.id)?;
            }
            event = correlated;
        }
    }

    ctx.publish(Event::ConversationUpdated {
        session_id: session.id.clone(),
        run_id: session.run_id.clone(),
        event_id: event.id,
        sequence: event.sequence,
        event_type: event.event_type,
    });

    Ok(event)
}

/// 新审批的正向关联（调用方持有 run 锁）
pub(crate) fn correlate_new_approval(
    ctx: &DaemonContext,
    approval: &Approval,
) -> Result<Option<ConversationEvent>> {
    let Some(event) = ctx.db.correlate_approval(approval)? else {
        tracing::debug!(
            "No tool call to correlate yet: approval_id={}, tool={}",
            approval.id,
            approval.tool_name
        );
        return Ok(None);
    };

    tracing::info!(
        "🔗 Correlated approval with tool call: approval_id={}, event_id={}",
        approval.id,
        event.id
    );
    if approval.status == ApprovalStatus::Pending {
        mark_waiting(ctx, &event.session_id)?;
    }
    Ok(Some(event))
}

/// running → waiting_input；其他状态保持不变
fn mark_waiting(ctx: &DaemonContext, session_id: &str) -> Result<()> {
    transition::transition_if(ctx, session_id, SessionStatus::Running, SessionStatus::WaitingInput)?;
    Ok(())
}
