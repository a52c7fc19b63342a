//! 状态迁移
//!
//! 所有状态写入都走这里：先校验迁移表，再 compare-and-set，成功后发布
//! `SessionStatusChanged`。并发写入输掉 CAS 的一方重新读取后再判断。

use crate::context::DaemonContext;
use crate::error::{Error, Result};
use crate::protocol::Event;
use crate::types::{Session, SessionStatus, SessionUpdate};

/// CAS 冲突时的最大重试次数
const MAX_CAS_RETRIES: usize = 3;

/// 迁移到 `to`；迁移表不允许时返回 `InvalidStateTransition`
pub(crate) fn transition(ctx: &DaemonContext, session_id: &str, to: SessionStatus) -> Result<Session> {
    for _ in 0..MAX_CAS_RETRIES {
        let session = ctx.db.get_session(session_id)?;
        let from = session.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidStateTransition { from, to });
        }
        if ctx.db.compare_and_set_status(session_id, from, to)? {
            publish_status_change(ctx, &session, Some(from), to);
            return ctx.db.get_session(session_id);
        }
        tracing::debug!("Status changed concurrently: session_id={}, retrying", session_id);
    }

    let current = ctx.db.get_session(session_id)?;
    Err(Error::InvalidStateTransition {
        from: current.status,
        to,
    })
}

/// 仅当当前状态为 `from` 时迁移到 `to`，返回是否迁移
pub(crate) fn transition_if(
    ctx: &DaemonContext,
    session_id: &str,
    from: SessionStatus,
    to: SessionStatus,
) -> Result<bool> {
    if !from.can_transition_to(to) {
        return Err(Error::InvalidStateTransition { from, to });
    }
    let session = ctx.db.get_session(session_id)?;
    if session.status != from {
        return Ok(false);
    }
    if !ctx.db.compare_and_set_status(session_id, from, to)? {
        return Ok(false);
    }
    publish_status_change(ctx, &session, Some(from), to);
    Ok(true)
}

/// 迁移到 failed 并记录错误信息；已处于终态时不做任何事
pub(crate) fn fail(ctx: &DaemonContext, session_id: &str, message: &str) -> Result<Option<Session>> {
    match transition(ctx, session_id, SessionStatus::Failed) {
        Ok(_) => {
            ctx.db.update_session(
                session_id,
                &SessionUpdate {
                    error_message: Some(message.to_string()),
                    ..Default::default()
                },
            )?;
            tracing::warn!("❌ Session failed: session_id={}, error={}", session_id, message);
            ctx.db.get_session(session_id).map(Some)
        }
        Err(Error::InvalidStateTransition { from, .. }) if from.is_terminal() => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn publish_status_change(
    ctx: &DaemonContext,
    session: &Session,
    old_status: Option<SessionStatus>,
    new_status: SessionStatus,
) {
    tracing::info!(
        "🔄 Session status: session_id={}, {} -> {}",
        session.id,
        old_status.map(|s| s.as_str()).unwrap_or("none"),
        new_status
    );
    ctx.publish(Event::SessionStatusChanged {
        session_id: session.id.clone(),
        run_id: session.run_id.clone(),
        old_status,
        new_status,
    });
}
