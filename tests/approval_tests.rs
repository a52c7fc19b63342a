//! 审批关联集成测试

use ai_agent_daemon::approval::record_event;
use ai_agent_daemon::{
    ApprovalManager, ApprovalStatus, ConversationEventInput, DaemonConfig, DaemonContext, Error,
    Event, EventType, Session, SessionInput, SessionStatus, SubscriptionFilter,
    AUTO_APPROVE_COMMENT,
};
use serde_json::json;

/// 内存数据库 + 一个 running 的会话
fn setup(skip_permissions: bool) -> (DaemonContext, ApprovalManager, Session) {
    let ctx = DaemonContext::in_memory(DaemonConfig::default()).unwrap();
    ctx.db
        .create_session(&SessionInput {
            id: "session-1".to_string(),
            run_id: "run-1".to_string(),
            query: "write a file".to_string(),
            skip_permissions,
            ..Default::default()
        })
        .unwrap();
    assert!(ctx
        .db
        .compare_and_set_status("session-1", SessionStatus::Starting, SessionStatus::Running)
        .unwrap());
    let session = ctx.db.get_session("session-1").unwrap();
    let approvals = ApprovalManager::new(ctx.clone());
    (ctx, approvals, session)
}

fn write_call(tool_id: &str) -> ConversationEventInput {
    ConversationEventInput::tool_call(tool_id, "Write", &json!({"file_path": "notes.txt"}))
}

fn status(ctx: &DaemonContext) -> SessionStatus {
    ctx.db.get_session("session-1").unwrap().status
}

#[tokio::test]
async fn test_approval_before_tool_call() {
    let (ctx, approvals, session) = setup(false);

    let created = approvals
        .create_approval("run-1", "Write", json!({"file_path": "notes.txt"}), None)
        .await
        .unwrap();
    assert!(created.correlated_event.is_none());
    assert_eq!(created.approval.session_id.as_deref(), Some("session-1"));
    assert_eq!(status(&ctx), SessionStatus::Running);

    let event = record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();
    assert_eq!(event.approval_id.as_deref(), Some(created.approval.id.as_str()));
    assert_eq!(event.approval_status, Some(ApprovalStatus::Pending));
    assert_eq!(status(&ctx), SessionStatus::WaitingInput);
}

#[tokio::test]
async fn test_tool_call_before_approval() {
    let (ctx, approvals, session) = setup(false);

    let event = record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();
    assert!(event.approval_id.is_none());

    let created = approvals
        .create_approval("run-1", "Write", json!({"file_path": "notes.txt"}), None)
        .await
        .unwrap();
    let correlated = created.correlated_event.expect("should correlate");
    assert_eq!(correlated.id, event.id);
    assert_eq!(status(&ctx), SessionStatus::WaitingInput);
}

#[tokio::test]
async fn test_both_orders_end_in_same_state() {
    let (ctx_a, approvals_a, session_a) = setup(false);
    approvals_a
        .create_approval("run-1", "Write", json!({}), None)
        .await
        .unwrap();
    record_event(&ctx_a, &session_a, &write_call("toolu_1")).await.unwrap();

    let (ctx_b, approvals_b, session_b) = setup(false);
    record_event(&ctx_b, &session_b, &write_call("toolu_1")).await.unwrap();
    approvals_b
        .create_approval("run-1", "Write", json!({}), None)
        .await
        .unwrap();

    let conv_a = ctx_a.db.get_conversation("session-1").unwrap();
    let conv_b = ctx_b.db.get_conversation("session-1").unwrap();
    assert_eq!(conv_a.len(), conv_b.len());
    assert!(conv_a[0].approval_id.is_some());
    assert!(conv_b[0].approval_id.is_some());
    assert_eq!(status(&ctx_a), status(&ctx_b));
}

#[tokio::test]
async fn test_decision_resumes_session_and_publishes() {
    let (ctx, approvals, session) = setup(false);
    let mut sub = ctx
        .broadcaster
        .subscribe(SubscriptionFilter::of_types([EventType::ApprovalResolved]).with_run("run-1"));

    record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();
    let created = approvals
        .create_approval("run-1", "Write", json!({}), Some("toolu_1".to_string()))
        .await
        .unwrap();
    assert_eq!(status(&ctx), SessionStatus::WaitingInput);

    let decided = approvals
        .decide(&created.approval.id, "tool_call", "approve", Some("looks fine".to_string()))
        .await
        .unwrap();
    assert_eq!(decided.status, ApprovalStatus::Approved);
    assert_eq!(decided.comment.as_deref(), Some("looks fine"));
    assert!(decided.responded_at.is_some());
    assert_eq!(status(&ctx), SessionStatus::Running);

    let event = ctx
        .db
        .get_event_by_approval(&created.approval.id)
        .unwrap()
        .unwrap();
    assert_eq!(event.approval_status, Some(ApprovalStatus::Approved));

    match sub.try_recv() {
        Some(Event::ApprovalResolved { status, .. }) => assert_eq!(status, ApprovalStatus::Approved),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_deny_records_status() {
    let (ctx, approvals, session) = setup(false);
    record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();
    let created = approvals
        .create_approval("run-1", "Write", json!({}), None)
        .await
        .unwrap();

    let decided = approvals
        .decide(&created.approval.id, "tool_call", "deny", None)
        .await
        .unwrap();
    assert_eq!(decided.status, ApprovalStatus::Denied);
    assert_eq!(status(&ctx), SessionStatus::Running);
}

#[tokio::test]
async fn test_session_stays_waiting_while_other_approvals_pending() {
    let (ctx, approvals, session) = setup(false);
    record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();
    record_event(&ctx, &session, &write_call("toolu_2")).await.unwrap();

    let first = approvals
        .create_approval("run-1", "Write", json!({}), Some("toolu_1".to_string()))
        .await
        .unwrap();
    let second = approvals
        .create_approval("run-1", "Write", json!({}), Some("toolu_2".to_string()))
        .await
        .unwrap();
    assert!(first.correlated_event.is_some());
    assert!(second.correlated_event.is_some());

    approvals
        .decide(&first.approval.id, "tool_call", "approve", None)
        .await
        .unwrap();
    assert_eq!(status(&ctx), SessionStatus::WaitingInput);

    approvals
        .decide(&second.approval.id, "tool_call", "approve", None)
        .await
        .unwrap();
    assert_eq!(status(&ctx), SessionStatus::Running);
}

#[tokio::test]
async fn test_tool_use_id_must_match() {
    let (ctx, approvals, session) = setup(false);
    record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();

    let created = approvals
        .create_approval("run-1", "Write", json!({}), Some("toolu_other".to_string()))
        .await
        .unwrap();
    assert!(created.correlated_event.is_none());
    assert_eq!(status(&ctx), SessionStatus::Running);

    // 对应的事件到达后才关联
    let event = record_event(&ctx, &session, &write_call("toolu_other")).await.unwrap();
    assert_eq!(event.approval_id.as_deref(), Some(created.approval.id.as_str()));
}

#[tokio::test]
async fn test_other_run_is_not_correlated() {
    let (ctx, approvals, session) = setup(false);
    record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();

    let created = approvals
        .create_approval("run-unknown", "Write", json!({}), None)
        .await
        .unwrap();
    assert!(created.approval.session_id.is_none());
    assert!(created.correlated_event.is_none());
    assert_eq!(status(&ctx), SessionStatus::Running);
}

#[tokio::test]
async fn test_skip_permissions_auto_approves() {
    let (ctx, approvals, session) = setup(true);
    let mut sub = ctx.broadcaster.subscribe(SubscriptionFilter::all());

    record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();
    let created = approvals
        .create_approval("run-1", "Write", json!({}), None)
        .await
        .unwrap();

    assert_eq!(created.approval.status, ApprovalStatus::Approved);
    assert_eq!(created.approval.comment.as_deref(), Some(AUTO_APPROVE_COMMENT));
    assert_eq!(
        created.correlated_event.unwrap().approval_status,
        Some(ApprovalStatus::Approved)
    );
    assert_eq!(status(&ctx), SessionStatus::Running);

    let types: Vec<EventType> = std::iter::from_fn(|| sub.try_recv())
        .map(|e| e.event_type())
        .collect();
    assert!(types.contains(&EventType::NewApproval));
    assert!(types.contains(&EventType::ApprovalResolved));
}

#[tokio::test]
async fn test_auto_approved_before_tool_call_is_attached() {
    let (ctx, approvals, session) = setup(true);

    let created = approvals
        .create_approval("run-1", "Write", json!({}), None)
        .await
        .unwrap();
    assert_eq!(created.approval.status, ApprovalStatus::Approved);
    assert!(created.correlated_event.is_none());

    let event = record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();
    assert_eq!(event.approval_id.as_deref(), Some(created.approval.id.as_str()));
    assert_eq!(event.approval_status, Some(ApprovalStatus::Approved));
    // 已批准的审批不会阻塞会话
    assert_eq!(status(&ctx), SessionStatus::Running);
}

#[tokio::test]
async fn test_decided_before_tool_call_is_attached() {
    let (ctx, approvals, session) = setup(false);

    let created = approvals
        .create_approval("run-1", "Write", json!({}), Some("toolu_1".to_string()))
        .await
        .unwrap();
    approvals
        .decide(&created.approval.id, "tool_call", "deny", None)
        .await
        .unwrap();

    let event = record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap();
    assert_eq!(event.approval_id.as_deref(), Some(created.approval.id.as_str()));
    assert_eq!(event.approval_status, Some(ApprovalStatus::Denied));
    assert_eq!(status(&ctx), SessionStatus::Running);
}

#[tokio::test]
async fn test_decision_order_does_not_change_final_state() {
    // 事件 → 审批 → 决定
    let (ctx_a, approvals_a, session_a) = setup(false);
    record_event(&ctx_a, &session_a, &write_call("toolu_1")).await.unwrap();
    let a = approvals_a
        .create_approval("run-1", "Write", json!({}), None)
        .await
        .unwrap();
    approvals_a
        .decide(&a.approval.id, "tool_call", "approve", None)
        .await
        .unwrap();

    // 审批 → 决定 → 事件
    let (ctx_b, approvals_b, session_b) = setup(false);
    let b = approvals_b
        .create_approval("run-1", "Write", json!({}), None)
        .await
        .unwrap();
    approvals_b
        .decide(&b.approval.id, "tool_call", "approve", None)
        .await
        .unwrap();
    record_event(&ctx_b, &session_b, &write_call("toolu_1")).await.unwrap();

    let event_a = &ctx_a.db.get_conversation("session-1").unwrap()[0];
    let event_b = &ctx_b.db.get_conversation("session-1").unwrap()[0];
    assert_eq!(event_a.approval_status, Some(ApprovalStatus::Approved));
    assert_eq!(event_b.approval_status, event_a.approval_status);
    assert!(event_b.approval_id.is_some());
    assert_eq!(status(&ctx_a), status(&ctx_b));
}

#[tokio::test]
async fn test_run_locks_released_after_approval_calls() {
    let (ctx, approvals, _session) = setup(false);

    let unknown = approvals
        .create_approval("run-unknown", "Write", json!({}), None)
        .await
        .unwrap();
    assert!(ctx.locks.is_empty());

    approvals
        .decide(&unknown.approval.id, "tool_call", "approve", None)
        .await
        .unwrap();
    assert!(ctx.locks.is_empty());

    // 失败的决定同样不留下锁
    approvals
        .decide(&unknown.approval.id, "tool_call", "deny", None)
        .await
        .unwrap_err();
    assert!(ctx.locks.is_empty());
}

#[tokio::test]
async fn test_decide_unknown_approval_is_not_found() {
    let (_ctx, approvals, _session) = setup(false);
    let err = approvals
        .decide("missing", "tool_call", "approve", None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.code(), 404);
}

#[tokio::test]
async fn test_human_contact_rejected_before_lookup() {
    let (_ctx, approvals, _session) = setup(false);
    let err = approvals
        .decide("missing", "human_contact", "respond", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDecisionType(_)));
    assert_eq!(err.to_string(), "human contact approvals are no longer supported");
}

#[tokio::test]
async fn test_decide_twice_is_rejected() {
    let (_ctx, approvals, _session) = setup(false);
    let created = approvals
        .create_approval("run-1", "Bash", json!({"command": "ls"}), None)
        .await
        .unwrap();

    approvals
        .decide(&created.approval.id, "tool_call", "approve", None)
        .await
        .unwrap();
    let err = approvals
        .decide(&created.approval.id, "tool_call", "deny", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(
        approvals.get_approval(&created.approval.id).unwrap().status,
        ApprovalStatus::Approved
    );
}

#[tokio::test]
async fn test_list_approvals_by_status() {
    let (_ctx, approvals, _session) = setup(false);
    let a = approvals
        .create_approval("run-1", "Write", json!({}), None)
        .await
        .unwrap();
    approvals
        .create_approval("run-1", "Bash", json!({}), None)
        .await
        .unwrap();
    approvals
        .decide(&a.approval.id, "tool_call", "deny", None)
        .await
        .unwrap();

    let pending = approvals
        .list_approvals(Some("session-1"), Some(ApprovalStatus::Pending))
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tool_name, "Bash");
    assert_eq!(approvals.list_approvals(None, None).unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_approval_and_tool_call_correlate_once() {
    for _ in 0..20 {
        let (ctx, approvals, session) = setup(false);
        let approvals = std::sync::Arc::new(approvals);

        let a = {
            let approvals = approvals.clone();
            tokio::spawn(async move {
                approvals
                    .create_approval("run-1", "Write", json!({}), None)
                    .await
                    .unwrap()
            })
        };
        let e = {
            let ctx = ctx.clone();
            tokio::spawn(async move { record_event(&ctx, &session, &write_call("toolu_1")).await.unwrap() })
        };
        let created = a.await.unwrap();
        e.await.unwrap();

        let conversation = ctx.db.get_conversation("session-1").unwrap();
        assert_eq!(conversation.len(), 1);
        assert_eq!(
            conversation[0].approval_id.as_deref(),
            Some(created.approval.id.as_str())
        );
        assert_eq!(status(&ctx), SessionStatus::WaitingInput);
    }
}
