//! 数据库连接和操作
//!
//! 单个 SQLite 连接放在 `Mutex` 后面，每个方法只持锁完成一次短事务，
//! 不会跨越子进程或网络 IO。

use crate::config::{ConnectionMode, DbConfig};
use crate::error::{Error, Result};
use crate::migrations;
use crate::types::{
    now_ms, Approval, ApprovalStatus, ConversationEvent, ConversationEventInput,
    ConversationEventType, Session, SessionInput, SessionStatus, SessionUpdate,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const SESSION_COLUMNS: &str = r#"
    id, run_id, claude_session_id, parent_session_id, status, query, working_dir, model,
    system_prompt, append_system_prompt, max_turns, permission_prompt_tool,
    created_at, last_activity_at, completed_at,
    cost_usd, input_tokens, output_tokens, duration_ms, num_turns,
    result_content, error_message, skip_permissions, skip_permissions_expires_at
"#;

const EVENT_COLUMNS: &str = r#"
    id, session_id, claude_session_id, sequence, event_type, role, content,
    tool_id, tool_name, tool_input, tool_result_for_id, is_completed,
    approval_id, approval_status, created_at
"#;

const APPROVAL_COLUMNS: &str = r#"
    id, run_id, session_id, tool_name, tool_input, tool_use_id, status, comment,
    created_at, responded_at
"#;

/// 数据库连接
pub struct SessionDB {
    pub(crate) conn: Arc<Mutex<Connection>>,
    config: DbConfig,
}

impl SessionDB {
    /// 连接数据库
    pub fn connect(config: DbConfig) -> Result<Self> {
        let conn = match config.mode {
            ConnectionMode::Local => Self::open_local(&config)?,
            ConnectionMode::Memory => Connection::open_in_memory()?,
        };

        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        tracing::info!("Database connected: {}", config.url);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> Result<Self> {
        Self::connect(DbConfig::memory())
    }

    fn open_local(config: &DbConfig) -> Result<Connection> {
        let path = Path::new(&config.url);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("journal_mode={}", mode);
        Ok(conn)
    }

    /// 关闭前把 WAL 刷回主库
    pub fn checkpoint(&self) -> Result<()> {
        if self.config.mode == ConnectionMode::Memory {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        tracing::info!("💾 Database checkpointed: {}", self.config.url);
        Ok(())
    }

    // ==================== Session 操作 ====================

    /// 创建 Session（初始状态 starting）
    pub fn create_session(&self, input: &SessionInput) -> Result<Session> {
        let now = now_ms();
        {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                INSERT INTO sessions (
                    id, run_id, claude_session_id, parent_session_id, status, query, working_dir, model,
                    system_prompt, append_system_prompt, max_turns, permission_prompt_tool,
                    created_at, last_activity_at, skip_permissions, skip_permissions_expires_at
                )
                VALUES (?1, ?2, ?3, ?4, 'starting', ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, ?13, ?14)
                "#,
                params![
                    input.id,
                    input.run_id,
                    input.claude_session_id,
                    input.parent_session_id,
                    input.query,
                    input.working_dir,
                    input.model,
                    input.system_prompt,
                    input.append_system_prompt,
                    input.max_turns,
                    input.permission_prompt_tool,
                    now,
                    input.skip_permissions,
                    input.skip_permissions_expires_at,
                ],
            )?;
        }
        self.get_session(&input.id)
    }

    /// 获取单个 Session
    pub fn get_session(&self, id: &str) -> Result<Session> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::session_not_found(id))
    }

    /// 根据 run_id 获取 Session
    pub fn get_session_by_run_id(&self, run_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE run_id = ?1", SESSION_COLUMNS),
            params![run_id],
            session_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 列出 Sessions（按创建时间倒序，可按状态过滤）
    pub fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM sessions
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at DESC, rowid DESC
            "#,
            SESSION_COLUMNS
        ))?;

        let rows = stmt.query_map(params![status.map(|s| s.as_str())], session_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 列出处于任一给定状态的 Sessions
    pub fn list_sessions_with_statuses(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let placeholders: String = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {} FROM sessions WHERE status IN ({}) ORDER BY created_at ASC, rowid ASC",
            SESSION_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(statuses.iter().map(|s| s.as_str())),
            session_from_row,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 部分更新 Session（`None` 字段保持不变）
    pub fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<()> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE sessions SET
                claude_session_id = COALESCE(?2, claude_session_id),
                completed_at = COALESCE(?3, completed_at),
                cost_usd = COALESCE(?4, cost_usd),
                input_tokens = COALESCE(?5, input_tokens),
                output_tokens = COALESCE(?6, output_tokens),
                duration_ms = COALESCE(?7, duration_ms),
                num_turns = COALESCE(?8, num_turns),
                result_content = COALESCE(?9, result_content),
                error_message = COALESCE(?10, error_message),
                last_activity_at = ?11
            WHERE id = ?1
            "#,
            params![
                id,
                update.claude_session_id,
                update.completed_at,
                update.cost_usd,
                update.input_tokens,
                update.output_tokens,
                update.duration_ms,
                update.num_turns,
                update.result_content,
                update.error_message,
                now_ms(),
            ],
        )?;

        if count == 0 {
            return Err(Error::session_not_found(id));
        }
        Ok(())
    }

    /// 状态 compare-and-set：只有当前状态等于 `from` 时才写入 `to`
    ///
    /// 返回是否写入成功。进入终态时顺带记录 completed_at。
    pub fn compare_and_set_status(
        &self,
        id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let now = now_ms();
        let completed_at = to.is_terminal().then_some(now);
        let count = conn.execute(
            r#"
            UPDATE sessions SET
                status = ?3,
                last_activity_at = ?4,
                completed_at = COALESCE(completed_at, ?5)
            WHERE id = ?1 AND status = ?2
            "#,
            params![id, from.as_str(), to.as_str(), now, completed_at],
        )?;
        Ok(count > 0)
    }

    /// 设置跳过审批
    pub fn set_skip_permissions(
        &self,
        id: &str,
        enabled: bool,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE sessions SET skip_permissions = ?2, skip_permissions_expires_at = ?3
            WHERE id = ?1
            "#,
            params![id, enabled, if enabled { expires_at } else { None }],
        )?;
        if count == 0 {
            return Err(Error::session_not_found(id));
        }
        Ok(())
    }

    /// 跳过审批已过期的 Sessions
    pub fn list_expired_skip_permissions(&self, now: i64) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM sessions
            WHERE skip_permissions = 1
              AND skip_permissions_expires_at IS NOT NULL
              AND skip_permissions_expires_at <= ?1
            "#,
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now], session_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 清除已过期的跳过审批
    ///
    /// 条件更新：期间若被续期（过期时间改到 `now` 之后）则不清除。
    pub fn clear_expired_skip_permissions(&self, id: &str, now: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE sessions SET skip_permissions = 0, skip_permissions_expires_at = NULL
            WHERE id = ?1
              AND skip_permissions = 1
              AND skip_permissions_expires_at IS NOT NULL
              AND skip_permissions_expires_at <= ?2
            "#,
            params![id, now],
        )?;
        Ok(count > 0)
    }

    // ==================== Conversation 操作 ====================

    /// 追加对话事件，序号在同一事务内分配
    pub fn append_conversation_event(
        &self,
        session_id: &str,
        input: &ConversationEventInput,
    ) -> Result<ConversationEvent> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_ms();

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(Error::session_not_found(session_id));
        }

        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM conversation_events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        tx.execute(
            r#"
            INSERT INTO conversation_events (
                session_id, claude_session_id, sequence, event_type, role, content,
                tool_id, tool_name, tool_input, tool_result_for_id, is_completed, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)
            "#,
            params![
                session_id,
                input.claude_session_id,
                sequence,
                input.event_type.to_string(),
                input.role,
                input.content,
                input.tool_id,
                input.tool_name,
                input.tool_input,
                input.tool_result_for_id,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();

        // 工具结果到达 → 对应的工具调用完成
        if input.event_type == ConversationEventType::ToolResult {
            if let Some(ref tool_use_id) = input.tool_result_for_id {
                tx.execute(
                    r#"
                    UPDATE conversation_events SET is_completed = 1
                    WHERE session_id = ?1 AND event_type = 'tool_call' AND tool_id = ?2
                    "#,
                    params![session_id, tool_use_id],
                )?;
            }
        }

        tx.execute(
            "UPDATE sessions SET last_activity_at = ?2 WHERE id = ?1",
            params![session_id, now],
        )?;

        let event = tx.query_row(
            &format!("SELECT {} FROM conversation_events WHERE id = ?1", EVENT_COLUMNS),
            params![id],
            event_from_row,
        )?;
        tx.commit()?;
        Ok(event)
    }

    /// 获取单个 Session 的对话（按序号）
    pub fn get_conversation(&self, session_id: &str) -> Result<Vec<ConversationEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversation_events WHERE session_id = ?1 ORDER BY sequence ASC",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_id], event_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 沿 parent 链获取合并对话：祖先在前，当前会话在后
    pub fn get_conversation_with_parents(&self, session_id: &str) -> Result<Vec<ConversationEvent>> {
        let chain = self.session_chain(session_id)?;
        let mut events = Vec::new();
        for id in chain.iter().rev() {
            events.extend(self.get_conversation(id)?);
        }
        Ok(events)
    }

    /// 从当前会话向上到根的 ID 列表
    fn session_chain(&self, session_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut chain = Vec::new();
        let mut current = Some(session_id.to_string());

        while let Some(id) = current {
            if chain.contains(&id) {
                tracing::warn!("Parent cycle detected at session {}", id);
                break;
            }
            let parent: Option<Option<String>> = conn
                .query_row(
                    "SELECT parent_session_id FROM sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match parent {
                Some(parent) => {
                    chain.push(id);
                    current = parent;
                }
                None if chain.is_empty() => return Err(Error::session_not_found(id)),
                None => break,
            }
        }

        Ok(chain)
    }

    /// 根据关联的审批 ID 查找工具调用事件
    pub fn get_event_by_approval(&self, approval_id: &str) -> Result<Option<ConversationEvent>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM conversation_events WHERE approval_id = ?1",
                EVENT_COLUMNS
            ),
            params![approval_id],
            event_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 更新已关联事件的审批状态
    pub fn update_event_approval_status(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "UPDATE conversation_events SET approval_status = ?2 WHERE approval_id = ?1",
            params![approval_id, status.to_string()],
        )?;
        Ok(count)
    }

    // ==================== 审批关联 ====================

    /// 正向关联：审批 → 最近的未关联工具调用事件
    ///
    /// 审批带 tool_use_id 时只按 ID 匹配，否则按工具名匹配。
    /// 审批已挂在某个事件上时直接返回该事件（幂等）。
    pub fn correlate_approval(&self, approval: &Approval) -> Result<Option<ConversationEvent>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {} FROM conversation_events WHERE approval_id = ?1",
                    EVENT_COLUMNS
                ),
                params![approval.id],
                event_from_row,
            )
            .optional()?;
        if existing.is_some() {
            return Ok(existing);
        }

        let candidate: Option<i64> = match approval.tool_use_id {
            Some(ref tool_use_id) => tx
                .query_row(
                    r#"
                    SELECT e.id FROM conversation_events e
                    JOIN sessions s ON s.id = e.session_id
                    WHERE s.run_id = ?1 AND e.event_type = 'tool_call'
                      AND e.approval_id IS NULL AND e.is_completed = 0
                      AND e.tool_id = ?2
                    ORDER BY e.sequence DESC LIMIT 1
                    "#,
                    params![approval.run_id, tool_use_id],
                    |row| row.get(0),
                )
                .optional()?,
            None => tx
                .query_row(
                    r#"
                    SELECT e.id FROM conversation_events e
                    JOIN sessions s ON s.id = e.session_id
                    WHERE s.run_id = ?1 AND e.event_type = 'tool_call'
                      AND e.approval_id IS NULL AND e.is_completed = 0
                      AND e.tool_name = ?2
                    ORDER BY e.sequence DESC LIMIT 1
                    "#,
                    params![approval.run_id, approval.tool_name],
                    |row| row.get(0),
                )
                .optional()?,
        };

        let Some(event_id) = candidate else {
            return Ok(None);
        };

        let updated = tx.execute(
            r#"
            UPDATE conversation_events SET approval_id = ?2, approval_status = ?3
            WHERE id = ?1 AND approval_id IS NULL
            "#,
            params![event_id, approval.id, approval.status.to_string()],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let event = tx.query_row(
            &format!("SELECT {} FROM conversation_events WHERE id = ?1", EVENT_COLUMNS),
            params![event_id],
            event_from_row,
        )?;
        tx.commit()?;
        Ok(Some(event))
    }

    /// 反向关联：工具调用事件 → 最早的未关联审批
    ///
    /// 已决定（含自动批准）的审批同样会挂上，事件上写入审批的当前状态。
    pub fn correlate_event(
        &self,
        event: &ConversationEvent,
        run_id: &str,
    ) -> Result<Option<(ConversationEvent, Approval)>> {
        if event.event_type != ConversationEventType::ToolCall || event.approval_id.is_some() {
            return Ok(None);
        }
        let Some(ref tool_name) = event.tool_name else {
            return Ok(None);
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let approval = tx
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM approvals a
                    WHERE a.run_id = ?1
                      AND NOT EXISTS (SELECT 1 FROM conversation_events e WHERE e.approval_id = a.id)
                      AND ((?2 IS NOT NULL AND a.tool_use_id = ?2)
                           OR (a.tool_use_id IS NULL AND a.tool_name = ?3))
                    ORDER BY a.created_at ASC, a.rowid ASC LIMIT 1
                    "#,
                    APPROVAL_COLUMNS
                ),
                params![run_id, event.tool_id, tool_name],
                approval_from_row,
            )
            .optional()?;

        let Some(approval) = approval else {
            return Ok(None);
        };

        let updated = tx.execute(
            r#"
            UPDATE conversation_events SET approval_id = ?2, approval_status = ?3
            WHERE id = ?1 AND approval_id IS NULL
            "#,
            params![event.id, approval.id, approval.status.to_string()],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let event = tx.query_row(
            &format!("SELECT {} FROM conversation_events WHERE id = ?1", EVENT_COLUMNS),
            params![event.id],
            event_from_row,
        )?;
        tx.commit()?;
        Ok(Some((event, approval)))
    }

    // ==================== Approval 操作 ====================

    /// 创建审批
    pub fn create_approval(&self, approval: &Approval) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO approvals (
                id, run_id, session_id, tool_name, tool_input, tool_use_id, status, comment,
                created_at, responded_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                approval.id,
                approval.run_id,
                approval.session_id,
                approval.tool_name,
                approval.tool_input.to_string(),
                approval.tool_use_id,
                approval.status.to_string(),
                approval.comment,
                approval.created_at,
                approval.responded_at,
            ],
        )?;
        Ok(())
    }

    /// 获取审批
    pub fn get_approval(&self, id: &str) -> Result<Approval> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM approvals WHERE id = ?1", APPROVAL_COLUMNS),
            params![id],
            approval_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::approval_not_found(id))
    }

    /// 列出审批（可按会话、状态过滤）
    pub fn list_approvals(
        &self,
        session_id: Option<&str>,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<Approval>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM approvals
            WHERE (?1 IS NULL OR session_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at ASC, rowid ASC
            "#,
            APPROVAL_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![session_id, status.map(|s| s.to_string())],
            approval_from_row,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 写入审批决定；只对 pending 审批生效
    pub fn resolve_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        comment: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            r#"
            UPDATE approvals SET status = ?2, comment = ?3, responded_at = ?4
            WHERE id = ?1 AND status = 'pending'
            "#,
            params![id, status.to_string(), comment, now_ms()],
        )?;
        Ok(count > 0)
    }
}

fn parse_text_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        run_id: row.get(1)?,
        claude_session_id: row.get(2)?,
        parent_session_id: row.get(3)?,
        status: parse_text_column(row, 4)?,
        query: row.get(5)?,
        working_dir: row.get(6)?,
        model: row.get(7)?,
        system_prompt: row.get(8)?,
        append_system_prompt: row.get(9)?,
        max_turns: row.get(10)?,
        permission_prompt_tool: row.get(11)?,
        created_at: row.get(12)?,
        last_activity_at: row.get(13)?,
        completed_at: row.get(14)?,
        cost_usd: row.get(15)?,
        input_tokens: row.get(16)?,
        output_tokens: row.get(17)?,
        duration_ms: row.get(18)?,
        num_turns: row.get(19)?,
        result_content: row.get(20)?,
        error_message: row.get(21)?,
        skip_permissions: row.get(22)?,
        skip_permissions_expires_at: row.get(23)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationEvent> {
    Ok(ConversationEvent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        claude_session_id: row.get(2)?,
        sequence: row.get(3)?,
        event_type: parse_text_column(row, 4)?,
        role: row.get(5)?,
        content: row.get(6)?,
        tool_id: row.get(7)?,
        tool_name: row.get(8)?,
        tool_input: row.get(9)?,
        tool_result_for_id: row.get(10)?,
        is_completed: row.get(11)?,
        approval_id: row.get(12)?,
        approval_status: row
            .get::<_, Option<String>>(13)?
            .and_then(|s| s.parse().ok()),
        created_at: row.get(14)?,
    })
}

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<Approval> {
    let raw_input: String = row.get(4)?;
    Ok(Approval {
        id: row.get(0)?,
        run_id: row.get(1)?,
        session_id: row.get(2)?,
        tool_name: row.get(3)?,
        tool_input: serde_json::from_str(&raw_input)
            .unwrap_or(serde_json::Value::String(raw_input)),
        tool_use_id: row.get(5)?,
        status: parse_text_column(row, 6)?,
        comment: row.get(7)?,
        created_at: row.get(8)?,
        responded_at: row.get(9)?,
    })
}
