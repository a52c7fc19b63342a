//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- Sessions 表
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL UNIQUE,
    claude_session_id TEXT,                  -- 子进程上报后写入
    parent_session_id TEXT REFERENCES sessions(id),
    status TEXT NOT NULL DEFAULT 'starting',
    query TEXT NOT NULL,
    working_dir TEXT,
    model TEXT,
    system_prompt TEXT,
    append_system_prompt TEXT,
    max_turns INTEGER,
    permission_prompt_tool TEXT,
    -- 时间戳 (毫秒)
    created_at INTEGER NOT NULL,
    last_activity_at INTEGER NOT NULL,
    completed_at INTEGER,
    -- 用量
    cost_usd REAL,
    input_tokens INTEGER,
    output_tokens INTEGER,
    duration_ms INTEGER,
    num_turns INTEGER,
    -- 结果
    result_content TEXT,
    error_message TEXT,
    -- 跳过审批
    skip_permissions INTEGER NOT NULL DEFAULT 0,
    skip_permissions_expires_at INTEGER
);

-- Conversation events 表
CREATE TABLE IF NOT EXISTS conversation_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    claude_session_id TEXT,
    sequence INTEGER NOT NULL,
    event_type TEXT NOT NULL,          -- "message" | "tool_call" | "tool_result" | "system"
    role TEXT,
    content TEXT,
    tool_id TEXT,
    tool_name TEXT,
    tool_input TEXT,
    tool_result_for_id TEXT,
    is_completed INTEGER NOT NULL DEFAULT 0,
    approval_id TEXT,                  -- 关联后写入，之后只更新 approval_status
    approval_status TEXT,              -- pending, approved, denied, NULL
    created_at INTEGER NOT NULL,
    UNIQUE (session_id, sequence)
);

-- Approvals 表
CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    session_id TEXT,
    tool_name TEXT NOT NULL,
    tool_input TEXT NOT NULL,
    tool_use_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    comment TEXT,
    created_at INTEGER NOT NULL,
    responded_at INTEGER
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);
CREATE INDEX IF NOT EXISTS idx_sessions_skip_permissions ON sessions(skip_permissions_expires_at) WHERE skip_permissions = 1;
CREATE INDEX IF NOT EXISTS idx_events_session ON conversation_events(session_id, sequence);
CREATE INDEX IF NOT EXISTS idx_events_uncorrelated ON conversation_events(session_id, tool_name) WHERE event_type = 'tool_call' AND approval_id IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_approval ON conversation_events(approval_id) WHERE approval_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_approvals_run ON approvals(run_id, status);
CREATE INDEX IF NOT EXISTS idx_approvals_session ON approvals(session_id);
"#;

/// 获取完整 Schema
pub fn full_schema() -> String {
    SCHEMA_SQL.to_string()
}
