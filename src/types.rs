//! 数据类型定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 会话状态
///
/// ```text
/// starting → running ⇄ waiting_input → {completed, failed}
/// running / waiting_input → interrupting → interrupted
/// 任意非终态 → failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    WaitingInput,
    Interrupting,
    Interrupted,
    Completed,
    Failed,
}

impl SessionStatus {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Interrupted
        )
    }

    /// 是否允许迁移到目标状态
    pub fn can_transition_to(self, target: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, target) {
            (Starting, Running | Failed) => true,
            (Running, WaitingInput | Completed | Failed | Interrupting) => true,
            (WaitingInput, Running | Completed | Failed | Interrupting) => true,
            (Interrupting, Interrupted | Failed) => true,
            _ => false,
        }
    }

    /// 可以被中断的状态（需要有存活的子进程）
    pub fn is_interruptible(self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::WaitingInput)
    }

    /// 可以作为 continuation 父会话的状态
    pub fn is_continuable(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Running)
    }

    /// 上一个 daemon 实例遗留、重启后不可能再有子进程的状态
    pub fn is_orphanable(self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Running | SessionStatus::WaitingInput
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::WaitingInput => "waiting_input",
            SessionStatus::Interrupting => "interrupting",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "waiting_input" => Ok(SessionStatus::WaitingInput),
            "interrupting" => Ok(SessionStatus::Interrupting),
            "interrupted" => Ok(SessionStatus::Interrupted),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 审批状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            _ => Err(format!("Invalid approval status: {}", s)),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Denied => write!(f, "denied"),
        }
    }
}

/// 对话事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEventType {
    Message,
    ToolCall,
    ToolResult,
    System,
}

impl FromStr for ConversationEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(ConversationEventType::Message),
            "tool_call" => Ok(ConversationEventType::ToolCall),
            "tool_result" => Ok(ConversationEventType::ToolResult),
            "system" => Ok(ConversationEventType::System),
            _ => Err(format!("Invalid conversation event type: {}", s)),
        }
    }
}

impl fmt::Display for ConversationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationEventType::Message => write!(f, "message"),
            ConversationEventType::ToolCall => write!(f, "tool_call"),
            ConversationEventType::ToolResult => write!(f, "tool_result"),
            ConversationEventType::System => write!(f, "system"),
        }
    }
}

/// 会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub run_id: String,
    /// 子进程上报的外部 agent 会话 ID（resume 需要）
    pub claude_session_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub status: SessionStatus,
    pub query: String,
    pub working_dir: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub max_turns: Option<i64>,
    pub permission_prompt_tool: Option<String>,
    // 时间戳（毫秒）
    pub created_at: i64,
    pub last_activity_at: i64,
    pub completed_at: Option<i64>,
    // 用量
    pub cost_usd: Option<f64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub num_turns: Option<i64>,
    // 结果
    pub result_content: Option<String>,
    pub error_message: Option<String>,
    // 跳过审批
    pub skip_permissions: bool,
    pub skip_permissions_expires_at: Option<i64>,
}

impl Session {
    /// 跳过审批是否在 `now` 时刻生效
    pub fn skip_permissions_active(&self, now: i64) -> bool {
        self.skip_permissions
            && self
                .skip_permissions_expires_at
                .map_or(true, |expires_at| expires_at > now)
    }
}

/// 会话输入（创建用）
#[derive(Debug, Clone, Default)]
pub struct SessionInput {
    pub id: String,
    pub run_id: String,
    pub parent_session_id: Option<String>,
    pub claude_session_id: Option<String>,
    pub query: String,
    pub working_dir: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub max_turns: Option<i64>,
    pub permission_prompt_tool: Option<String>,
    pub skip_permissions: bool,
    pub skip_permissions_expires_at: Option<i64>,
}

/// 会话部分更新；`None` 表示保持不变
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub claude_session_id: Option<String>,
    pub completed_at: Option<i64>,
    pub cost_usd: Option<f64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub result_content: Option<String>,
    pub error_message: Option<String>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.claude_session_id.is_none()
            && self.completed_at.is_none()
            && self.cost_usd.is_none()
            && self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.duration_ms.is_none()
            && self.num_turns.is_none()
            && self.result_content.is_none()
            && self.error_message.is_none()
    }
}

/// 对话事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub id: i64,
    pub session_id: String,
    pub claude_session_id: Option<String>,
    /// 会话内单调递增序号（从 1 开始）
    pub sequence: i64,
    pub event_type: ConversationEventType,
    pub role: Option<String>,
    pub content: Option<String>,
    pub tool_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_result_for_id: Option<String>,
    pub is_completed: bool,
    pub approval_id: Option<String>,
    pub approval_status: Option<ApprovalStatus>,
    pub created_at: i64,
}

/// 对话事件输入（写入用）
#[derive(Debug, Clone)]
pub struct ConversationEventInput {
    pub event_type: ConversationEventType,
    pub claude_session_id: Option<String>,
    pub role: Option<String>,
    pub content: Option<String>,
    pub tool_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_result_for_id: Option<String>,
}

impl ConversationEventInput {
    /// 普通消息
    pub fn message(role: &str, content: impl Into<String>) -> Self {
        Self {
            event_type: ConversationEventType::Message,
            claude_session_id: None,
            role: Some(role.to_string()),
            content: Some(content.into()),
            tool_id: None,
            tool_name: None,
            tool_input: None,
            tool_result_for_id: None,
        }
    }

    /// 工具调用
    pub fn tool_call(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: &serde_json::Value,
    ) -> Self {
        Self {
            event_type: ConversationEventType::ToolCall,
            claude_session_id: None,
            role: Some("assistant".to_string()),
            content: None,
            tool_id: Some(tool_id.into()),
            tool_name: Some(tool_name.into()),
            tool_input: Some(tool_input.to_string()),
            tool_result_for_id: None,
        }
    }

    /// 工具结果
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            event_type: ConversationEventType::ToolResult,
            claude_session_id: None,
            role: Some("user".to_string()),
            content: Some(content.into()),
            tool_id: None,
            tool_name: None,
            tool_input: None,
            tool_result_for_id: Some(tool_use_id.into()),
        }
    }

    pub fn with_claude_session_id(mut self, claude_session_id: Option<String>) -> Self {
        self.claude_session_id = claude_session_id;
        self
    }
}

/// 审批
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub run_id: String,
    pub session_id: Option<String>,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub tool_use_id: Option<String>,
    pub status: ApprovalStatus,
    pub comment: Option<String>,
    pub created_at: i64,
    pub responded_at: Option<i64>,
}

/// 当前时间戳 (毫秒)
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::WaitingInput,
            SessionStatus::Interrupting,
            SessionStatus::Interrupted,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_starting_cannot_reach_waiting_input() {
        assert!(!SessionStatus::Starting.can_transition_to(SessionStatus::WaitingInput));
        assert!(!SessionStatus::Starting.can_transition_to(SessionStatus::Interrupting));
        assert!(SessionStatus::Starting.can_transition_to(SessionStatus::Running));
        assert!(SessionStatus::Starting.can_transition_to(SessionStatus::Failed));
    }

    #[test]
    fn test_terminal_states_have_no_edges() {
        let all = [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::WaitingInput,
            SessionStatus::Interrupting,
            SessionStatus::Interrupted,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_every_non_terminal_state_can_fail() {
        for from in [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::WaitingInput,
            SessionStatus::Interrupting,
        ] {
            assert!(from.can_transition_to(SessionStatus::Failed));
        }
    }

    #[test]
    fn test_interrupt_edges() {
        assert!(SessionStatus::Running.can_transition_to(SessionStatus::Interrupting));
        assert!(SessionStatus::WaitingInput.can_transition_to(SessionStatus::Interrupting));
        assert!(SessionStatus::Interrupting.can_transition_to(SessionStatus::Interrupted));
        assert!(!SessionStatus::Running.can_transition_to(SessionStatus::Interrupted));
    }

    #[test]
    fn test_skip_permissions_active() {
        let mut session = Session {
            id: "s".into(),
            run_id: "r".into(),
            claude_session_id: None,
            parent_session_id: None,
            status: SessionStatus::Running,
            query: "q".into(),
            working_dir: None,
            model: None,
            system_prompt: None,
            append_system_prompt: None,
            max_turns: None,
            permission_prompt_tool: None,
            created_at: 0,
            last_activity_at: 0,
            completed_at: None,
            cost_usd: None,
            input_tokens: None,
            output_tokens: None,
            duration_ms: None,
            num_turns: None,
            result_content: None,
            error_message: None,
            skip_permissions: true,
            skip_permissions_expires_at: None,
        };
        assert!(session.skip_permissions_active(100));

        session.skip_permissions_expires_at = Some(50);
        assert!(!session.skip_permissions_active(100));
        assert!(session.skip_permissions_active(10));

        session.skip_permissions = false;
        assert!(!session.skip_permissions_active(10));
    }
}
