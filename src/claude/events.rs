//! Agent stream-json 输出解析
//!
//! 子进程每行输出一个 JSON 事件，按 `type` 字段分派。
//! 未知事件类型和未知内容块被忽略，不会中断解析。

use serde::Deserialize;
use serde_json::Value;

use crate::types::{ConversationEventInput, SessionUpdate};

/// 一行 stream-json 事件
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// 系统事件（init 时携带外部会话 ID）
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        #[serde(default)]
        session_id: Option<String>,
        message: StreamMessage,
    },
    User {
        #[serde(default)]
        session_id: Option<String>,
        message: StreamMessage,
    },
    /// 结束事件：结果文本和用量
    Result(ResultEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub content: MessageContent,
}

/// 消息内容：纯文本或内容块数组
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub num_turns: Option<i64>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
}

impl StreamEvent {
    /// 解析一行输出；非 JSON 或结构不符时返回 None
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!("Skipping unparseable agent output: {} ({})", truncate(line, 120), e);
                None
            }
        }
    }

    /// 事件携带的外部会话 ID
    pub fn session_id(&self) -> Option<&str> {
        match self {
            StreamEvent::System { session_id, .. }
            | StreamEvent::Assistant { session_id, .. }
            | StreamEvent::User { session_id, .. } => session_id.as_deref(),
            StreamEvent::Result(result) => result.session_id.as_deref(),
            StreamEvent::Unknown => None,
        }
    }

    /// 转换为待写入的对话事件（保持内容块顺序）
    pub fn conversation_inputs(&self) -> Vec<ConversationEventInput> {
        let claude_session_id = self.session_id().map(str::to_string);
        let (role, message) = match self {
            StreamEvent::Assistant { message, .. } => ("assistant", message),
            StreamEvent::User { message, .. } => ("user", message),
            _ => return Vec::new(),
        };

        let inputs = match &message.content {
            MessageContent::Text(text) => vec![ConversationEventInput::message(role, text.clone())],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => {
                        Some(ConversationEventInput::message(role, text.clone()))
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        Some(ConversationEventInput::tool_call(id.clone(), name.clone(), input))
                    }
                    ContentBlock::ToolResult { tool_use_id, content, .. } => Some(
                        ConversationEventInput::tool_result(tool_use_id.clone(), result_text(content)),
                    ),
                    ContentBlock::Unknown => None,
                })
                .collect(),
        };

        inputs
            .into_iter()
            .map(|input| input.with_claude_session_id(claude_session_id.clone()))
            .collect()
    }
}

impl ResultEvent {
    /// 结果事件中可写回会话的字段
    pub fn session_update(&self) -> SessionUpdate {
        SessionUpdate {
            claude_session_id: self.session_id.clone(),
            cost_usd: self.total_cost_usd,
            input_tokens: self.usage.as_ref().and_then(|u| u.input_tokens),
            output_tokens: self.usage.as_ref().and_then(|u| u.output_tokens),
            duration_ms: self.duration_ms,
            num_turns: self.num_turns,
            result_content: self.result.clone(),
            ..Default::default()
        }
    }
}

/// 工具结果内容可能是字符串，也可能是内容块数组
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
