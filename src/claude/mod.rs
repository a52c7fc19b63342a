//! Agent CLI 子进程（stream-json 模式）

mod events;
mod process;

pub use events::{ContentBlock, MessageContent, ResultEvent, StreamEvent, StreamMessage, Usage};
pub use process::{AgentCommand, AgentProcess};
