//! 错误类型定义

use thiserror::Error;

use crate::types::SessionStatus;

/// 已废弃的 human contact 审批类型被拒绝时的固定提示
pub const HUMAN_CONTACT_UNSUPPORTED: &str = "human contact approvals are no longer supported";

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 实体不存在（session / approval）
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// 当前状态下不允许的操作
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: SessionStatus, to: SessionStatus },

    /// 操作前置条件不满足（例如父会话缺少外部会话 ID）
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// 不支持的审批决定类型
    #[error("{0}")]
    InvalidDecisionType(String),

    /// Agent 子进程启动失败或异常退出
    #[error("agent process failure: {0}")]
    SubprocessFailure(String),

    /// 数据库错误
    #[error("storage failure: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("config error: {0}")]
    Config(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    pub fn approval_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "approval",
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// 映射到传输层错误码
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound { .. } => 404,
            Error::InvalidStateTransition { .. } | Error::InvalidState(_) => 409,
            Error::InvalidDecisionType(_) | Error::Config(_) => 400,
            Error::SubprocessFailure(_) => 502,
            Error::Database(_) | Error::Io(_) | Error::Serialization(_) | Error::Other(_) => 500,
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
