//! 配置
//!
//! 所有配置项都有默认值，可被 `AGENTD_*` 环境变量覆盖。

use std::path::PathBuf;
use std::time::Duration;

/// 默认关闭超时（秒）
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
/// 默认跳过审批过期检查周期（秒）
pub const DEFAULT_PERMISSION_CHECK_INTERVAL_SECS: u64 = 30;

/// 数据库连接配置
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// 本地路径；内存模式为 ":memory:"
    pub url: String,

    /// 连接模式
    pub mode: ConnectionMode,
}

/// 连接模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// 本地 SQLite 文件
    Local,
    /// 内存数据库（测试用，语义与 Local 相同）
    Memory,
}

impl DbConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self {
            url: path.display().to_string(),
            mode: ConnectionMode::Local,
        }
    }

    /// 创建内存数据库配置
    pub fn memory() -> Self {
        Self {
            url: ":memory:".to_string(),
            mode: ConnectionMode::Memory,
        }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        match std::env::var("AGENTD_DB_PATH") {
            Ok(url) if url == ":memory:" => Self::memory(),
            Ok(url) => Self::local(url),
            Err(_) => Self::local(default_data_dir().join("daemon.db")),
        }
    }

    /// 获取数据库文件路径 (仅本地模式)
    pub fn path(&self) -> Option<PathBuf> {
        match self.mode {
            ConnectionMode::Local => Some(PathBuf::from(&self.url)),
            ConnectionMode::Memory => None,
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Daemon 配置
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// 数据目录（默认 ~/.agentd）
    pub data_dir: PathBuf,
    /// 数据库配置
    pub db: DbConfig,
    /// Agent CLI 可执行文件
    pub claude_path: PathBuf,
    /// 放在标准参数之前的额外参数（AGENTD_CLAUDE_ARGS，空白分隔）
    pub claude_args: Vec<String>,
    /// 跳过审批过期检查周期
    pub permission_check_interval: Duration,
    /// 整体关闭超时
    pub shutdown_timeout: Duration,
    /// 中断信号发出后等待子进程退出的宽限期
    pub interrupt_grace: Duration,
    /// 每个订阅者的事件缓冲区大小
    pub subscriber_buffer: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db: DbConfig::local(data_dir.join("daemon.db")),
            data_dir,
            claude_path: PathBuf::from("claude"),
            claude_args: Vec::new(),
            permission_check_interval: Duration::from_secs(DEFAULT_PERMISSION_CHECK_INTERVAL_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            interrupt_grace: Duration::from_secs(5),
            subscriber_buffer: 100,
        }
    }
}

impl DaemonConfig {
    /// 以某个数据目录为根的配置（数据库放在目录内）
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> Self {
        let data_dir = data_dir.into();
        Self {
            db: DbConfig::local(data_dir.join("daemon.db")),
            data_dir,
            ..Default::default()
        }
    }

    /// 默认配置 + 环境变量覆盖
    pub fn from_env() -> Self {
        let mut config = match std::env::var("AGENTD_DATA_DIR") {
            Ok(dir) => Self::with_data_dir(dir),
            Err(_) => Self::default(),
        };

        if std::env::var("AGENTD_DB_PATH").is_ok() {
            config.db = DbConfig::from_env();
        }
        if let Ok(path) = std::env::var("AGENTD_CLAUDE_PATH") {
            config.claude_path = PathBuf::from(path);
        }
        if let Ok(args) = std::env::var("AGENTD_CLAUDE_ARGS") {
            config.claude_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(secs) = env_secs("AGENTD_PERMISSION_CHECK_INTERVAL_SECS") {
            config.permission_check_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_secs("AGENTD_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("daemon.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentd")
}

fn env_secs(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}
