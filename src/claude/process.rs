//! Agent 子进程管理
//!
//! 子进程以 `--output-format stream-json --verbose -p <query>` 启动，
//! stdout 逐行读取，stderr 只保留末尾若干行用于错误信息。

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// stderr 保留的行数
const STDERR_TAIL_LINES: usize = 20;

/// 子进程启动参数
#[derive(Debug, Clone, Default)]
pub struct AgentCommand {
    pub program: PathBuf,
    /// 放在标准参数之前的额外参数（包装脚本等）
    pub program_args: Vec<String>,
    pub query: String,
    pub working_dir: Option<String>,
    /// 要恢复的外部会话 ID
    pub resume_session_id: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub max_turns: Option<i64>,
    pub permission_prompt_tool: Option<String>,
    /// MCP 配置（JSON）
    pub mcp_config: Option<serde_json::Value>,
    pub env: Vec<(String, String)>,
}

impl AgentCommand {
    /// 命令行参数
    pub fn args(&self) -> Vec<String> {
        let mut args = self.program_args.clone();
        args.extend([
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ]);

        if let Some(ref session_id) = self.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(max_turns) = self.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }

        // 两者互斥，完整替换优先
        if let Some(ref prompt) = self.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        } else if let Some(ref prompt) = self.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }

        if let Some(ref tool) = self.permission_prompt_tool {
            args.push("--permission-prompt-tool".to_string());
            args.push(tool.clone());
        }
        if let Some(ref mcp_config) = self.mcp_config {
            args.push("--mcp-config".to_string());
            args.push(mcp_config.to_string());
        }

        args.push("-p".to_string());
        args.push(self.query.clone());
        args
    }
}

/// 运行中的 Agent 子进程
pub struct AgentProcess {
    child: Child,
    pid: Option<u32>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl AgentProcess {
    /// 启动子进程
    pub fn spawn(command: &AgentCommand) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(command.args());
        if let Some(ref dir) = command.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::SubprocessFailure(format!(
                "failed to spawn {}: {}",
                command.program.display(),
                e
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::SubprocessFailure("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::SubprocessFailure("failed to capture stderr".to_string()))?;

        let pid = child.id();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = stderr_tail.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("agent stderr (pid={:?}): {}", pid, line);
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        tracing::info!("🚀 Agent process started: pid={:?}", pid);

        Ok(Self {
            child,
            pid,
            stdout: BufReader::new(stdout).lines(),
            stderr_tail,
            stderr_task: Some(stderr_task),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// 读取下一行 stdout；EOF 返回 None（可安全用于 select!）
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.stdout.next_line().await
    }

    /// 发送中断信号（SIGINT）
    #[cfg(unix)]
    pub fn interrupt(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            // 已退出
            return Ok(());
        };
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        tracing::info!("⏸️ Sent SIGINT to agent process: pid={}", pid);
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn interrupt(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }

    /// 强制结束
    pub async fn kill(&mut self) -> Result<()> {
        if self.child.id().is_some() {
            tracing::warn!("🔪 Killing agent process: pid={:?}", self.pid);
            self.child.kill().await?;
        }
        Ok(())
    }

    /// 等待退出（可安全用于 select!）
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        if let Some(task) = self.stderr_task.take() {
            // stderr 随进程退出关闭，这里只是等读完
            let _ = tokio::time::timeout(std::time::Duration::from_millis(200), task).await;
        }
        Ok(status)
    }

    /// stderr 末尾几行
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_minimal() {
        let command = AgentCommand {
            program: PathBuf::from("claude"),
            query: "hello".to_string(),
            ..Default::default()
        };
        assert_eq!(
            command.args(),
            vec!["--output-format", "stream-json", "--verbose", "-p", "hello"]
        );
    }

    #[test]
    fn test_args_full() {
        let command = AgentCommand {
            program: PathBuf::from("claude"),
            query: "continue".to_string(),
            resume_session_id: Some("abc".to_string()),
            model: Some("opus".to_string()),
            max_turns: Some(5),
            system_prompt: Some("replace".to_string()),
            append_system_prompt: Some("ignored".to_string()),
            permission_prompt_tool: Some("mcp__approvals__request_permission".to_string()),
            mcp_config: Some(serde_json::json!({"mcpServers": {}})),
            ..Default::default()
        };
        let args = command.args();
        let joined = args.join(" ");
        assert!(joined.contains("--resume abc"));
        assert!(joined.contains("--model opus"));
        assert!(joined.contains("--max-turns 5"));
        assert!(joined.contains("--system-prompt replace"));
        assert!(!joined.contains("--append-system-prompt"));
        assert!(joined.contains("--permission-prompt-tool mcp__approvals__request_permission"));
        assert!(joined.contains("--mcp-config"));
        assert_eq!(args[args.len() - 2], "-p");
        assert_eq!(args[args.len() - 1], "continue");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_subprocess_failure() {
        let command = AgentCommand {
            program: PathBuf::from("/nonexistent/agent-binary"),
            query: "hi".to_string(),
            ..Default::default()
        };
        match AgentProcess::spawn(&command) {
            Err(Error::SubprocessFailure(msg)) => assert!(msg.contains("failed to spawn")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[test]
    fn test_program_args_come_first() {
        let command = AgentCommand {
            program: PathBuf::from("/bin/sh"),
            program_args: vec!["agent.sh".to_string()],
            query: "hi".to_string(),
            ..Default::default()
        };
        assert_eq!(command.args()[0], "agent.sh");
        assert_eq!(command.args()[1], "--output-format");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reads_stdout_and_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, "echo '{\"type\":\"system\"}'\necho oops >&2\nexit 3\n")
            .unwrap();

        let command = AgentCommand {
            program: PathBuf::from("/bin/sh"),
            program_args: vec![script.display().to_string()],
            query: "hi".to_string(),
            ..Default::default()
        };
        let mut process = AgentProcess::spawn(&command).unwrap();
        assert!(process.pid().is_some());
        assert_eq!(
            process.next_line().await.unwrap().as_deref(),
            Some("{\"type\":\"system\"}")
        );
        assert!(process.next_line().await.unwrap().is_none());

        let status = process.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(process.stderr_tail(), "oops");
    }
}
