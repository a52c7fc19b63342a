//! PID 文件（单实例锁）

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// 持有期间表示本进程是唯一的 daemon；drop 时删除 PID 文件
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: u32,
}

impl PidLock {
    /// 获取锁；已有存活进程持有时失败，残留文件会被清理
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(pid) = read_pid(path) {
            if pid != std::process::id() && process_alive(pid) {
                bail!("daemon already running (pid {})", pid);
            }
            tracing::debug!("🧹 删除残留 PID 文件: {:?} (pid={})", path, pid);
        }
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("删除残留 PID 文件失败: {:?}", path))?;
        }

        let pid = std::process::id();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("创建 PID 文件失败: {:?}", path))?;
        file.write_all(pid.to_string().as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!("📝 写入 PID 文件: {} (pid={})", path.display(), pid);
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // 只删除自己写的文件
        if read_pid(&self.path) == Some(self.pid) {
            let _ = fs::remove_file(&self.path);
            tracing::debug!("🧹 删除 PID 文件: {:?}", self.path);
        }
    }
}

/// PID 文件指向的进程是否存活
pub fn is_daemon_running(pid_path: &Path) -> bool {
    match read_pid(pid_path) {
        Some(pid) => pid != std::process::id() && process_alive(pid),
        None => false,
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}
