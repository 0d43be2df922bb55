//! 清理任务：本地浏览器进程两阶段终止与临时 profile 删除，远程会话释放
//!
//! 清理是尽力而为：任何失败都只记录日志，由调用方吞掉。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use crate::supervisor::{SupervisorConfig, SupervisorSettings};

/// 守护进程触发时执行的清理
#[async_trait]
pub trait SupervisorCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 进程是否存活；EPERM 表示进程存在但无权发送信号
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: 信号 0 只做存在性与权限检查，不会投递信号
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> anyhow::Result<()> {
    let pid = libc::pid_t::try_from(pid)?;
    // SAFETY: 调用方保证 pid > 1
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // 已经退出
        return Ok(());
    }
    Err(err.into())
}

/// 只有本次运行创建、且调用方未要求保留时才删除 profile
pub fn should_remove_profile(created_temp_profile: bool, preserve_user_data_dir: bool) -> bool {
    created_temp_profile && !preserve_user_data_dir
}

pub struct LocalBrowserCleanup {
    pid: u32,
    user_data_dir: Option<PathBuf>,
    created_temp_profile: bool,
    preserve_user_data_dir: bool,
    kill_timeout: Duration,
    poll_interval: Duration,
}

impl LocalBrowserCleanup {
    pub fn new(
        pid: u32,
        user_data_dir: Option<PathBuf>,
        created_temp_profile: bool,
        preserve_user_data_dir: bool,
        settings: &SupervisorSettings,
    ) -> Self {
        Self {
            pid,
            user_data_dir,
            created_temp_profile,
            preserve_user_data_dir,
            kill_timeout: Duration::from_millis(settings.kill_timeout_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(10)),
        }
    }

    /// SIGTERM，按间隔轮询存活，超时后 SIGKILL
    #[cfg(unix)]
    async fn terminate(&self) -> anyhow::Result<()> {
        let pid = self.pid;
        if pid <= 1 {
            tracing::warn!(pid, "Refusing to signal pid");
            return Ok(());
        }
        if !process_alive(pid) {
            tracing::debug!(pid, "Browser process already gone");
            return Ok(());
        }

        tracing::info!(pid, "Sending SIGTERM to browser process");
        send_signal(pid, libc::SIGTERM)?;
        let deadline = Instant::now() + self.kill_timeout;
        while Instant::now() < deadline {
            if !process_alive(pid) {
                tracing::info!(pid, "Browser process exited");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        if process_alive(pid) {
            tracing::warn!(
                pid,
                timeout_ms = self.kill_timeout.as_millis() as u64,
                "Browser process ignored SIGTERM, sending SIGKILL"
            );
            send_signal(pid, libc::SIGKILL)?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn terminate(&self) -> anyhow::Result<()> {
        anyhow::bail!("process signals are not supported on this platform")
    }

    async fn remove_profile(&self) -> anyhow::Result<()> {
        if !should_remove_profile(self.created_temp_profile, self.preserve_user_data_dir) {
            return Ok(());
        }
        let Some(dir) = &self.user_data_dir else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                tracing::info!(dir = %dir.display(), "Removed temporary browser profile");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SupervisorCleanup for LocalBrowserCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let terminated = self.terminate().await;
        // 进程终止失败也继续删 profile
        let removed = self.remove_profile().await;
        terminated.and(removed)
    }

    fn name(&self) -> &'static str {
        "LocalBrowser"
    }
}

pub struct RemoteSessionCleanup {
    api_key: String,
    project_id: String,
    session_id: String,
    release_base_url: Option<String>,
    http: reqwest::Client,
}

impl RemoteSessionCleanup {
    pub fn new(
        api_key: String,
        project_id: String,
        session_id: String,
        settings: &SupervisorSettings,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            project_id,
            session_id,
            release_base_url: settings.release_base_url.clone(),
            http,
        }
    }
}

#[async_trait]
impl SupervisorCleanup for RemoteSessionCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let Some(base) = self.release_base_url.as_deref() else {
            tracing::warn!(session_id = %self.session_id, "No release URL configured, skipping remote release");
            return Ok(());
        };
        let url = format!("{}/sessions/{}", base.trim_end_matches('/'), self.session_id);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(&json!({ "projectId": self.project_id, "status": "REQUEST_RELEASE" }))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("release request returned HTTP {}", response.status());
        }
        tracing::info!(session_id = %self.session_id, "Requested remote session release");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RemoteSession"
    }
}

/// 按当前配置构造清理任务
pub fn cleanup_for(config: &SupervisorConfig, settings: &SupervisorSettings) -> Box<dyn SupervisorCleanup> {
    match config {
        SupervisorConfig::Local {
            pid,
            user_data_dir,
            created_temp_profile,
            preserve_user_data_dir,
        } => Box::new(LocalBrowserCleanup::new(
            *pid,
            user_data_dir.clone(),
            *created_temp_profile,
            *preserve_user_data_dir,
            settings,
        )),
        SupervisorConfig::Remote {
            api_key,
            project_id,
            session_id,
        } => Box::new(RemoteSessionCleanup::new(
            api_key.clone(),
            project_id.clone(),
            session_id.clone(),
            settings,
        )),
    }
}
