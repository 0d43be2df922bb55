//! 守护进程主体
//!
//! 父进程通过 stdin 管道维持“生命线”。管道关闭（父进程退出或崩溃）、
//! 被监视的浏览器进程消失、或收到 SIGTERM 时，执行且只执行一次清理。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::OnceCell;

use crate::supervisor::cleanup::{cleanup_for, process_alive};
use crate::supervisor::{SupervisorConfig, SupervisorPayload, SupervisorSettings};

/// 触发清理的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTrigger {
    /// 生命线管道关闭
    LifelineClosed,
    /// 被监视进程已退出
    ProcessExited,
    /// SIGTERM
    Signal,
}

pub struct Supervisor {
    config: Mutex<SupervisorConfig>,
    settings: SupervisorSettings,
    rearmed: AtomicBool,
    cleanup_done: OnceCell<()>,
}

impl Supervisor {
    pub fn new(payload: SupervisorPayload) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(payload.config),
            settings: payload.settings,
            rearmed: AtomicBool::new(false),
            cleanup_done: OnceCell::new(),
        })
    }

    /// 替换配置；只允许一次，之后的调用返回 false
    pub fn rearm(&self, config: SupervisorConfig) -> bool {
        if self.rearmed.swap(true, Ordering::SeqCst) {
            tracing::warn!("Supervisor already re-armed, ignoring new config");
            return false;
        }
        tracing::info!(kind = config.kind(), "Supervisor re-armed");
        match self.config.lock() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        true
    }

    pub fn current_config(&self) -> SupervisorConfig {
        match self.config.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleanup_done.initialized()
    }

    /// 执行清理；多次触发只生效一次，失败只记录
    pub async fn cleanup_once(&self, trigger: CleanupTrigger) {
        self.cleanup_done
            .get_or_init(|| async {
                let config = self.current_config();
                let task = cleanup_for(&config, &self.settings);
                tracing::info!(?trigger, task = task.name(), "Supervisor cleanup starting");
                match task.cleanup().await {
                    Ok(()) => tracing::info!(task = task.name(), "Supervisor cleanup completed"),
                    Err(e) => tracing::warn!(task = task.name(), "Supervisor cleanup failed: {}", e),
                }
            })
            .await;
    }

    /// 读取生命线直到 EOF；第一条合法配置行用于 rearm，其余忽略
    pub async fn watch_lifeline<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<SupervisorConfig>(line) {
                        Ok(config) => {
                            self.rearm(config);
                        }
                        Err(e) => tracing::debug!("Ignoring lifeline message: {}", e),
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!("Lifeline read error: {}", e);
                    return;
                }
            }
        }
    }

    /// 本地配置下等待被监视进程退出；远程配置永不返回
    pub async fn watch_pid(&self) {
        let interval = Duration::from_millis(self.settings.pid_poll_interval_ms.max(10));
        loop {
            match self.current_config() {
                SupervisorConfig::Local { pid, .. } => {
                    if !process_alive(pid) {
                        tracing::info!(pid, "Watched browser process exited");
                        return;
                    }
                }
                SupervisorConfig::Remote { .. } => {}
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// 等待任一触发条件，然后清理
    pub async fn run<R>(self: Arc<Self>, lifeline: R)
    where
        R: AsyncRead + Unpin,
    {
        let trigger = tokio::select! {
            _ = self.watch_lifeline(lifeline) => CleanupTrigger::LifelineClosed,
            _ = self.watch_pid() => CleanupTrigger::ProcessExited,
            _ = wait_for_sigterm() => CleanupTrigger::Signal,
        };
        self.cleanup_once(trigger).await;
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
            tracing::info!("Supervisor received SIGTERM");
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

/// `--supervisor` 模式入口：以 stdin 为生命线
pub async fn run_supervisor(payload: SupervisorPayload) -> anyhow::Result<()> {
    tracing::info!(kind = payload.config.kind(), "Supervisor started");
    let supervisor = Supervisor::new(payload);
    supervisor.run(tokio::io::stdin()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn payload(dir: &std::path::Path, preserve: bool) -> SupervisorPayload {
        SupervisorPayload::new(SupervisorConfig::Local {
            pid: 0,
            user_data_dir: Some(dir.to_path_buf()),
            created_temp_profile: true,
            preserve_user_data_dir: preserve,
        })
    }

    #[tokio::test]
    async fn test_rearm_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(payload(dir.path(), false));
        let remote = SupervisorConfig::Remote {
            api_key: "k".into(),
            project_id: "p".into(),
            session_id: "s1".into(),
        };
        assert!(supervisor.rearm(remote.clone()));
        assert!(!supervisor.rearm(SupervisorConfig::Remote {
            api_key: "k".into(),
            project_id: "p".into(),
            session_id: "s2".into(),
        }));
        assert_eq!(supervisor.current_config(), remote);
    }

    #[tokio::test]
    async fn test_lifeline_rearms_from_first_valid_line() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(payload(dir.path(), false));
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer
            .write_all(b"not json\n{\"kind\":\"REMOTE\",\"apiKey\":\"k\",\"projectId\":\"p\",\"sessionId\":\"first\"}\n{\"kind\":\"REMOTE\",\"apiKey\":\"k\",\"projectId\":\"p\",\"sessionId\":\"second\"}\n")
            .await
            .unwrap();
        drop(writer);
        supervisor.watch_lifeline(reader).await;
        match supervisor.current_config() {
            SupervisorConfig::Remote { session_id, .. } => assert_eq!(session_id, "first"),
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_lifeline_cleans_up_once() {
        let root = tempfile::tempdir().unwrap();
        let profile = root.path().join("profile");
        std::fs::create_dir_all(&profile).unwrap();
        let supervisor = Supervisor::new(payload(&profile, false));

        let (writer, reader) = tokio::io::duplex(64);
        drop(writer);
        Arc::clone(&supervisor).run(reader).await;
        assert!(supervisor.is_cleaned_up());
        assert!(!profile.exists());

        // 第二次触发无副作用
        std::fs::create_dir_all(&profile).unwrap();
        supervisor.cleanup_once(CleanupTrigger::Signal).await;
        assert!(profile.exists());
    }

    #[tokio::test]
    async fn test_remote_config_never_resolves_pid_watch() {
        let supervisor = Supervisor::new(SupervisorPayload::new(SupervisorConfig::Remote {
            api_key: "k".into(),
            project_id: "p".into(),
            session_id: "s".into(),
        }));
        let watched =
            tokio::time::timeout(Duration::from_millis(100), supervisor.watch_pid()).await;
        assert!(watched.is_err());
    }
}
