//! 父进程侧：启动守护进程并持有生命线

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use crate::core::AgentError;
use crate::supervisor::{SupervisorConfig, SupervisorPayload};

pub struct SupervisorHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    rearmed: bool,
}

impl SupervisorHandle {
    /// 以当前可执行文件的 `--supervisor` 模式启动
    pub fn spawn(payload: &SupervisorPayload) -> Result<Self, AgentError> {
        let program = std::env::current_exe()
            .map_err(|e| AgentError::Supervisor(format!("cannot locate executable: {}", e)))?;
        Self::spawn_with(&program, payload)
    }

    pub fn spawn_with(program: &Path, payload: &SupervisorPayload) -> Result<Self, AgentError> {
        let encoded = serde_json::to_string(payload)
            .map_err(|e| AgentError::Supervisor(format!("cannot encode payload: {}", e)))?;

        let mut command = Command::new(program);
        command
            .arg("--supervisor")
            .arg(format!("--supervisor-config={}", encoded))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        // 独立进程组：父进程收到的 Ctrl+C 不会直接杀掉守护进程
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| AgentError::Supervisor(format!("failed to spawn supervisor: {}", e)))?;
        let stdin = child.stdin.take();
        tracing::info!(pid = child.id(), kind = payload.config.kind(), "Supervisor spawned");
        Ok(Self {
            child,
            stdin,
            rearmed: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// 通过生命线发送新配置；只能调用一次
    pub async fn rearm(&mut self, config: &SupervisorConfig) -> Result<(), AgentError> {
        if self.rearmed {
            return Err(AgentError::Supervisor("supervisor already re-armed".into()));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AgentError::Supervisor("lifeline already closed".into()))?;
        let mut line = serde_json::to_vec(config)
            .map_err(|e| AgentError::Supervisor(format!("cannot encode config: {}", e)))?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|e| AgentError::Supervisor(format!("lifeline write failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| AgentError::Supervisor(format!("lifeline flush failed: {}", e)))?;
        self.rearmed = true;
        Ok(())
    }

    /// 关闭生命线并等待守护进程完成清理退出
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), AgentError> {
        drop(self.stdin.take());
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "Supervisor exited");
                Ok(())
            }
            Ok(Err(e)) => Err(AgentError::Supervisor(format!("wait failed: {}", e))),
            Err(_) => Err(AgentError::Supervisor(format!(
                "supervisor did not exit within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}
