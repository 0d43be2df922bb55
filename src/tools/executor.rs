//! 工具执行器
//!
//! 对每次工具调用施加超时，超时或失败时转为 AgentError（ToolTimeout / ToolExecutionFailed）；
//! 每次调用输出结构化审计日志（JSON）。

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::AgentError;

pub struct ToolExecutor {
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// 在超时内执行 fut；工具返回 Err 转为 ToolExecutionFailed，超时转为 ToolTimeout
    pub async fn execute<F, T>(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
        fut: F,
    ) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, String>>,
    {
        let start = Instant::now();
        let result = timeout(self.timeout, fut).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(format!("{}: {}", tool_name, e))),
            Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
