//! 运行时错误类型
//!
//! 分类：配置错误（致命、在任何网络调用前同步返回）、传输错误（HTTP / 分帧 / 解析）、
//! 远端上报错误（原样透传，不加前缀）、取消（独立于失败）、工具错误（回灌给模型自我纠正）。

use thiserror::Error;

use crate::browser::BrowserError;
use crate::cache::CacheError;
use crate::llm::LlmError;
use crate::stream::StreamError;

/// 步进循环、回放缓存、远程客户端共用的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 缺少凭证、参数非法等；在发起任何请求前返回
    #[error("Config error: {0}")]
    Config(String),

    /// HTTP 状态失败、流分帧错误、JSON 解析错误、流在 finished 前结束
    #[error("Transport error: {0}")]
    Transport(#[from] StreamError),

    /// 远端显式上报的 error 状态；Display 与远端消息完全一致
    #[error("{0}")]
    Remote(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("LLM error: {0}")]
    Llm(LlmError),

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("{what} timed out after {timeout_ms}ms")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("Replay failed at step {step}: {reason}")]
    ReplayFailed { step: usize, reason: String },

    /// 守护进程启动或通信失败
    #[error("Supervisor error: {0}")]
    Supervisor(String),
}

impl AgentError {
    /// 配置错误与取消直接抛给调用方；其余失败在入口处转为 success=false 的结果
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Config(_) | AgentError::Cancelled)
    }
}

impl From<LlmError> for AgentError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => AgentError::Cancelled,
            other => AgentError::Llm(other),
        }
    }
}
