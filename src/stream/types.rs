//! 远程执行协议的事件、操作与错误类型

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 传输层错误；与远端显式上报的 error 状态区分
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Malformed event stream: {0}")]
    Framing(String),

    #[error("Invalid event payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Stream ended without a finished event")]
    MissingFinishedEvent,
}

/// system 事件的状态
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Error,
    Finished,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystemEvent {
    pub status: SystemStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    /// finished 事件里的缓存命中标记（响应头缺失时的兜底）
    #[serde(default, rename = "cacheHit")]
    pub cache_hit: Option<bool>,
}

/// log 事件；message 可以是纯文本或带级别的结构
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LogMessage {
    Text(String),
    Structured {
        message: String,
        #[serde(default)]
        level: Option<u8>,
        #[serde(default)]
        category: Option<String>,
    },
}

impl LogMessage {
    pub fn text(&self) -> &str {
        match self {
            LogMessage::Text(text) => text,
            LogMessage::Structured { message, .. } => message,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            LogMessage::Structured { level: Some(level), .. } => *level,
            _ => 1,
        }
    }

    pub fn category(&self) -> Option<&str> {
        match self {
            LogMessage::Structured { category, .. } => category.as_deref(),
            LogMessage::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogEvent {
    pub message: LogMessage,
}

/// 一个完整的 `data:` 事件
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    System(SystemEvent),
    Log(LogEvent),
    /// 未知 type，原样保留
    Unknown { kind: String, data: Value },
}

/// 缓存状态：响应头 `cache-status` 或 finished 负载里的 cacheHit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HIT" => Some(CacheStatus::Hit),
            "MISS" => Some(CacheStatus::Miss),
            _ => None,
        }
    }
}

/// 响应头优先，其次 finished 负载中的布尔标记
pub fn resolve_cache_status(header: Option<CacheStatus>, payload_hit: Option<bool>) -> Option<CacheStatus> {
    header.or(payload_hit.map(|hit| if hit { CacheStatus::Hit } else { CacheStatus::Miss }))
}

/// 远程操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOperation {
    Act,
    Extract,
    Observe,
    Navigate,
    AgentExecute,
}

impl RemoteOperation {
    pub fn path(&self) -> &'static str {
        match self {
            RemoteOperation::Act => "act",
            RemoteOperation::Extract => "extract",
            RemoteOperation::Observe => "observe",
            RemoteOperation::Navigate => "navigate",
            RemoteOperation::AgentExecute => "agentExecute",
        }
    }

    /// 只有 act / extract / observe 携带缓存状态
    pub fn reports_cache_status(&self) -> bool {
        matches!(
            self,
            RemoteOperation::Act | RemoteOperation::Extract | RemoteOperation::Observe
        )
    }

    /// 需要推理的操作必须带模型 API Key
    pub fn requires_model_key(&self) -> bool {
        !matches!(self, RemoteOperation::Navigate)
    }
}

/// 远程调用结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResult {
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<CacheStatus>,
}

/// 单次调用选项
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// 设置 x-cache-bypass
    pub bypass_cache: bool,
}
