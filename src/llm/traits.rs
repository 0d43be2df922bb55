//! 模型推理能力抽象
//!
//! 核心只依赖「对一段对话、一组工具生成一轮回复」这一能力，不关心具体厂商的请求/响应格式。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::usage::TokenUsage;
use crate::llm::{Message, ToolCall};

/// 推理调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// 取消信号触发后推理被中止
    #[error("Inference cancelled")]
    Cancelled,
}

/// 模型厂商；决定坐标系归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    OpenAi,
    Anthropic,
    Google,
    Microsoft,
    Other,
}

impl ModelProvider {
    /// 从 `provider/model` 形式的模型名推断厂商
    pub fn from_model_name(model: &str) -> Self {
        let lower = model.to_lowercase();
        let prefix = lower.split('/').next().unwrap_or("");
        match prefix {
            "openai" => ModelProvider::OpenAi,
            "anthropic" => ModelProvider::Anthropic,
            "google" => ModelProvider::Google,
            "microsoft" => ModelProvider::Microsoft,
            _ if lower.starts_with("gemini") => ModelProvider::Google,
            _ if lower.starts_with("claude") => ModelProvider::Anthropic,
            _ if lower.starts_with("gpt") || lower.starts_with("computer-use") => {
                ModelProvider::OpenAi
            }
            _ => ModelProvider::Other,
        }
    }
}

/// 提供给模型的工具定义（JSON Schema 参数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具选择策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    /// 必须调用指定工具（DoneEnforcer 强制调用 done）
    Required(String),
}

/// 单轮推理请求
#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    pub tool_choice: ToolChoice,
    /// 停止谓词：内部会多轮往返的实现在该工具被调用后必须停止
    pub stop_on_tool: Option<&'a str>,
}

/// 单轮推理结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }
}

/// 推理客户端 trait：所有后端实现 generate；取消令牌需透传到底层连接
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> ModelProvider;

    fn model_name(&self) -> &str;

    /// 图片能否放在工具结果内；不能时循环会把图片作为单独的 user 回合回灌
    fn supports_media_in_tool_results(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        request: GenerateRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Generation, LlmError>;
}
