//! 脚本化 LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置的 Generation；脚本耗尽后返回一段无工具调用的文本，
//! 或在 `hang_when_exhausted` 时挂起直到取消。每次调用都会记录请求摘要供断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{GenerateRequest, Generation, LlmClient, LlmError, ModelProvider, ToolChoice};

/// 一次调用的请求摘要
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub message_count: usize,
    pub image_count: usize,
    pub tool_names: Vec<String>,
    pub tool_choice: ToolChoice,
    pub system_prompt: String,
}

pub struct ScriptedLlmClient {
    provider: ModelProvider,
    model: String,
    media_in_tool_results: bool,
    hang_when_exhausted: bool,
    script: Mutex<VecDeque<Result<Generation, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<Generation, LlmError>>) -> Self {
        Self {
            provider: ModelProvider::OpenAi,
            model: "openai/computer-use-preview".to_string(),
            media_in_tool_results: true,
            hang_when_exhausted: false,
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, provider: ModelProvider, model: impl Into<String>) -> Self {
        self.provider = provider;
        self.model = model.into();
        self
    }

    pub fn with_media_in_tool_results(mut self, supported: bool) -> Self {
        self.media_in_tool_results = supported;
        self
    }

    pub fn hang_when_exhausted(mut self) -> Self {
        self.hang_when_exhausted = true;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_turn(&self) -> Option<Result<Generation, LlmError>> {
        self.script.lock().ok().and_then(|mut s| s.pop_front())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn provider(&self) -> ModelProvider {
        self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn supports_media_in_tool_results(&self) -> bool {
        self.media_in_tool_results
    }

    async fn generate(
        &self,
        request: GenerateRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Generation, LlmError> {
        let recorded = RecordedCall {
            message_count: request.messages.len(),
            image_count: request.messages.iter().map(|m| m.image_count()).sum(),
            tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
            tool_choice: request.tool_choice.clone(),
            system_prompt: request
                .messages
                .first()
                .map(|m| m.text())
                .unwrap_or_default(),
        };
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(recorded);
        }

        match self.next_turn() {
            Some(turn) => turn,
            None if self.hang_when_exhausted => {
                cancel.cancelled().await;
                Err(LlmError::Cancelled)
            }
            None => Ok(Generation::text("No further actions.")),
        }
    }
}
