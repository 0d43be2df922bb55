//! 运行状态与结果
//!
//! AgentState 只属于一次运行，由步进循环独占修改，运行结束即丢弃；AgentResult 是不可变的对外输出。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{Action, AgentAction};
use crate::llm::{Message, TokenUsage};

/// 单次运行的可变累积状态
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub collected_reasoning: Vec<String>,
    pub actions: Vec<AgentAction>,
    pub final_message: Option<String>,
    pub current_page_url: String,
    /// 可回放的动作序列（仅在回放缓存启用时收集）
    pub replay_steps: Vec<Action>,
    /// 出现缺少选择器的变更动作后置为 false
    pub replayable: bool,
    /// 单调：false → true，不可重置
    completed: bool,
}

impl AgentState {
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            current_page_url: page_url.into(),
            replayable: true,
            ..Self::default()
        }
    }

    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

/// 运行结果；usage 在失败路径上也存在（可能为零）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub actions: Vec<AgentAction>,
    pub completed: bool,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// done 工具携带的结构化输出
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl AgentResult {
    /// 失败结果：completed 为 false，usage 保留已消耗部分
    pub fn failed(message: impl Into<String>, state: AgentState, usage: TokenUsage, messages: Vec<Message>) -> Self {
        Self {
            success: false,
            message: message.into(),
            actions: state.actions,
            completed: false,
            usage,
            messages,
            output: None,
        }
    }
}
