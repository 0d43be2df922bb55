//! 步进过程事件：用于流式展示推理、工具调用、截图与终止判断

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    /// 当前第几步
    StepUpdate { step: u32, max_steps: u32 },
    /// 命中回放缓存，跳过模型调用
    CacheHit { key: String },
    /// 正在调用模型
    Thinking,
    /// 模型本轮的文字/推理
    Reasoning { text: String },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具结果预览
    ToolResult { tool: String, preview: String },
    /// 工具执行失败（已回灌给模型）
    ToolFailure { tool: String, reason: String },
    /// 附加了新截图
    Screenshot { bytes: usize },
    /// 未主动调用 done，发起一次强制判断
    DoneForced,
    Finished { success: bool, completed: bool },
    Error { text: String },
}
