//! LLM 层：推理能力抽象、对话消息、用量统计与脚本化 Mock

pub mod message;
pub mod mock;
pub mod traits;
pub mod usage;

pub use message::{ContentPart, ImagePayload, Message, Role, ToolCall};
pub use mock::ScriptedLlmClient;
pub use traits::{
    GenerateRequest, Generation, LlmClient, LlmError, ModelProvider, ToolChoice, ToolSpec,
};
pub use usage::{TokenUsage, UsageSink};
