//! DoneEnforcer：保证运行结束时总有一次显式的模型判断
//!
//! 循环到达终止条件而模型从未主动调用 done 时，额外发起且只发起一次推理：
//! 唯一可用工具为 done，system 指令复述原任务并要求模型评估是否完成（有输出 schema 时一并填写）。

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{GenerateRequest, Generation, LlmClient, Message, Role, ToolCall, ToolChoice};
use crate::tools::{done_tool_spec, DoneVerdict, DONE_TOOL};

/// 强制判断的结果；模型仍未调用 done 时 call 为 None
#[derive(Debug, Clone)]
pub struct ForcedDone {
    pub call: Option<(ToolCall, DoneVerdict)>,
    pub generation: Generation,
}

pub struct DoneEnforcer<'a> {
    llm: &'a dyn LlmClient,
    output_schema: Option<&'a Value>,
}

impl<'a> DoneEnforcer<'a> {
    pub fn new(llm: &'a dyn LlmClient, output_schema: Option<&'a Value>) -> Self {
        Self { llm, output_schema }
    }

    pub fn system_prompt(instruction: &str, with_output: bool) -> String {
        let mut prompt = format!(
            "You were asked to complete the following task in a web browser:\n\n{}\n\n\
             The run has ended. Review the conversation so far and assess whether the task \
             was completed. You must call the `done` tool now: set `success` to whether the \
             task was completed and explain your judgment in `reasoning`.",
            instruction
        );
        if with_output {
            prompt.push_str(" Also fill in every requested output field from what you observed.");
        }
        prompt
    }

    /// 用强制判断的 system 指令替换原 system 消息，其余对话保持不变
    fn conversation(&self, instruction: &str, messages: &[Message]) -> Vec<Message> {
        let system = Message::system(Self::system_prompt(instruction, self.output_schema.is_some()));
        let rest = match messages.first() {
            Some(m) if m.role == Role::System => &messages[1..],
            _ => messages,
        };
        let mut conversation = Vec::with_capacity(rest.len() + 1);
        conversation.push(system);
        conversation.extend_from_slice(rest);
        conversation
    }

    pub async fn enforce(
        &self,
        instruction: &str,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<ForcedDone, AgentError> {
        let conversation = self.conversation(instruction, messages);
        let tools = vec![done_tool_spec(self.output_schema)];
        let request = GenerateRequest {
            messages: &conversation,
            tools: &tools,
            tool_choice: ToolChoice::Required(DONE_TOOL.to_string()),
            stop_on_tool: Some(DONE_TOOL),
        };
        tracing::info!("Model never called done, requesting a forced completion judgment");

        let generation = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = self.llm.generate(request, cancel) => result?,
        };

        let call = generation
            .tool_calls
            .iter()
            .find(|c| c.name == DONE_TOOL)
            .map(|c| {
                let verdict = DoneVerdict::from_args(&c.arguments, self.output_schema.is_some());
                (c.clone(), verdict)
            });
        if call.is_none() {
            tracing::warn!("Forced completion call returned no done invocation");
        }
        Ok(ForcedDone { call, generation })
    }
}
