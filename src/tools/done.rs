//! 保留的 done 工具：模型用它给出结构化的终止判断
//!
//! 基础参数（reasoning / success）由 schemars 生成；调用方提供输出 schema 时，其字段合并进 done 的参数。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::llm::ToolSpec;

pub const DONE_TOOL: &str = "done";

#[allow(dead_code)]
#[derive(JsonSchema, Deserialize)]
struct DoneToolInput {
    #[schemars(description = "Summary of what was done, or why the task could not be completed")]
    reasoning: String,
    #[schemars(description = "Whether the task was completed successfully")]
    success: bool,
}

/// done 工具定义；output_schema 的 properties / required 合并进参数
pub fn done_tool_spec(output_schema: Option<&Value>) -> ToolSpec {
    let mut parameters =
        serde_json::to_value(schema_for!(DoneToolInput)).unwrap_or_else(|_| Value::Object(Map::new()));
    if let Some(obj) = parameters.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }

    if let Some(extra) = output_schema {
        if let Some(extra_props) = extra.get("properties").and_then(Value::as_object) {
            if let Some(props) = parameters
                .get_mut("properties")
                .and_then(Value::as_object_mut)
            {
                for (key, schema) in extra_props {
                    props.entry(key.clone()).or_insert_with(|| schema.clone());
                }
            }
        }
        if let Some(extra_required) = extra.get("required").and_then(Value::as_array) {
            if let Some(required) = parameters
                .get_mut("required")
                .and_then(Value::as_array_mut)
            {
                for key in extra_required {
                    if !required.contains(key) {
                        required.push(key.clone());
                    }
                }
            }
        }
    }

    ToolSpec {
        name: DONE_TOOL.to_string(),
        description: "Call this when the task is finished or cannot be completed. \
                      Report whether it succeeded and summarize the outcome."
            .to_string(),
        parameters,
    }
}

/// done 调用的判断结果
#[derive(Debug, Clone, PartialEq)]
pub struct DoneVerdict {
    pub success: bool,
    pub reasoning: String,
    /// 结构化输出字段（仅在提供输出 schema 时收集）
    pub output: Option<Value>,
}

impl DoneVerdict {
    pub fn from_args(args: &Value, collect_output: bool) -> Self {
        let success = args
            .get("success")
            .or_else(|| args.get("taskComplete"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let reasoning = args
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let output = if collect_output {
            args.as_object().map(|obj| {
                let fields: Map<String, Value> = obj
                    .iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "success" | "taskComplete" | "reasoning"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Value::Object(fields)
            })
        } else {
            None
        };
        Self {
            success,
            reasoning,
            output,
        }
    }
}
