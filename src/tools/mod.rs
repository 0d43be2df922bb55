//! 工具层：内置浏览器工具、保留的 done 工具、调用方自定义工具与带超时审计的执行器

pub mod builtin;
pub mod done;
pub mod executor;
pub mod registry;

use serde_json::Value;

use crate::browser::Point;
use crate::llm::ImagePayload;

pub use builtin::{BrowserToolbox, BuiltinTool};
pub use done::{done_tool_spec, DoneVerdict, DONE_TOOL};
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};

/// 一次工具执行的结果；失败时 output 为结构化错误负载，回灌给模型自我纠正
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: Value,
    pub images: Vec<ImagePayload>,
    /// 原语解析出的目标元素选择器
    pub selector: Option<String>,
    /// 实际作用的设备像素坐标
    pub point: Option<Point>,
    /// 拖拽终点
    pub end_point: Option<Point>,
}

impl ToolOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            images: Vec::new(),
            selector: None,
            point: None,
            end_point: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::json!({ "success": false, "error": error.into() }),
            ..Self::ok(Value::Null)
        }
    }
}
