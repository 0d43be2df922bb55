//! ActionMapper：把一次工具调用及其结果映射为动作记录
//!
//! - AgentAction：面向人的执行轨迹，每次工具调用至少产生一条（未知工具产生诊断动作，不丢弃）
//! - Action：可回放的、与模型无关的浏览器变更描述；点击/输入/滚动/拖拽引用原语执行时解析出的
//!   选择器而不是模型的自然语言描述，保证回放不依赖未来的模型输出

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{BuiltinTool, ToolOutcome, DONE_TOOL};

/// 可回放的单条浏览器变更；创建后不可变，只由 ActionMapper 产生
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// 目标元素选择器；页面级动作（goto / press / 页面滚动 / 焦点输入）为空串
    pub selector: String,
    pub description: String,
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// 执行轨迹中的一条动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub timestamp_ms: i64,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

fn default_true() -> bool {
    true
}

impl AgentAction {
    fn new(action_type: impl Into<String>, page_url: &str, timestamp_ms: i64) -> Self {
        Self {
            action_type: action_type.into(),
            reasoning: None,
            x: None,
            y: None,
            text: None,
            url: None,
            selector: None,
            page_url: page_url.to_string(),
            timestamp_ms,
            success: true,
            detail: Value::Null,
        }
    }

    /// 由回放的 Action 还原轨迹条目
    pub fn from_replayed(action: &Action, page_url: &str, timestamp_ms: i64) -> Self {
        let mut entry = Self::new(action.method.clone(), page_url, timestamp_ms);
        if !action.selector.is_empty() {
            entry.selector = Some(action.selector.clone());
        }
        if action.method == "goto" {
            entry.url = action.arguments.first().cloned();
        } else if !action.arguments.is_empty() {
            entry.text = Some(action.arguments.join(" "));
        }
        entry.detail = serde_json::json!({ "replayed": true, "description": action.description });
        entry
    }
}

/// 一次工具调用映射为 Action 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayMapping {
    Step(Action),
    /// 非变更动作（截图、提取、done、自定义工具等），不进入回放序列
    NotApplicable,
    /// 需要选择器却没有拿到，整个运行不可回放
    Unreplayable(String),
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn keys_arg(args: &Value) -> Vec<String> {
    match args.get("keys") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|k| k.as_str().map(String::from))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn click_count(args: &Value) -> u64 {
    args.get("clicks").and_then(Value::as_u64).unwrap_or(1)
}

/// 纯映射：(工具名, 原始参数, 工具结果) → 动作
pub struct ActionMapper;

impl ActionMapper {
    pub fn map(
        tool_name: &str,
        args: &Value,
        outcome: &ToolOutcome,
        page_url: &str,
        timestamp_ms: i64,
    ) -> Vec<AgentAction> {
        let builtin = BuiltinTool::from_name(tool_name);
        let action_type = match builtin {
            Some(BuiltinTool::Click) if click_count(args) >= 2 => "double_click".to_string(),
            Some(tool) => tool.name().to_string(),
            None => tool_name.to_string(),
        };
        let mut action = AgentAction::new(action_type, page_url, timestamp_ms);
        action.success = outcome.success;
        action.selector = outcome.selector.clone();
        if let Some(point) = outcome.point {
            action.x = Some(point.x);
            action.y = Some(point.y);
        }

        match builtin {
            Some(BuiltinTool::Click) => {
                action.detail = serde_json::json!({
                    "button": str_arg(args, "button").unwrap_or("left"),
                });
            }
            Some(BuiltinTool::Type) => {
                action.text = str_arg(args, "text").map(String::from);
            }
            Some(BuiltinTool::Scroll) => {
                action.detail = serde_json::json!({
                    "scroll_x": args.get("scroll_x").cloned().unwrap_or(Value::from(0)),
                    "scroll_y": args.get("scroll_y").cloned().unwrap_or(Value::from(0)),
                });
            }
            Some(BuiltinTool::Drag) => {
                if let Some(end) = outcome.end_point {
                    action.detail = serde_json::json!({ "end_x": end.x, "end_y": end.y });
                }
            }
            Some(BuiltinTool::Keypress) => {
                action.text = Some(keys_arg(args).join("+"));
            }
            Some(BuiltinTool::Goto) => {
                action.url = str_arg(args, "url").map(String::from);
            }
            Some(BuiltinTool::Extract) => {
                action.text = str_arg(args, "instruction").map(String::from);
                action.detail = outcome.output.clone();
            }
            Some(BuiltinTool::Move) | Some(BuiltinTool::Screenshot) => {}
            None if tool_name == DONE_TOOL => {
                action.reasoning = str_arg(args, "reasoning").map(String::from);
                action.detail = serde_json::json!({
                    "success": args.get("success").and_then(Value::as_bool).unwrap_or(false),
                });
            }
            None => {
                action.detail = serde_json::json!({
                    "arguments": args,
                    "result": outcome.output,
                });
            }
        }
        vec![action]
    }

    pub fn replay_action(tool_name: &str, args: &Value, outcome: &ToolOutcome) -> ReplayMapping {
        if !outcome.success {
            return ReplayMapping::NotApplicable;
        }
        let Some(builtin) = BuiltinTool::from_name(tool_name) else {
            return ReplayMapping::NotApplicable;
        };
        let selector = outcome.selector.clone();
        let require_selector = |method: &str| {
            ReplayMapping::Unreplayable(format!("{} without a resolved selector", method))
        };

        let step = match builtin {
            BuiltinTool::Click => {
                let Some(selector) = selector else {
                    return require_selector("click");
                };
                let method = if click_count(args) >= 2 { "doubleClick" } else { "click" };
                Action {
                    description: format!("{} {}", method, selector),
                    selector,
                    method: method.to_string(),
                    arguments: Vec::new(),
                }
            }
            BuiltinTool::Type => {
                let text = str_arg(args, "text").unwrap_or_default().to_string();
                match selector {
                    Some(selector) => Action {
                        description: format!("fill {}", selector),
                        selector,
                        method: "fill".to_string(),
                        arguments: vec![text],
                    },
                    None => Action {
                        selector: String::new(),
                        description: "type into focused element".to_string(),
                        method: "type".to_string(),
                        arguments: vec![text],
                    },
                }
            }
            BuiltinTool::Scroll => {
                let dx = args.get("scroll_x").and_then(Value::as_i64).unwrap_or(0);
                let dy = args.get("scroll_y").and_then(Value::as_i64).unwrap_or(0);
                Action {
                    description: match &selector {
                        Some(s) => format!("scroll {}", s),
                        None => "scroll page".to_string(),
                    },
                    selector: selector.unwrap_or_default(),
                    method: "scroll".to_string(),
                    arguments: vec![dx.to_string(), dy.to_string()],
                }
            }
            BuiltinTool::Drag => {
                let (Some(selector), Some(end)) = (selector, outcome.end_point) else {
                    return require_selector("drag");
                };
                Action {
                    description: format!("drag {} to ({}, {})", selector, end.x, end.y),
                    selector,
                    method: "dragAndDrop".to_string(),
                    arguments: vec![end.x.to_string(), end.y.to_string()],
                }
            }
            BuiltinTool::Keypress => {
                let keys = keys_arg(args).join("+");
                Action {
                    selector: String::new(),
                    description: format!("press {}", keys),
                    method: "press".to_string(),
                    arguments: vec![keys],
                }
            }
            BuiltinTool::Goto => {
                let url = str_arg(args, "url").unwrap_or_default().to_string();
                Action {
                    selector: String::new(),
                    description: format!("navigate to {}", url),
                    method: "goto".to_string(),
                    arguments: vec![url],
                }
            }
            BuiltinTool::Move | BuiltinTool::Screenshot | BuiltinTool::Extract => {
                return ReplayMapping::NotApplicable;
            }
        };
        ReplayMapping::Step(step)
    }
}
