//! 对话消息：文本、图片、工具调用与工具结果
//!
//! 与具体模型厂商格式无关；各 LlmClient 实现自行转换为对应的请求结构。

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 截图等图片负载（base64 编码）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub media_type: String,
    pub data: String,
}

impl ImagePayload {
    /// 将 PNG 原始字节编码为图片负载
    pub fn png(bytes: &[u8]) -> Self {
        Self {
            media_type: "image/png".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// 消息内容片段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image: ImagePayload },
}

/// 模型请求的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn text_only(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text { text: text.into() }],
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text_only(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text_only(Role::User, content)
    }

    /// 带图片的 user 消息（截图 grounding、图片回灌）
    pub fn user_with_images(text: impl Into<String>, images: Vec<ImagePayload>) -> Self {
        let mut msg = Self::user(text);
        msg.content
            .extend(images.into_iter().map(|image| ContentPart::Image { image }));
        msg
    }

    /// assistant 回合：可选文本 + 工具调用
    pub fn assistant(text: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text
                .filter(|t| !t.is_empty())
                .map(|text| vec![ContentPart::Text { text }])
                .unwrap_or_default(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// 工具结果；images 为空时只有结构化文本
    pub fn tool_result(call_id: impl Into<String>, output: &Value, images: Vec<ImagePayload>) -> Self {
        let mut content = vec![ContentPart::Text {
            text: output.to_string(),
        }];
        content.extend(images.into_iter().map(|image| ContentPart::Image { image }));
        Self {
            role: Role::Tool,
            content,
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// 拼接所有文本片段
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn image_count(&self) -> usize {
        self.content
            .iter()
            .filter(|p| matches!(p, ContentPart::Image { .. }))
            .count()
    }
}
