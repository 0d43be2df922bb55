//! 浏览器会话能力
//!
//! 底层协议会话（截图、点击、输入、滚动等原语）由外部实现；核心只通过 BrowserSession 调用。
//! 可选能力（如穿透 closed shadow root、元素定位记录）在会话建立时通过 capabilities() 一次性协商。

pub mod mock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agent::Action;
use crate::core::AgentError;

/// 浏览器原语错误
#[derive(Error, Debug, Clone)]
pub enum BrowserError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Screenshot failed: {0}")]
    Screenshot(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// 视口尺寸（CSS 像素）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1288, 711)
    }
}

/// 设备像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// 原语执行时解析出的目标元素
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementHit {
    /// 可回放的选择器（如 `xpath=/html/body/button[1]`）；未请求定位或定位失败时为 None
    pub selector: Option<String>,
}

impl ElementHit {
    pub fn at(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
        }
    }
}

/// 会话建立时协商的可选能力
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrowserCapabilities {
    /// 原语能否返回目标元素的选择器（回放缓存依赖）
    pub element_locators: bool,
    /// 能否穿透 closed shadow root 定位元素
    pub closed_shadow_roots: bool,
}

/// 浏览器会话；`locate` 为 true 时原语需额外解析目标元素选择器（有性能开销）
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn capabilities(&self) -> BrowserCapabilities {
        BrowserCapabilities::default()
    }

    async fn current_url(&self) -> String;

    /// 实测视口；无法测量时返回 None
    async fn viewport(&self) -> Option<Viewport>;

    /// PNG 截图
    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;

    async fn click(
        &self,
        point: Point,
        button: MouseButton,
        clicks: u32,
        locate: bool,
    ) -> Result<ElementHit, BrowserError>;

    /// 在 point 处（或当前焦点）输入文本
    async fn type_text(
        &self,
        text: &str,
        point: Option<Point>,
        locate: bool,
    ) -> Result<ElementHit, BrowserError>;

    async fn scroll(
        &self,
        point: Point,
        delta_x: i32,
        delta_y: i32,
        locate: bool,
    ) -> Result<ElementHit, BrowserError>;

    async fn drag(&self, path: &[Point], locate: bool) -> Result<ElementHit, BrowserError>;

    async fn move_mouse(&self, point: Point) -> Result<(), BrowserError>;

    async fn keypress(&self, keys: &[String]) -> Result<(), BrowserError>;

    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// 按自然语言指令（可选 schema）从页面提取数据
    async fn extract(&self, instruction: &str, schema: Option<&Value>)
        -> Result<Value, BrowserError>;

    /// 按选择器回放一条已记录的动作
    async fn perform(&self, action: &Action) -> Result<(), BrowserError>;
}

/// 启动浏览器会话（本地启动或远程创建）
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, BrowserError>;
}

/// 操作与计时器竞速；超时即拒绝，不重试
pub async fn with_timeout<F, T, E>(
    fut: F,
    limit: Option<Duration>,
    what: &str,
) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, E>>,
    AgentError: From<E>,
{
    match limit {
        None => fut.await.map_err(AgentError::from),
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(AgentError::from),
            Err(_) => Err(AgentError::Timeout {
                what: what.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
        },
    }
}

/// 带可选超时的会话启动
pub async fn launch_session(
    launcher: &dyn SessionLauncher,
    limit: Option<Duration>,
) -> Result<Arc<dyn BrowserSession>, AgentError> {
    let session = with_timeout(launcher.launch(), limit, "session launch").await?;
    tracing::info!(url = %session.current_url().await, "Browser session ready");
    Ok(session)
}
