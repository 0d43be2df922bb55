//! 内存中的假浏览器会话（用于测试）
//!
//! 记录每次原语调用；click/type/scroll/drag 在 locate=true 且启用定位能力时返回确定性的 xpath。

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::Action;
use crate::browser::{
    BrowserCapabilities, BrowserError, BrowserSession, ElementHit, MouseButton, Point, Viewport,
};

pub struct FakeBrowser {
    url: Mutex<String>,
    viewport: Option<Viewport>,
    locators: bool,
    screenshot_fails: bool,
    screenshot_delay: Option<Duration>,
    fail_perform_at: Option<usize>,
    performed: Mutex<usize>,
    ops: Mutex<Vec<String>>,
}

impl FakeBrowser {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Mutex::new(url.into()),
            viewport: Some(Viewport::new(1000, 800)),
            locators: true,
            screenshot_fails: false,
            screenshot_delay: None,
            fail_perform_at: None,
            performed: Mutex::new(0),
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn with_viewport(mut self, viewport: Option<Viewport>) -> Self {
        self.viewport = viewport;
        self
    }

    pub fn with_locators(mut self, enabled: bool) -> Self {
        self.locators = enabled;
        self
    }

    pub fn failing_screenshots(mut self) -> Self {
        self.screenshot_fails = true;
        self
    }

    pub fn with_screenshot_delay(mut self, delay: Duration) -> Self {
        self.screenshot_delay = Some(delay);
        self
    }

    /// 第 index 次 perform（从 0 计）返回 ElementNotFound
    pub fn failing_perform_at(mut self, index: usize) -> Self {
        self.fail_perform_at = Some(index);
        self
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().map(|o| o.clone()).unwrap_or_default()
    }

    fn record(&self, op: String) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(op);
        }
    }

    fn hit(&self, point: Point, locate: bool) -> ElementHit {
        if locate && self.locators {
            ElementHit::at(format!("xpath=//*[@data-point='{},{}']", point.x, point.y))
        } else {
            ElementHit::default()
        }
    }
}

#[async_trait]
impl BrowserSession for FakeBrowser {
    fn capabilities(&self) -> BrowserCapabilities {
        BrowserCapabilities {
            element_locators: self.locators,
            closed_shadow_roots: false,
        }
    }

    async fn current_url(&self) -> String {
        self.url.lock().map(|u| u.clone()).unwrap_or_default()
    }

    async fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        if let Some(delay) = self.screenshot_delay {
            tokio::time::sleep(delay).await;
        }
        self.record("screenshot".to_string());
        if self.screenshot_fails {
            return Err(BrowserError::Screenshot("page crashed".to_string()));
        }
        Ok(b"\x89PNG\r\n\x1a\nfake".to_vec())
    }

    async fn click(
        &self,
        point: Point,
        button: MouseButton,
        clicks: u32,
        locate: bool,
    ) -> Result<ElementHit, BrowserError> {
        self.record(format!("click({},{},{:?},{})", point.x, point.y, button, clicks));
        Ok(self.hit(point, locate))
    }

    async fn type_text(
        &self,
        text: &str,
        point: Option<Point>,
        locate: bool,
    ) -> Result<ElementHit, BrowserError> {
        self.record(format!("type({})", text));
        Ok(point.map(|p| self.hit(p, locate)).unwrap_or_default())
    }

    async fn scroll(
        &self,
        point: Point,
        delta_x: i32,
        delta_y: i32,
        locate: bool,
    ) -> Result<ElementHit, BrowserError> {
        self.record(format!("scroll({},{},{},{})", point.x, point.y, delta_x, delta_y));
        Ok(self.hit(point, locate))
    }

    async fn drag(&self, path: &[Point], locate: bool) -> Result<ElementHit, BrowserError> {
        let start = path
            .first()
            .copied()
            .ok_or_else(|| BrowserError::Protocol("empty drag path".to_string()))?;
        self.record(format!("drag({} points)", path.len()));
        Ok(self.hit(start, locate))
    }

    async fn move_mouse(&self, point: Point) -> Result<(), BrowserError> {
        self.record(format!("move({},{})", point.x, point.y));
        Ok(())
    }

    async fn keypress(&self, keys: &[String]) -> Result<(), BrowserError> {
        self.record(format!("keypress({})", keys.join("+")));
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.record(format!("goto({})", url));
        if let Ok(mut current) = self.url.lock() {
            *current = url.to_string();
        }
        Ok(())
    }

    async fn extract(
        &self,
        instruction: &str,
        _schema: Option<&Value>,
    ) -> Result<Value, BrowserError> {
        self.record(format!("extract({})", instruction));
        Ok(serde_json::json!({ "extraction": instruction }))
    }

    async fn perform(&self, action: &Action) -> Result<(), BrowserError> {
        let index = {
            let mut performed = self
                .performed
                .lock()
                .map_err(|_| BrowserError::Protocol("poisoned".to_string()))?;
            let index = *performed;
            *performed += 1;
            index
        };
        if self.fail_perform_at == Some(index) {
            return Err(BrowserError::ElementNotFound(action.selector.clone()));
        }
        if action.method == "goto" {
            if let (Ok(mut current), Some(url)) = (self.url.lock(), action.arguments.first()) {
                *current = url.clone();
            }
        }
        self.record(format!("perform({} {})", action.method, action.selector));
        Ok(())
    }
}
