//! 内置浏览器工具：click / type / scroll / drag / move / keypress / goto / screenshot / extract
//!
//! BrowserToolbox 负责参数解码、坐标归一化并调用 BrowserSession 原语；
//! 参数只做反序列化，不做业务校验。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::CoordinateNormalizer;
use crate::browser::{BrowserSession, MouseButton, Point};
use crate::llm::{ImagePayload, ToolSpec};
use crate::tools::ToolOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTool {
    Click,
    Type,
    Scroll,
    Drag,
    Move,
    Keypress,
    Goto,
    Screenshot,
    Extract,
}

impl BuiltinTool {
    pub const ALL: [BuiltinTool; 9] = [
        BuiltinTool::Click,
        BuiltinTool::Type,
        BuiltinTool::Scroll,
        BuiltinTool::Drag,
        BuiltinTool::Move,
        BuiltinTool::Keypress,
        BuiltinTool::Goto,
        BuiltinTool::Screenshot,
        BuiltinTool::Extract,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinTool::Click => "click",
            BuiltinTool::Type => "type",
            BuiltinTool::Scroll => "scroll",
            BuiltinTool::Drag => "drag",
            BuiltinTool::Move => "move",
            BuiltinTool::Keypress => "keypress",
            BuiltinTool::Goto => "goto",
            BuiltinTool::Screenshot => "screenshot",
            BuiltinTool::Extract => "extract",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            BuiltinTool::Click => "Click at a point on the page. Use clicks=2 for a double click.",
            BuiltinTool::Type => "Type text, optionally clicking the point (x, y) first to focus it.",
            BuiltinTool::Scroll => "Scroll by (scroll_x, scroll_y) pixels with the mouse at (x, y).",
            BuiltinTool::Drag => "Drag the mouse along a path of at least two points.",
            BuiltinTool::Move => "Move the mouse to a point without clicking.",
            BuiltinTool::Keypress => "Press a key or key combination, e.g. [\"Control\", \"A\"].",
            BuiltinTool::Goto => "Navigate the current page to a URL.",
            BuiltinTool::Screenshot => "Capture a fresh screenshot of the current page.",
            BuiltinTool::Extract => "Extract structured data from the current page.",
        }
    }

    fn parameters(&self) -> Value {
        let point = json!({
            "x": { "type": "number" },
            "y": { "type": "number" }
        });
        match self {
            BuiltinTool::Click => json!({
                "type": "object",
                "properties": {
                    "x": point["x"], "y": point["y"],
                    "button": { "type": "string", "enum": ["left", "right", "middle"] },
                    "clicks": { "type": "integer", "minimum": 1 }
                },
                "required": ["x", "y"]
            }),
            BuiltinTool::Type => json!({
                "type": "object",
                "properties": { "text": { "type": "string" }, "x": point["x"], "y": point["y"] },
                "required": ["text"]
            }),
            BuiltinTool::Scroll => json!({
                "type": "object",
                "properties": {
                    "x": point["x"], "y": point["y"],
                    "scroll_x": { "type": "integer" },
                    "scroll_y": { "type": "integer" }
                },
                "required": ["x", "y"]
            }),
            BuiltinTool::Drag => json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "array",
                        "minItems": 2,
                        "items": { "type": "object", "properties": point, "required": ["x", "y"] }
                    }
                },
                "required": ["path"]
            }),
            BuiltinTool::Move => json!({
                "type": "object",
                "properties": point,
                "required": ["x", "y"]
            }),
            BuiltinTool::Keypress => json!({
                "type": "object",
                "properties": { "keys": { "type": "array", "items": { "type": "string" } } },
                "required": ["keys"]
            }),
            BuiltinTool::Goto => json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
            BuiltinTool::Screenshot => json!({ "type": "object", "properties": {} }),
            BuiltinTool::Extract => json!({
                "type": "object",
                "properties": {
                    "instruction": { "type": "string" },
                    "schema": { "type": "object" }
                },
                "required": ["instruction"]
            }),
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }

    pub fn all_specs() -> Vec<ToolSpec> {
        Self::ALL.iter().map(|t| t.spec()).collect()
    }
}

fn one() -> u32 {
    1
}

#[derive(Deserialize)]
struct ClickArgs {
    x: f64,
    y: f64,
    #[serde(default)]
    button: MouseButton,
    #[serde(default = "one")]
    clicks: u32,
}

#[derive(Deserialize)]
struct TypeArgs {
    text: String,
    x: Option<f64>,
    y: Option<f64>,
}

#[derive(Deserialize)]
struct ScrollArgs {
    x: f64,
    y: f64,
    #[serde(default)]
    scroll_x: i32,
    #[serde(default)]
    scroll_y: i32,
}

#[derive(Deserialize)]
struct PathPoint {
    x: f64,
    y: f64,
}

#[derive(Deserialize)]
struct DragArgs {
    path: Vec<PathPoint>,
}

#[derive(Deserialize)]
struct MoveArgs {
    x: f64,
    y: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Keys {
    Many(Vec<String>),
    One(String),
}

#[derive(Deserialize)]
struct KeypressArgs {
    keys: Keys,
}

#[derive(Deserialize)]
struct GotoArgs {
    url: String,
}

#[derive(Deserialize)]
struct ExtractArgs {
    instruction: String,
    schema: Option<Value>,
}

fn decode<T: for<'de> Deserialize<'de>>(tool: BuiltinTool, args: &Value) -> Result<T, String> {
    serde_json::from_value(args.clone())
        .map_err(|e| format!("Invalid arguments for {}: {}", tool.name(), e))
}

/// 绑定到一个浏览器会话的内置工具执行体
pub struct BrowserToolbox {
    browser: Arc<dyn BrowserSession>,
    normalizer: CoordinateNormalizer,
    /// 回放缓存启用且会话支持定位时才收集选择器
    locate: bool,
}

impl BrowserToolbox {
    pub fn new(browser: Arc<dyn BrowserSession>, normalizer: CoordinateNormalizer, locate: bool) -> Self {
        Self {
            browser,
            normalizer,
            locate,
        }
    }

    pub fn locate(&self) -> bool {
        self.locate
    }

    async fn point(&self, x: f64, y: f64) -> Point {
        let live = self.browser.viewport().await;
        self.normalizer.map(x, y, live)
    }

    pub async fn execute(&self, tool: BuiltinTool, args: &Value) -> Result<ToolOutcome, String> {
        let browser = &self.browser;
        match tool {
            BuiltinTool::Click => {
                let a: ClickArgs = decode(tool, args)?;
                let point = self.point(a.x, a.y).await;
                let hit = browser
                    .click(point, a.button, a.clicks.max(1), self.locate)
                    .await
                    .map_err(|e| e.to_string())?;
                let mut outcome = ToolOutcome::ok(json!({ "success": true, "x": point.x, "y": point.y }));
                outcome.point = Some(point);
                outcome.selector = hit.selector;
                Ok(outcome)
            }
            BuiltinTool::Type => {
                let a: TypeArgs = decode(tool, args)?;
                let point = match (a.x, a.y) {
                    (Some(x), Some(y)) => Some(self.point(x, y).await),
                    _ => None,
                };
                let hit = browser
                    .type_text(&a.text, point, self.locate)
                    .await
                    .map_err(|e| e.to_string())?;
                let mut outcome = ToolOutcome::ok(json!({ "success": true, "typed": a.text }));
                outcome.point = point;
                outcome.selector = hit.selector;
                Ok(outcome)
            }
            BuiltinTool::Scroll => {
                let a: ScrollArgs = decode(tool, args)?;
                let point = self.point(a.x, a.y).await;
                let hit = browser
                    .scroll(point, a.scroll_x, a.scroll_y, self.locate)
                    .await
                    .map_err(|e| e.to_string())?;
                let mut outcome = ToolOutcome::ok(json!({
                    "success": true,
                    "scroll_x": a.scroll_x,
                    "scroll_y": a.scroll_y
                }));
                outcome.point = Some(point);
                outcome.selector = hit.selector;
                Ok(outcome)
            }
            BuiltinTool::Drag => {
                let a: DragArgs = decode(tool, args)?;
                if a.path.len() < 2 {
                    return Err("drag requires at least two points".to_string());
                }
                let live = browser.viewport().await;
                let path: Vec<Point> = a
                    .path
                    .iter()
                    .map(|p| self.normalizer.map(p.x, p.y, live))
                    .collect();
                let hit = browser
                    .drag(&path, self.locate)
                    .await
                    .map_err(|e| e.to_string())?;
                let mut outcome = ToolOutcome::ok(json!({ "success": true, "points": path.len() }));
                outcome.point = path.first().copied();
                outcome.end_point = path.last().copied();
                outcome.selector = hit.selector;
                Ok(outcome)
            }
            BuiltinTool::Move => {
                let a: MoveArgs = decode(tool, args)?;
                let point = self.point(a.x, a.y).await;
                browser.move_mouse(point).await.map_err(|e| e.to_string())?;
                let mut outcome = ToolOutcome::ok(json!({ "success": true }));
                outcome.point = Some(point);
                Ok(outcome)
            }
            BuiltinTool::Keypress => {
                let a: KeypressArgs = decode(tool, args)?;
                let keys = match a.keys {
                    Keys::Many(keys) => keys,
                    Keys::One(key) => vec![key],
                };
                if keys.is_empty() {
                    return Err("keypress requires at least one key".to_string());
                }
                browser.keypress(&keys).await.map_err(|e| e.to_string())?;
                Ok(ToolOutcome::ok(json!({ "success": true, "keys": keys })))
            }
            BuiltinTool::Goto => {
                let a: GotoArgs = decode(tool, args)?;
                if a.url.trim().is_empty() {
                    return Err("goto requires a non-empty url".to_string());
                }
                browser.navigate(&a.url).await.map_err(|e| e.to_string())?;
                Ok(ToolOutcome::ok(json!({ "success": true, "url": a.url })))
            }
            BuiltinTool::Screenshot => {
                let png = browser.screenshot().await.map_err(|e| e.to_string())?;
                let mut outcome = ToolOutcome::ok(json!({ "success": true, "screenshot": "attached" }));
                outcome.images = vec![ImagePayload::png(&png)];
                Ok(outcome)
            }
            BuiltinTool::Extract => {
                let a: ExtractArgs = decode(tool, args)?;
                let data = browser
                    .extract(&a.instruction, a.schema.as_ref())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(ToolOutcome::ok(json!({ "success": true, "data": data })))
            }
        }
    }
}
