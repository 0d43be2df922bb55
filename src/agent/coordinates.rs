//! 坐标归一化：把模型上报的坐标映射为设备像素
//!
//! - 0–999 缩放坐标（Google computer-use 系列）：先钳制到 [0, 999] 再按视口等比映射
//! - [0, 1] 归一化坐标（配置中的 normalized_models）：仅当原始值 ≤ 1 时才视为归一化并乘以视口
//! - 其余厂商原样透传
//!
//! 纯函数且全定义：从不失败，只做钳制。
//!
//! 已知边界情况：归一化模型在原点附近给出的真实像素值（0 或 1）也会被当作归一化坐标，
//! 映射到视口的最左/最右。保留该启发式，不做静默修正。

use serde::{Deserialize, Serialize};

use crate::browser::{Point, Viewport};
use crate::llm::ModelProvider;

const SCALED_MAX: f64 = 999.0;
const SCALED_RANGE: f64 = 1000.0;

/// 模型输出使用的坐标系
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    Pixels,
    Scaled1000,
    Unit,
}

impl CoordinateSpace {
    /// 由厂商与模型名决定坐标系；normalized_models 为模型名子串列表（大小写不敏感）
    pub fn detect(provider: ModelProvider, model: &str, normalized_models: &[String]) -> Self {
        if provider == ModelProvider::Google {
            return CoordinateSpace::Scaled1000;
        }
        let model = model.to_lowercase();
        if normalized_models
            .iter()
            .any(|m| !m.is_empty() && model.contains(&m.to_lowercase()))
        {
            return CoordinateSpace::Unit;
        }
        CoordinateSpace::Pixels
    }
}

/// 视口解析优先级：固定 stealth 视口 → 页面实测视口 → 静态配置的兜底值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportResolver {
    pub stealth: Option<Viewport>,
    pub fallback: Viewport,
}

impl ViewportResolver {
    pub fn new(stealth: Option<Viewport>, fallback: Viewport) -> Self {
        Self { stealth, fallback }
    }

    pub fn resolve(&self, live: Option<Viewport>) -> Viewport {
        self.stealth
            .or(live.filter(|v| v.width > 0 && v.height > 0))
            .unwrap_or(self.fallback)
    }
}

impl Default for ViewportResolver {
    fn default() -> Self {
        Self::new(None, Viewport::default())
    }
}

/// 单轴映射
fn normalize_axis(raw: f64, space: CoordinateSpace, extent: u32) -> i32 {
    let raw = if raw.is_finite() { raw } else { 0.0 };
    let max_pixel = extent.saturating_sub(1) as f64;
    match space {
        CoordinateSpace::Pixels => raw.round() as i32,
        CoordinateSpace::Scaled1000 => {
            let scaled = raw.clamp(0.0, SCALED_MAX) / SCALED_RANGE * extent as f64;
            scaled.floor().min(max_pixel) as i32
        }
        CoordinateSpace::Unit if raw <= 1.0 => {
            let scaled = raw.clamp(0.0, 1.0) * extent as f64;
            scaled.floor().min(max_pixel) as i32
        }
        CoordinateSpace::Unit => raw.round() as i32,
    }
}

/// 把 (x, y) 映射为设备像素
pub fn normalize_point(x: f64, y: f64, space: CoordinateSpace, viewport: Viewport) -> Point {
    Point::new(
        normalize_axis(x, space, viewport.width),
        normalize_axis(y, space, viewport.height),
    )
}

/// 绑定了坐标系与视口解析策略的归一化器
#[derive(Debug, Clone, Copy)]
pub struct CoordinateNormalizer {
    pub space: CoordinateSpace,
    pub viewports: ViewportResolver,
}

impl CoordinateNormalizer {
    pub fn new(space: CoordinateSpace, viewports: ViewportResolver) -> Self {
        Self { space, viewports }
    }

    pub fn map(&self, x: f64, y: f64, live: Option<Viewport>) -> Point {
        normalize_point(x, y, self.space, self.viewports.resolve(live))
    }
}
