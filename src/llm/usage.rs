//! Token 用量：单次运行的计数与调用方持有的累计用量汇聚
//!
//! UsageSink 由调用方构造并注入，多个并发运行各自持有自己的 sink，不共享全局计数器。

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// 单次推理或单次运行的用量；失败路径上也必须存在（全零）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub inference_time_ms: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.reasoning_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.reasoning_tokens += rhs.reasoning_tokens;
        self.cached_input_tokens += rhs.cached_input_tokens;
        self.inference_time_ms += rhs.inference_time_ms;
    }
}

/// 累计用量汇聚（克隆后共享同一组计数器）
#[derive(Debug, Clone, Default)]
pub struct UsageSink {
    input_tokens: Arc<AtomicU64>,
    output_tokens: Arc<AtomicU64>,
    reasoning_tokens: Arc<AtomicU64>,
    cached_input_tokens: Arc<AtomicU64>,
    inference_time_ms: Arc<AtomicU64>,
}

impl UsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: &TokenUsage) {
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
        self.reasoning_tokens
            .fetch_add(usage.reasoning_tokens, Ordering::Relaxed);
        self.cached_input_tokens
            .fetch_add(usage.cached_input_tokens, Ordering::Relaxed);
        self.inference_time_ms
            .fetch_add(usage.inference_time_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            reasoning_tokens: self.reasoning_tokens.load(Ordering::Relaxed),
            cached_input_tokens: self.cached_input_tokens.load(Ordering::Relaxed),
            inference_time_ms: self.inference_time_ms.load(Ordering::Relaxed),
        }
    }
}
