//! AgentCache：按指令指纹记录与回放确定性的动作序列
//!
//! Persist 模式写入底层存储；BufferLatest 模式（服务端发起的临时运行）只保留最近一条，
//! 由 consume_buffered_entry 一次性交给调用方。

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::agent::{Action, ActionMapper, AgentAction, AgentResult};
use crate::browser::BrowserSession;
use crate::cache::{open_file_storage, CacheError, CacheStorage, InMemoryCacheStorage};
use crate::config::CacheSettings;
use crate::core::AgentError;
use crate::llm::TokenUsage;
use crate::tools::{ToolOutcome, DONE_TOOL};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Persist,
    BufferLatest,
}

/// 录制运行的 done 判断，回放时原样还原
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedVerdict {
    pub success: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// 回放单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub instruction: String,
    pub key: String,
    #[serde(default)]
    pub start_url: String,
    pub actions: Vec<Action>,
    /// 旧条目没有此字段，回放时按成功处理
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<CachedVerdict>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(instruction: &str, key: String, start_url: String, actions: Vec<Action>) -> Self {
        Self {
            instruction: instruction.to_string(),
            key,
            start_url,
            actions,
            verdict: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_verdict(mut self, verdict: CachedVerdict) -> Self {
        self.verdict = Some(verdict);
        self
    }
}

/// 键排序后的紧凑 JSON，与字段插入顺序无关
fn canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                canonical_json(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

pub struct AgentCache {
    storage: Arc<dyn CacheStorage>,
    mode: CacheMode,
    buffered: Mutex<Option<CacheEntry>>,
}

impl AgentCache {
    pub fn new(storage: Arc<dyn CacheStorage>, mode: CacheMode) -> Self {
        Self {
            storage,
            mode,
            buffered: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// 为 false 时步进循环不收集元素选择器
    pub fn is_replay_active(&self) -> bool {
        self.storage.enabled()
    }

    /// 按配置选择后端：指定目录用文件存储，否则用进程内共享表
    pub async fn from_settings(settings: &CacheSettings) -> Self {
        let storage: Arc<dyn CacheStorage> = match &settings.dir {
            Some(dir) => open_file_storage(dir.clone()).await,
            None => Arc::new(InMemoryCacheStorage::process_shared()),
        };
        Self::new(storage, settings.mode)
    }

    /// sha256(指令, 起始 URL, 模型, 步数上限, 输出 schema) 的十六进制
    pub fn fingerprint(
        instruction: &str,
        start_url: &str,
        model: &str,
        max_steps: u32,
        output_schema: Option<&Value>,
    ) -> String {
        let mut hasher = Sha256::new();
        for part in [instruction.trim(), start_url, model] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(max_steps.to_le_bytes());
        if let Some(schema) = output_schema {
            let mut canonical = String::new();
            canonical_json(schema, &mut canonical);
            hasher.update([1u8]);
            hasher.update(canonical.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// 读取失败或文档形状过期都视为未命中
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let value = match self.storage.read_json(key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Replay cache read failed");
                return None;
            }
        };
        match serde_json::from_value::<CacheEntry>(value) {
            Ok(entry) if !entry.actions.is_empty() => {
                tracing::debug!(key, actions = entry.actions.len(), "Replay cache hit");
                Some(entry)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Ignoring replay cache entry with unexpected shape");
                None
            }
        }
    }

    pub async fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        match self.mode {
            CacheMode::Persist => {
                let value = serde_json::to_value(&entry)?;
                self.storage.write_json(&entry.key, &value).await?;
                tracing::info!(key = %entry.key, actions = entry.actions.len(), "Stored replay entry");
            }
            CacheMode::BufferLatest => {
                let mut buffered = self
                    .buffered
                    .lock()
                    .map_err(|_| CacheError::Unavailable("buffer lock poisoned".to_string()))?;
                // 覆盖，不合并
                *buffered = Some(entry);
            }
        }
        Ok(())
    }

    /// 取走缓冲的条目；第二次调用返回 None
    pub fn consume_buffered_entry(&self) -> Option<CacheEntry> {
        self.buffered.lock().ok().and_then(|mut b| b.take())
    }

    /// 共享本实例存储做查找、只在自己的缓冲里记录的临时视图
    pub fn transient_view(&self) -> AgentCache {
        AgentCache::new(self.storage.clone(), CacheMode::BufferLatest)
    }

    /// 按顺序回放；任一步失败返回 ReplayFailed，由调用方改走实时运行
    pub async fn replay(
        &self,
        entry: &CacheEntry,
        browser: &dyn BrowserSession,
    ) -> Result<AgentResult, AgentError> {
        if entry.actions.is_empty() {
            return Err(AgentError::ReplayFailed {
                step: 0,
                reason: "entry has no actions".to_string(),
            });
        }
        tracing::info!(key = %entry.key, actions = entry.actions.len(), "Replaying cached actions");

        let mut actions = Vec::with_capacity(entry.actions.len());
        for (step, action) in entry.actions.iter().enumerate() {
            browser
                .perform(action)
                .await
                .map_err(|e| AgentError::ReplayFailed {
                    step,
                    reason: e.to_string(),
                })?;
            let page_url = browser.current_url().await;
            actions.push(AgentAction::from_replayed(
                action,
                &page_url,
                Utc::now().timestamp_millis(),
            ));
        }

        let replayed = actions.len();
        let verdict = entry.verdict.clone().unwrap_or_else(|| CachedVerdict {
            success: true,
            reasoning: String::new(),
            output: None,
        });
        // 与实时运行一致：轨迹以一条 done 结束
        let page_url = browser.current_url().await;
        actions.extend(ActionMapper::map(
            DONE_TOOL,
            &json!({ "success": verdict.success, "reasoning": verdict.reasoning }),
            &ToolOutcome::ok(json!({ "success": true, "acknowledged": true })),
            &page_url,
            Utc::now().timestamp_millis(),
        ));

        let message = if verdict.reasoning.trim().is_empty() {
            format!("Replayed {} cached actions", replayed)
        } else {
            verdict.reasoning.clone()
        };
        Ok(AgentResult {
            success: verdict.success,
            message,
            actions,
            completed: verdict.success,
            usage: TokenUsage::default(),
            messages: Vec::new(),
            output: verdict.output,
        })
    }
}
