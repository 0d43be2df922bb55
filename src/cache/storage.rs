//! 缓存存储：按键读写 JSON 文档
//!
//! 文件目录实现每个键一个 `{key}.json`，写入先落临时文件再 rename，读者看不到半写的文档；
//! 内存实现是进程内共享的一张表。两者都是后写覆盖，不做跨进程加锁。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache document is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Cache store unavailable: {0}")]
    Unavailable(String),
}

/// 键值存储 trait；read_json 返回 Ok(None) 表示不存在
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn read_json(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn write_json(&self, key: &str, value: &Value) -> Result<(), CacheError>;

    /// 是否启用（Disabled 实现返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 键只能映射为单个文件名，不允许路径分隔与 `..`
fn file_name(key: &str) -> Result<String, CacheError> {
    let trimmed = key.trim();
    if trimmed.is_empty() || trimmed.contains("..") {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    let sanitized: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    Ok(format!("{}.json", sanitized))
}

/// 文件目录存储
#[derive(Debug, Clone)]
pub struct FileCacheStorage {
    dir: PathBuf,
}

impl FileCacheStorage {
    /// 目录需已存在；通常经 open_file_storage 创建
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        Ok(self.dir.join(file_name(key)?))
    }
}

#[async_trait]
impl CacheStorage for FileCacheStorage {
    async fn read_json(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// 进程内存储；process_shared() 返回整个进程共用的同一张表
#[derive(Debug, Clone, Default)]
pub struct InMemoryCacheStorage {
    entries: Arc<RwLock<HashMap<String, Value>>>,
}

static PROCESS_SHARED: OnceLock<InMemoryCacheStorage> = OnceLock::new();

impl InMemoryCacheStorage {
    /// 独立的新表
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_shared() -> Self {
        PROCESS_SHARED.get_or_init(Self::new).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStorage for InMemoryCacheStorage {
    async fn read_json(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CacheError::Unavailable("in-memory cache lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    async fn write_json(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CacheError::Unavailable("in-memory cache lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// 空实现：目录不可用或未配置缓存时使用
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCacheStorage;

#[async_trait]
impl CacheStorage for DisabledCacheStorage {
    async fn read_json(&self, _key: &str) -> Result<Option<Value>, CacheError> {
        Ok(None)
    }

    async fn write_json(&self, _key: &str, _value: &Value) -> Result<(), CacheError> {
        Ok(())
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// 尽力创建目录；失败时记录警告并退化为 DisabledCacheStorage
pub async fn open_file_storage(dir: impl Into<PathBuf>) -> Arc<dyn CacheStorage> {
    let dir = dir.into();
    match tokio::fs::create_dir_all(&dir).await {
        Ok(()) => {
            tracing::info!(dir = %dir.display(), "Replay cache directory ready");
            Arc::new(FileCacheStorage::new(dir))
        }
        Err(e) => {
            tracing::warn!(
                dir = %dir.display(),
                error = %e,
                "Cannot create replay cache directory, caching disabled"
            );
            Arc::new(DisabledCacheStorage)
        }
    }
}
