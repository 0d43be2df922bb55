//! 回放缓存：键值存储与动作序列的记录 / 回放

pub mod agent_cache;
pub mod storage;

pub use agent_cache::{AgentCache, CacheEntry, CacheMode, CachedVerdict};
pub use storage::{
    open_file_storage, CacheError, CacheStorage, DisabledCacheStorage, FileCacheStorage,
    InMemoryCacheStorage,
};
