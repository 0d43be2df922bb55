//! 流式远程执行：事件流解析与协议客户端

pub mod client;
pub mod parser;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use client::{resolve_base_url, StreamProtocolClient};
pub use parser::EventStreamParser;
pub use types::{
    resolve_cache_status, CacheStatus, CallOptions, LogEvent, LogMessage, RemoteOperation,
    RemoteResult, StreamError, StreamEvent, SystemEvent, SystemStatus,
};
