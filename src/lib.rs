//! Pilot - 浏览器智能体执行运行时
//!
//! 模块划分：
//! - **agent**: 步进循环、坐标归一化、动作映射、强制 done
//! - **browser**: 浏览器会话抽象与测试替身
//! - **cache**: 动作缓存与回放
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类
//! - **llm**: 模型客户端抽象、消息与用量
//! - **stream**: 远程执行的事件流解析与协议客户端
//! - **supervisor**: 父进程退出后的浏览器清理守护进程
//! - **tools**: 浏览器内置工具、自定义工具注册与执行器

pub mod agent;
pub mod browser;
pub mod cache;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod stream;
pub mod supervisor;
pub mod tools;

pub use agent::{AgentResult, RunOptions, StepLoop, StepLoopConfig};
pub use core::AgentError;
