//! 清理守护进程
//!
//! 父进程启动浏览器后派生一个独立的守护进程；父进程无论以何种方式退出，
//! 守护进程都会终止浏览器（本地）或释放会话（远程）。

pub mod cleanup;
pub mod config;
pub mod runner;
pub mod spawn;

pub use cleanup::{
    cleanup_for, process_alive, should_remove_profile, LocalBrowserCleanup,
    RemoteSessionCleanup, SupervisorCleanup,
};
pub use config::{SupervisorConfig, SupervisorPayload, SupervisorSettings};
pub use runner::{run_supervisor, CleanupTrigger, Supervisor};
pub use spawn::SupervisorHandle;
