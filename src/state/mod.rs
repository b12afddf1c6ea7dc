//! 运行时状态模块
//!
//! 进程级上下文与全局 shutdown token

pub mod context;

pub use context::{get_shutdown_token, trigger_shutdown, BenchContext};
